//! Parsing and formatting for CLI duration values ("500ms", "30s", "5m", "2h").

use crate::config::types::{FuzzError, Result};
use std::time::Duration;

/// Parse a duration flag. A bare number is seconds; `0` means unbounded.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(FuzzError::Config("empty duration".to_string()));
    }

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num_part, unit_part) = s.split_at(split);
    if num_part.is_empty() {
        return Err(FuzzError::Config(format!(
            "invalid duration {:?} (missing number)",
            input
        )));
    }
    let value: u64 = num_part
        .parse()
        .map_err(|_| FuzzError::Config(format!("invalid duration number in {:?}", input)))?;

    let dur = match unit_part {
        "" | "s" => Duration::from_secs(value),
        "ms" => Duration::from_millis(value),
        "m" => Duration::from_secs(value.saturating_mul(60)),
        "h" => Duration::from_secs(value.saturating_mul(60 * 60)),
        other => {
            return Err(FuzzError::Config(format!(
                "invalid duration unit {:?} (expected ms|s|m|h)",
                other
            )))
        }
    };
    Ok(dur)
}

/// Compact rendering such as `1h2m3s` or `450ms`.
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    if total == 0 {
        return format!("{}ms", d.as_millis());
    }
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{}h", h));
    }
    if h > 0 || m > 0 {
        out.push_str(&format!("{}m", m));
    }
    out.push_str(&format!("{}s", s));
    out
}
