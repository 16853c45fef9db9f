//! `KEY=VALUE` environment list helpers.
//!
//! Environments are kept as ordered lists so that the exact value handed to
//! a child (or to the sandbox wrapper) is visible in logs and tests.

/// Split `KEY=VALUE` into its parts. The key must be non-empty.
pub fn split_entry(entry: &str) -> Option<(&str, &str)> {
    match entry.split_once('=') {
        Some((key, value)) if !key.is_empty() => Some((key, value)),
        _ => None,
    }
}

/// Set `key` in `env`, replacing an existing entry in place.
pub fn set(env: &mut Vec<String>, key: &str, value: &str) {
    let entry = format!("{}={}", key, value);
    match env
        .iter_mut()
        .find(|e| split_entry(e).map(|(k, _)| k == key).unwrap_or(false))
    {
        Some(existing) => *existing = entry,
        None => env.push(entry),
    }
}

pub fn get<'a>(env: &'a [String], key: &str) -> Option<&'a str> {
    env.iter()
        .filter_map(|e| split_entry(e))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

/// Merge `extra` over `base`: entries of `extra` win, order of `base` is kept.
pub fn merge(base: &[String], extra: &[String]) -> Vec<String> {
    let mut merged = base.to_vec();
    for entry in extra {
        if let Some((key, value)) = split_entry(entry) {
            set(&mut merged, key, value);
        }
    }
    merged
}

/// The current process environment as `KEY=VALUE` entries.
pub fn current() -> Vec<String> {
    std::env::vars_os()
        .filter_map(|(k, v)| Some(format!("{}={}", k.to_str()?, v.to_str()?)))
        .collect()
}

/// Pairs ready for `Command::envs`.
pub fn pairs(env: &[String]) -> impl Iterator<Item = (&str, &str)> {
    env.iter().filter_map(|e| split_entry(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_existing_key() {
        let mut env = vec!["A=1".to_string(), "B=2".to_string()];
        set(&mut env, "A", "3");
        set(&mut env, "C", "x=y");
        assert_eq!(env, vec!["A=3", "B=2", "C=x=y"]);
        assert_eq!(get(&env, "C"), Some("x=y"));
    }

    #[test]
    fn merge_keeps_base_order_and_extra_wins() {
        let base = vec!["PATH=/bin".to_string(), "HOME=/root".to_string()];
        let extra = vec!["HOME=/tmp".to_string(), "ASAN_OPTIONS=detect_leaks=0".to_string()];
        let merged = merge(&base, &extra);
        assert_eq!(merged, vec!["PATH=/bin", "HOME=/tmp", "ASAN_OPTIONS=detect_leaks=0"]);
    }

    #[test]
    fn split_rejects_empty_key() {
        assert_eq!(split_entry("=value"), None);
        assert_eq!(split_entry("novalue"), None);
        assert_eq!(split_entry("K="), Some(("K", "")));
    }
}
