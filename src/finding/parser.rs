//! Incremental parser for libFuzzer and sanitizer output.
//!
//! The parser is fed raw chunks in arrival order and assembles them into
//! lines, so a banner split across reads is handled. Each line is checked
//! against a fixed, ordered set of recognizers:
//!
//! 1. libFuzzer banner (`==N== ERROR: libFuzzer: ...`): crash, timeout or out-of-memory
//! 2. sanitizer banner (`==N==ERROR: AddressSanitizer: ...`): crash, leak or out-of-memory
//! 3. UBSan runtime error (`file:line:col: runtime error: ...`): sanitizer-error
//!
//! A recognized banner opens a report block. Fatal blocks end at
//! `Test unit written to`, the next banner, or end of stream. Recoverable
//! blocks (UBSan, data races) end at their `SUMMARY:` line or at the next
//! engine status line. A block longer than [`MAX_PENDING_LINES`] is given up
//! and its lines are passed through.

use crate::core::types::FuzzerStats;
use crate::finding::signature::{identity, AddressInsensitive, SignatureNormalizer};
use crate::finding::types::{Finding, FindingKind, SourceLocation, StackFrame};
use chrono::Utc;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;

pub const MAX_PENDING_LINES: usize = 512;

/// Longest partial line kept while waiting for its newline
const MAX_LINE_BYTES: usize = 64 * 1024;

static LIBFUZZER_BANNER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^==\d+==\s*ERROR: libFuzzer: (.+?)\s*$").unwrap());
static SANITIZER_BANNER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:==\d+==\s*)?(ERROR|WARNING): (\w+Sanitizer): (.+?)\s*$").unwrap()
});
static UBSAN_RUNTIME_ERROR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\S+?):(\d+):(\d+): runtime error: (.+?)\s*$").unwrap());
static STACK_FRAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*#(\d+) 0x[0-9a-fA-F]+ in (.+?)(?: (\S+?):(\d+)(?::(\d+))?)?\s*$").unwrap()
});
static TEST_UNIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"Test unit written to (\S.*?)\s*$").unwrap());
static STATUS_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^#(\d+)\s+(INITED|NEW|REDUCE|pulse|DONE|RELOAD|READ)\b").unwrap()
});
static EXEC_RATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"exec/s: (\d+)").unwrap());
static COVERAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"cov: (\d+)").unwrap());
static CORPUS: Lazy<Regex> = Lazy::new(|| Regex::new(r"corp: (\d+)/").unwrap());
static DONE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Done (\d+) runs in (\d+) second").unwrap());

/// What one line of output turned into.
#[derive(Debug)]
pub enum ParseEvent {
    Finding(Finding),
    Stats(FuzzerStats),
    /// Output that is not part of a finding; shown only in verbose mode
    Passthrough(String),
}

struct PendingReport {
    kind: FindingKind,
    details: String,
    recoverable: bool,
    location: Option<SourceLocation>,
    frames: Vec<StackFrame>,
    /// Only the first stack trace of a report is kept
    stack_closed: bool,
    input_file: Option<PathBuf>,
    lines: Vec<String>,
}

impl PendingReport {
    fn new(kind: FindingKind, details: String, recoverable: bool, banner: &str) -> Self {
        Self {
            kind,
            details,
            recoverable,
            location: None,
            frames: Vec::new(),
            stack_closed: false,
            input_file: None,
            lines: vec![banner.to_string()],
        }
    }

    fn push_line(&mut self, line: &str) {
        self.lines.push(line.to_string());
        if self.stack_closed {
            return;
        }
        if let Some(frame) = parse_frame(line) {
            self.frames.push(frame);
        } else if !self.frames.is_empty() && !line.trim().is_empty() {
            self.stack_closed = true;
        }
    }

    fn into_finding(self, normalizer: &dyn SignatureNormalizer) -> (Finding, Vec<String>) {
        let location = self.location.or_else(|| {
            self.frames
                .iter()
                .filter(|f| !f.is_runtime())
                .find_map(|f| f.location.clone())
        });
        let identity = identity(self.kind, &self.details, &self.frames, normalizer);

        let finding = Finding {
            kind: self.kind,
            details: self.details,
            source_location: location,
            input_data_available: self.input_file.is_some(),
            input_file: self.input_file,
            identity,
            stack_trace: self.frames,
            timestamp: Utc::now(),
        };
        (finding, self.lines)
    }
}

pub struct FindingParser {
    normalizer: Box<dyn SignatureNormalizer>,
    partial: Vec<u8>,
    pending: Option<PendingReport>,
    max_pending_lines: usize,
}

impl Default for FindingParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FindingParser {
    pub fn new() -> Self {
        Self::with_normalizer(Box::new(AddressInsensitive))
    }

    pub fn with_normalizer(normalizer: Box<dyn SignatureNormalizer>) -> Self {
        Self {
            normalizer,
            partial: Vec::new(),
            pending: None,
            max_pending_lines: MAX_PENDING_LINES,
        }
    }

    pub fn with_max_pending_lines(mut self, max: usize) -> Self {
        self.max_pending_lines = max.max(1);
        self
    }

    pub fn normalizer(&self) -> &dyn SignatureNormalizer {
        self.normalizer.as_ref()
    }

    /// Feed one chunk of raw output.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ParseEvent> {
        let mut events = Vec::new();
        self.partial.extend_from_slice(chunk);

        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=pos).collect();
            let line = decode_line(&raw[..raw.len() - 1]);
            self.process_line(&line, &mut events);
        }

        if self.partial.len() > MAX_LINE_BYTES {
            let raw = std::mem::take(&mut self.partial);
            let line = decode_line(&raw);
            self.process_line(&line, &mut events);
        }

        events
    }

    /// Feed one complete line.
    pub fn feed_line(&mut self, line: &str) -> Vec<ParseEvent> {
        let mut events = Vec::new();
        self.process_line(line.trim_end_matches(&['\r', '\n'][..]), &mut events);
        events
    }

    /// End of stream: flush the trailing partial line and any open report.
    pub fn finish(&mut self) -> Vec<ParseEvent> {
        let mut events = Vec::new();
        if !self.partial.is_empty() {
            let raw = std::mem::take(&mut self.partial);
            let line = decode_line(&raw);
            self.process_line(&line, &mut events);
        }
        self.finalize_pending(&mut events);
        events
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<ParseEvent>) {
        if let Some(report) = recognize_banner(line) {
            self.finalize_pending(events);
            self.pending = Some(report);
            return;
        }

        let is_status = STATUS_LINE.is_match(line) || DONE_LINE.is_match(line);
        let recoverable_open = self.pending.as_ref().map(|p| p.recoverable).unwrap_or(false);
        if recoverable_open && is_status {
            self.finalize_pending(events);
        }

        if let Some(pending) = self.pending.as_mut() {
            pending.push_line(line);

            if let Some(caps) = TEST_UNIT.captures(line) {
                pending.input_file = Some(PathBuf::from(&caps[1]));
                self.finalize_pending(events);
            } else if pending.recoverable && line.starts_with("SUMMARY: ") {
                self.finalize_pending(events);
            } else if pending.lines.len() > self.max_pending_lines {
                self.abandon_pending(events);
            }
            return;
        }

        if let Some(stats) = parse_stats(line) {
            events.push(ParseEvent::Stats(stats));
        }
        events.push(ParseEvent::Passthrough(line.to_string()));
    }

    fn finalize_pending(&mut self, events: &mut Vec<ParseEvent>) {
        if let Some(pending) = self.pending.take() {
            let (finding, lines) = pending.into_finding(self.normalizer.as_ref());
            debug!(
                "Recognized {} finding {} ({} lines)",
                finding.kind,
                finding.identity,
                lines.len()
            );
            events.extend(lines.into_iter().map(ParseEvent::Passthrough));
            events.push(ParseEvent::Finding(finding));
        }
    }

    fn abandon_pending(&mut self, events: &mut Vec<ParseEvent>) {
        if let Some(pending) = self.pending.take() {
            warn!(
                "Discarding incomplete {} report after {} lines without a terminator",
                pending.kind,
                pending.lines.len()
            );
            events.extend(pending.lines.into_iter().map(ParseEvent::Passthrough));
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let line = String::from_utf8_lossy(raw);
    line.trim_end_matches('\r').to_string()
}

fn recognize_banner(line: &str) -> Option<PendingReport> {
    if let Some(caps) = LIBFUZZER_BANNER.captures(line) {
        let details = caps[1].to_string();
        let kind = if details.starts_with("timeout") {
            FindingKind::Timeout
        } else if details.starts_with("out-of-memory") || details.starts_with("malloc limit") {
            FindingKind::OutOfMemory
        } else {
            FindingKind::Crash
        };
        return Some(PendingReport::new(kind, details, false, line));
    }

    if let Some(caps) = SANITIZER_BANNER.captures(line) {
        let severity = &caps[1];
        let sanitizer = &caps[2];
        let details = caps[3].to_string();
        let (kind, recoverable) = sanitizer_kind(severity, sanitizer, &details);
        return Some(PendingReport::new(kind, details, recoverable, line));
    }

    if let Some(caps) = UBSAN_RUNTIME_ERROR.captures(line) {
        let mut report = PendingReport::new(
            FindingKind::SanitizerError,
            format!("undefined behaviour: {}", &caps[4]),
            true,
            line,
        );
        report.location = Some(SourceLocation {
            file: caps[1].to_string(),
            line: caps[2].parse().unwrap_or(0),
            column: caps[3].parse().ok(),
        });
        return Some(report);
    }

    None
}

fn sanitizer_kind(severity: &str, sanitizer: &str, details: &str) -> (FindingKind, bool) {
    const OOM_MARKERS: &[&str] = &[
        "out of memory",
        "out-of-memory",
        "allocation-size-too-big",
        "requested allocation size",
    ];

    if sanitizer == "LeakSanitizer" {
        return (FindingKind::Leak, false);
    }
    if OOM_MARKERS.iter().any(|m| details.contains(m)) {
        return (FindingKind::OutOfMemory, false);
    }
    if severity == "ERROR" || sanitizer == "MemorySanitizer" {
        return (FindingKind::Crash, false);
    }
    (FindingKind::SanitizerError, true)
}

fn parse_frame(line: &str) -> Option<StackFrame> {
    let caps = STACK_FRAME.captures(line)?;
    let location = match (caps.get(3), caps.get(4)) {
        (Some(file), Some(line_no)) => Some(SourceLocation {
            file: file.as_str().to_string(),
            line: line_no.as_str().parse().ok()?,
            column: caps.get(5).and_then(|c| c.as_str().parse().ok()),
        }),
        _ => None,
    };
    Some(StackFrame {
        index: caps[1].parse().ok()?,
        function: caps[2].to_string(),
        location,
    })
}

fn parse_stats(line: &str) -> Option<FuzzerStats> {
    if let Some(caps) = DONE_LINE.captures(line) {
        let executions: u64 = caps[1].parse().ok()?;
        let seconds: u64 = caps[2].parse().ok()?;
        return Some(FuzzerStats {
            executions,
            exec_per_sec: executions.checked_div(seconds),
            ..Default::default()
        });
    }

    let caps = STATUS_LINE.captures(line)?;
    let capture_u64 = |re: &Regex| {
        re.captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    };
    Some(FuzzerStats {
        executions: caps[1].parse().ok()?,
        exec_per_sec: capture_u64(&EXEC_RATE),
        coverage: capture_u64(&COVERAGE),
        corpus_entries: capture_u64(&CORPUS),
    })
}
