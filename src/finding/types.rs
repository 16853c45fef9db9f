use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Closed set of finding kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FindingKind {
    Crash,
    Timeout,
    OutOfMemory,
    SanitizerError,
    Leak,
}

impl FindingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Crash => "crash",
            Self::Timeout => "timeout",
            Self::OutOfMemory => "out-of-memory",
            Self::SanitizerError => "sanitizer-error",
            Self::Leak => "leak",
        }
    }
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)?;
        if let Some(column) = self.column {
            write!(f, ":{}", column)?;
        }
        Ok(())
    }
}

/// One symbolized frame of a sanitizer or libFuzzer stack trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackFrame {
    pub index: u32,
    pub function: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
}

impl StackFrame {
    /// Frames inside the sanitizer or fuzzer runtime say nothing about the bug.
    pub fn is_runtime(&self) -> bool {
        const RUNTIME_PATHS: &[&str] = &[
            "compiler-rt/",
            "/libfuzzer/",
            "/libFuzzer/",
            "sanitizer_common/",
            "/asan/",
            "/ubsan/",
            "/msan/",
            "/lsan/",
            "/tsan/",
        ];
        const RUNTIME_FUNCTIONS: &[&str] = &[
            "__sanitizer",
            "__asan",
            "__ubsan",
            "__msan",
            "__lsan",
            "__tsan",
            "__interceptor_",
            "fuzzer::",
            "__libc_start",
            "_start",
        ];

        if RUNTIME_FUNCTIONS.iter().any(|p| self.function.starts_with(p)) {
            return true;
        }
        match &self.location {
            Some(loc) => RUNTIME_PATHS.iter().any(|p| loc.file.contains(p)),
            None => false,
        }
    }
}

/// A structured diagnostic recognized in the fuzzer's output. Immutable once
/// created.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_location: Option<SourceLocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_file: Option<PathBuf>,
    /// Stable deduplication key
    pub identity: String,
    pub input_data_available: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stack_trace: Vec<StackFrame>,
    pub timestamp: DateTime<Utc>,
}

impl Finding {
    /// Short label used by the human renderer.
    pub fn title(&self) -> String {
        match &self.source_location {
            Some(loc) => format!("{} in {}", self.details, loc),
            None => self.details.clone(),
        }
    }
}
