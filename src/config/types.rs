use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// How findings and final metrics are rendered for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Colored text meant for a terminal
    #[default]
    Human,
    /// One JSON object per line
    Json,
}

/// Immutable input to a single fuzz run.
#[derive(Debug, Clone)]
pub struct RunConfiguration {
    /// Instrumented fuzz target executable
    pub executable: PathBuf,
    /// Writable corpus directory, created when absent
    pub primary_seed_dir: PathBuf,
    /// Read-only seed directories (user supplied plus the build seed corpus)
    pub additional_seed_dirs: Vec<PathBuf>,
    /// Optional fuzzing dictionary
    pub dictionary: Option<PathBuf>,
    /// Arguments consumed by the fuzzing engine
    pub engine_args: Vec<String>,
    /// Arguments forwarded unchanged to the target
    pub target_args: Vec<String>,
    /// Wall-clock limit for the whole run; zero means unbounded
    pub timeout: Duration,
    /// Run the target under the sandbox
    pub use_sandbox: bool,
    pub verbose: bool,
    pub output_format: OutputFormat,
    /// Directory crash artifacts are written to unless the engine args say otherwise
    pub artifact_dir: Option<PathBuf>,
    /// Extra environment passed to the target, as `KEY=VALUE`
    pub env: Vec<String>,
    /// Shared libraries from the build the executable loads at runtime
    pub runtime_deps: Vec<PathBuf>,
}

impl RunConfiguration {
    pub fn new(executable: impl Into<PathBuf>, primary_seed_dir: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            primary_seed_dir: primary_seed_dir.into(),
            additional_seed_dirs: Vec::new(),
            dictionary: None,
            engine_args: Vec::new(),
            target_args: Vec::new(),
            timeout: Duration::ZERO,
            use_sandbox: false,
            verbose: false,
            output_format: OutputFormat::Human,
            artifact_dir: None,
            env: Vec::new(),
            runtime_deps: Vec::new(),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout.is_zero() {
            None
        } else {
            Some(self.timeout)
        }
    }

    /// Primary directory first, then the additional ones in the given order.
    pub fn seed_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::with_capacity(1 + self.additional_seed_dirs.len());
        dirs.push(self.primary_seed_dir.clone());
        dirs.extend(self.additional_seed_dirs.iter().cloned());
        dirs
    }

    /// Name used for artifacts and log lines.
    pub fn target_name(&self) -> String {
        self.executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.executable.display().to_string())
    }
}

/// One host path exposed inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Path on the host
    pub source: PathBuf,
    /// Mount point inside the sandbox; defaults to the source path
    pub target: Option<PathBuf>,
    pub writable: bool,
}

impl Binding {
    pub fn read_only(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: None,
            writable: false,
        }
    }

    pub fn writable(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: None,
            writable: true,
        }
    }

    pub fn with_target(mut self, target: impl Into<PathBuf>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn target_path(&self) -> &Path {
        self.target.as_deref().unwrap_or(&self.source)
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source.display())?;
        if let Some(target) = &self.target {
            write!(f, "={}", target.display())?;
        }
        if self.writable {
            write!(f, ":rw")?;
        }
        Ok(())
    }
}

/// Error taxonomy for fuzzbox
#[derive(Error, Debug)]
pub enum FuzzError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Sandboxing is not supported on this platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Sandbox construction failed: {0}")]
    SandboxConstruction(String),

    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{}", unrecognized_failure_message(.status, .sandboxed))]
    UnrecognizedFailure { status: String, sandboxed: bool },

    #[error("Interrupted by signal {signal}")]
    Interrupted { signal: i32 },

    #[error("{count} finding(s) reported")]
    FindingsReported { count: usize },

    #[error("Corpus is in use by another run (lock file {})", .path.display())]
    LockBusy { path: PathBuf },

    #[error("Build failed: {0}")]
    Build(String),

    #[error("Coverage generation failed: {0}")]
    Coverage(String),
}

fn unrecognized_failure_message(status: &str, sandboxed: &bool) -> String {
    let mut msg = format!(
        "Fuzz target {} without reporting a recognized finding",
        status
    );
    if *sandboxed {
        msg.push_str(". This could be caused by the sandbox; rerun with --sandbox=false to check");
    }
    msg
}

impl FuzzError {
    /// Silent errors have already been communicated to the user.
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::Interrupted { .. } | Self::FindingsReported { .. })
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Interrupted { signal } => 128 + signal,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, FuzzError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_display_marks_target_and_mode() {
        let b = Binding::writable("/work/corpus").with_target("/corpus");
        assert_eq!(b.target_path(), Path::new("/corpus"));
        assert_eq!(b.to_string(), "/work/corpus=/corpus:rw");

        let b = Binding::read_only("/usr/share/dict");
        assert_eq!(b.target_path(), Path::new("/usr/share/dict"));
        assert_eq!(b.to_string(), "/usr/share/dict");
    }

    #[test]
    fn interrupted_is_silent_with_signal_exit_code() {
        let err = FuzzError::Interrupted { signal: 2 };
        assert!(err.is_silent());
        assert_eq!(err.exit_code(), 130);

        let err = FuzzError::Config("missing".into());
        assert!(!err.is_silent());
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn unrecognized_failure_mentions_sandbox_only_when_sandboxed() {
        let plain = FuzzError::UnrecognizedFailure {
            status: "exited with code 3".into(),
            sandboxed: false,
        };
        assert!(!plain.to_string().contains("sandbox"));

        let sandboxed = FuzzError::UnrecognizedFailure {
            status: "exited with code 3".into(),
            sandboxed: true,
        };
        assert!(sandboxed.to_string().contains("--sandbox=false"));
    }

    #[test]
    fn zero_timeout_is_unbounded() {
        let mut cfg = RunConfiguration::new("/bin/true", "/tmp/corpus");
        assert_eq!(cfg.timeout(), None);
        cfg.timeout = Duration::from_secs(3);
        assert_eq!(cfg.timeout(), Some(Duration::from_secs(3)));
        assert_eq!(cfg.target_name(), "true");
    }
}
