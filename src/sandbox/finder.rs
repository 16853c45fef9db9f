//! Lookup of the external tools a run depends on.
//!
//! The finder is constructed once by the CLI and injected wherever a tool
//! path is needed, so tests can hand in a fake.

use crate::config::types::{FuzzError, Result};
use std::path::{Path, PathBuf};

/// Environment variable overriding the install root
pub const INSTALL_ROOT_ENV: &str = "FUZZBOX_INSTALL_ROOT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Minijail,
    LlvmProfdata,
    LlvmCov,
    LlvmSymbolizer,
    /// The binary that runs `__exec-wrapper` inside the sandbox
    ExecWrapper,
}

impl Tool {
    pub fn binary_name(self) -> &'static str {
        match self {
            Self::Minijail => "minijail0",
            Self::LlvmProfdata => "llvm-profdata",
            Self::LlvmCov => "llvm-cov",
            Self::LlvmSymbolizer => "llvm-symbolizer",
            Self::ExecWrapper => "fuzzbox",
        }
    }
}

pub trait ToolFinder: Send + Sync {
    fn find(&self, tool: Tool) -> Result<PathBuf>;
}

/// Looks in `<install root>/bin`, then on `PATH`.
#[derive(Debug, Clone)]
pub struct InstallDirFinder {
    install_root: PathBuf,
    path_dirs: Vec<PathBuf>,
}

impl InstallDirFinder {
    pub fn new(install_root: impl Into<PathBuf>) -> Self {
        let path_dirs = std::env::var_os("PATH")
            .map(|p| std::env::split_paths(&p).collect())
            .unwrap_or_default();
        Self {
            install_root: install_root.into(),
            path_dirs,
        }
    }

    /// Install root from `FUZZBOX_INSTALL_ROOT`, else the parent of the
    /// directory holding the running executable.
    pub fn from_env() -> Result<Self> {
        if let Some(root) = std::env::var_os(INSTALL_ROOT_ENV) {
            return Ok(Self::new(PathBuf::from(root)));
        }
        let exe = std::env::current_exe()?;
        let root = exe
            .parent()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        Ok(Self::new(root))
    }

    pub fn with_path_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.path_dirs = dirs;
        self
    }

    pub fn install_root(&self) -> &Path {
        &self.install_root
    }
}

impl ToolFinder for InstallDirFinder {
    fn find(&self, tool: Tool) -> Result<PathBuf> {
        let name = tool.binary_name();

        let bundled = self.install_root.join("bin").join(name);
        if is_executable(&bundled) {
            return Ok(bundled);
        }

        if tool == Tool::ExecWrapper {
            return Ok(std::env::current_exe()?);
        }

        self.path_dirs
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| is_executable(candidate))
            .ok_or_else(|| {
                FuzzError::Config(format!(
                    "{} not found in {} or on PATH",
                    name,
                    self.install_root.join("bin").display()
                ))
            })
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
