use crate::config::types::{Binding, FuzzError, Result};
use log::debug;
use std::path::{Path, PathBuf};

/// Everything a builder needs to confine one command.
#[derive(Debug, Clone, Copy)]
pub struct SandboxRequest<'a> {
    pub command: &'a [String],
    pub bindings: &'a [Binding],
    /// Variables the sandboxed command must see, as `KEY=VALUE`
    pub env: &'a [String],
    /// Empty directory that becomes the sandbox root
    pub root_dir: &'a Path,
}

/// A path that must exist inside the sandbox root before launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub path: PathBuf,
    pub is_dir: bool,
}

/// A command line that runs the target confined when executed directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxedCommand {
    /// Program followed by its arguments
    pub args: Vec<String>,
    /// Mount points to create under the root, parents first
    pub mount_points: Vec<MountPoint>,
}

impl SandboxedCommand {
    pub fn program(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or("")
    }

    /// Create the mount point skeleton under `root`.
    pub fn prepare(&self, root: &Path) -> Result<()> {
        for mount in &self.mount_points {
            let relative = mount.path.strip_prefix("/").unwrap_or(&mount.path);
            let path = root.join(relative);
            let created = if mount.is_dir {
                std::fs::create_dir_all(&path)
            } else {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| mount_error(parent, e))?;
                }
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)
                    .map(|_| ())
            };
            created.map_err(|e| mount_error(&path, e))?;
        }
        Ok(())
    }
}

fn mount_error(path: &Path, e: std::io::Error) -> FuzzError {
    FuzzError::SandboxConstruction(format!(
        "cannot create mount point {}: {}",
        path.display(),
        e
    ))
}

/// Translate a command plus its filesystem exposure into a sandboxed
/// command. Implementations never execute anything.
pub trait SandboxPolicyBuilder: Send + Sync {
    fn name(&self) -> &'static str;
    fn build(&self, request: &SandboxRequest<'_>) -> Result<SandboxedCommand>;
}

/// A binding with its source resolved on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBinding {
    pub source: PathBuf,
    pub target: PathBuf,
    pub writable: bool,
    pub is_dir: bool,
}

/// Resolve every binding to an absolute, symlink-free source. A missing
/// source is a configuration error. Bindings with the same target are
/// merged; the merged binding is writable if any of them was.
pub fn resolve_bindings(bindings: &[Binding]) -> Result<Vec<ResolvedBinding>> {
    let mut resolved: Vec<ResolvedBinding> = Vec::with_capacity(bindings.len());

    for binding in bindings {
        let source = binding.source.canonicalize().map_err(|e| {
            FuzzError::Config(format!(
                "sandbox binding {} cannot be resolved: {}",
                binding.source.display(),
                e
            ))
        })?;
        let is_dir = source.is_dir();
        let target = match &binding.target {
            Some(target) => target.clone(),
            None => source.clone(),
        };

        if let Some(existing) = resolved.iter_mut().find(|b| b.target == target) {
            if existing.source != source {
                return Err(FuzzError::Config(format!(
                    "sandbox target {} is bound to both {} and {}",
                    target.display(),
                    existing.source.display(),
                    source.display()
                )));
            }
            existing.writable |= binding.writable;
            continue;
        }

        debug!("Binding {} -> {} (writable: {})", source.display(), target.display(), binding.writable);
        resolved.push(ResolvedBinding {
            source,
            target,
            writable: binding.writable,
            is_dir,
        });
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_source_is_configuration_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = resolve_bindings(&[Binding::read_only(tmp.path().join("absent"))]).unwrap_err();
        assert!(matches!(err, FuzzError::Config(_)), "got {err:?}");
    }

    #[test]
    fn symlinks_are_resolved_and_duplicates_merged() {
        let tmp = tempfile::tempdir().unwrap();
        let real = tmp.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = tmp.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let resolved = resolve_bindings(&[Binding::read_only(&link), Binding::writable(&real)]).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].source, real.canonicalize().unwrap());
        assert!(resolved[0].writable);
        assert!(resolved[0].is_dir);
    }

    #[test]
    fn prepare_creates_skeleton() {
        let tmp = tempfile::tempdir().unwrap();
        let cmd = SandboxedCommand {
            args: vec!["minijail0".into()],
            mount_points: vec![
                MountPoint { path: PathBuf::from("/work/corpus"), is_dir: true },
                MountPoint { path: PathBuf::from("/work/bin/fuzz"), is_dir: false },
            ],
        };
        cmd.prepare(tmp.path()).unwrap();
        assert!(tmp.path().join("work/corpus").is_dir());
        assert!(tmp.path().join("work/bin/fuzz").is_file());
        assert_eq!(cmd.program(), "minijail0");
    }
}
