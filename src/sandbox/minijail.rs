//! Minijail command construction.
//!
//! The target runs under `minijail0` in fresh user, mount, pid, IPC and
//! network namespaces, pivoted into an empty root that only contains the
//! bindings plus a small system allowlist. Inside, the fuzzbox binary itself
//! (`__exec-wrapper`) applies the environment and execs the target.

use crate::config::types::{FuzzError, Result};
use crate::sandbox::finder::{Tool, ToolFinder};
use crate::sandbox::policy::{
    resolve_bindings, MountPoint, ResolvedBinding, SandboxPolicyBuilder, SandboxRequest,
    SandboxedCommand,
};
use crate::sandbox::wrapper;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Host paths needed for dynamic linking and running a shell, bound
/// read-only when they exist
pub const SYSTEM_PATHS: &[&str] = &[
    "/lib",
    "/lib32",
    "/lib64",
    "/usr/lib",
    "/usr/lib32",
    "/usr/lib64",
    "/bin",
    "/usr/bin",
    "/etc/ld.so.cache",
    "/etc/ld.so.conf",
    "/etc/ld.so.conf.d",
];

pub struct MinijailBuilder {
    finder: Arc<dyn ToolFinder>,
    system_paths: Vec<PathBuf>,
}

impl MinijailBuilder {
    pub fn new(finder: Arc<dyn ToolFinder>) -> Self {
        Self {
            finder,
            system_paths: SYSTEM_PATHS.iter().map(PathBuf::from).collect(),
        }
    }

    /// Replace the system allowlist.
    pub fn with_system_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.system_paths = paths;
        self
    }

    fn system_bindings(&self) -> Vec<ResolvedBinding> {
        self.system_paths
            .iter()
            .filter_map(|path| {
                let source = path.canonicalize().ok()?;
                Some(ResolvedBinding {
                    is_dir: source.is_dir(),
                    source,
                    target: path.clone(),
                    writable: false,
                })
            })
            .collect()
    }
}

impl SandboxPolicyBuilder for MinijailBuilder {
    fn name(&self) -> &'static str {
        "minijail"
    }

    fn build(&self, request: &SandboxRequest<'_>) -> Result<SandboxedCommand> {
        if request.command.is_empty() {
            return Err(FuzzError::Config("empty command".to_string()));
        }

        let mut bindings = resolve_bindings(request.bindings)?;

        let minijail = self
            .finder
            .find(Tool::Minijail)
            .map_err(|e| FuzzError::SandboxConstruction(e.to_string()))?;
        let wrapper_exe = self
            .finder
            .find(Tool::ExecWrapper)
            .map_err(|e| FuzzError::SandboxConstruction(e.to_string()))?;
        bindings.extend(resolve_bindings(&[crate::config::types::Binding::read_only(
            &wrapper_exe,
        )])?);

        let system = self.system_bindings();

        let uid = nix::unistd::getuid();
        let gid = nix::unistd::getgid();

        let mut args = vec![
            path_arg(&minijail)?,
            "--logging=stderr".to_string(),
            // user namespace mapping our own ids
            "-U".to_string(),
            "-m".to_string(),
            format!("{} {} 1", uid, uid),
            "-M".to_string(),
            format!("{} {} 1", gid, gid),
            "-c".to_string(),
            "0".to_string(),
            "-e".to_string(),
            "-l".to_string(),
            "-p".to_string(),
            "-v".to_string(),
            "-P".to_string(),
            path_arg(request.root_dir)?,
            "-d".to_string(),
            "-k".to_string(),
            "proc,/proc,proc,MS_RDONLY|MS_NOSUID|MS_NODEV|MS_NOEXEC".to_string(),
            "-k".to_string(),
            "tmpfs,/tmp,tmpfs,MS_NOSUID|MS_NODEV,mode=1777".to_string(),
        ];

        let mut mount_points = vec![
            MountPoint { path: PathBuf::from("/proc"), is_dir: true },
            MountPoint { path: PathBuf::from("/dev"), is_dir: true },
            MountPoint { path: PathBuf::from("/tmp"), is_dir: true },
        ];

        for binding in system.iter().chain(bindings.iter()) {
            args.push("-b".to_string());
            args.push(bind_arg(binding)?);
            mount_points.push(MountPoint {
                path: binding.target.clone(),
                is_dir: binding.is_dir,
            });
        }

        args.push("--".to_string());
        args.extend(wrapper::wrapper_args(&wrapper_exe, request.env, request.command));

        Ok(SandboxedCommand { args, mount_points })
    }
}

fn path_arg(path: &Path) -> Result<String> {
    path.to_str().map(str::to_string).ok_or_else(|| {
        FuzzError::SandboxConstruction(format!("path is not valid UTF-8: {}", path.display()))
    })
}

/// `-b src,dst[,1]`; minijail cannot express paths containing commas.
fn bind_arg(binding: &ResolvedBinding) -> Result<String> {
    let source = path_arg(&binding.source)?;
    let target = path_arg(&binding.target)?;
    if source.contains(',') || target.contains(',') {
        return Err(FuzzError::SandboxConstruction(format!(
            "cannot bind {} into the sandbox: path contains a comma",
            source
        )));
    }
    Ok(if binding.writable {
        format!("{},{},1", source, target)
    } else {
        format!("{},{}", source, target)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::Binding;

    struct FakeFinder {
        minijail: PathBuf,
    }

    impl ToolFinder for FakeFinder {
        fn find(&self, tool: Tool) -> Result<PathBuf> {
            match tool {
                Tool::Minijail => Ok(self.minijail.clone()),
                Tool::ExecWrapper => Ok(std::env::current_exe()?),
                other => Err(FuzzError::Config(format!("{} unavailable", other.binary_name()))),
            }
        }
    }

    fn builder() -> MinijailBuilder {
        MinijailBuilder::new(Arc::new(FakeFinder {
            minijail: PathBuf::from("/opt/fuzzbox/bin/minijail0"),
        }))
        .with_system_paths(Vec::new())
    }

    #[test]
    fn bindings_and_wrapper_appear_in_command() {
        let tmp = tempfile::tempdir().unwrap();
        let corpus = tmp.path().join("corpus");
        std::fs::create_dir(&corpus).unwrap();
        let exe = tmp.path().join("fuzz_target");
        std::fs::write(&exe, b"").unwrap();
        let root = tmp.path().join("root");

        let command = vec![exe.display().to_string(), corpus.display().to_string()];
        let bindings = vec![Binding::read_only(&exe), Binding::writable(&corpus)];
        let env = vec!["ASAN_OPTIONS=detect_leaks=0".to_string()];

        let cmd = builder()
            .build(&SandboxRequest {
                command: &command,
                bindings: &bindings,
                env: &env,
                root_dir: &root,
            })
            .unwrap();

        assert_eq!(cmd.program(), "/opt/fuzzbox/bin/minijail0");
        let corpus_real = corpus.canonicalize().unwrap().display().to_string();
        let exe_real = exe.canonicalize().unwrap().display().to_string();
        assert!(cmd.args.contains(&format!("{},{},1", corpus_real, corpus_real)));
        assert!(cmd.args.contains(&format!("{},{}", exe_real, exe_real)));
        assert!(cmd.args.contains(&root.display().to_string()));

        let sep = cmd.args.iter().position(|a| a == "--").unwrap();
        assert_eq!(cmd.args[sep + 2], wrapper::WRAPPER_SUBCOMMAND);
        assert!(cmd.args[sep..].contains(&"ASAN_OPTIONS=detect_leaks=0".to_string()));
        assert_eq!(cmd.args.last().unwrap(), &corpus.display().to_string());

        assert!(cmd
            .mount_points
            .iter()
            .any(|m| m.path == corpus.canonicalize().unwrap() && m.is_dir));
    }

    #[test]
    fn same_input_same_command() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = tmp.path().join("t");
        std::fs::write(&exe, b"").unwrap();
        let command = vec![exe.display().to_string()];
        let bindings = vec![Binding::read_only(&exe)];
        let request = SandboxRequest {
            command: &command,
            bindings: &bindings,
            env: &[],
            root_dir: tmp.path(),
        };
        assert_eq!(builder().build(&request).unwrap(), builder().build(&request).unwrap());
    }

    #[test]
    fn missing_binding_fails_before_tool_lookup() {
        let tmp = tempfile::tempdir().unwrap();
        let command = vec!["/bin/true".to_string()];
        let bindings = vec![Binding::read_only(tmp.path().join("gone"))];
        let err = MinijailBuilder::new(Arc::new(FakeFinder {
            minijail: PathBuf::from("/nonexistent/minijail0"),
        }))
        .build(&SandboxRequest {
            command: &command,
            bindings: &bindings,
            env: &[],
            root_dir: tmp.path(),
        })
        .unwrap_err();
        assert!(matches!(err, FuzzError::Config(_)), "got {err:?}");
    }

    #[test]
    fn comma_in_path_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let odd = tmp.path().join("a,b");
        std::fs::create_dir(&odd).unwrap();
        let command = vec!["/bin/true".to_string()];
        let bindings = vec![Binding::read_only(&odd)];
        let err = builder()
            .build(&SandboxRequest {
                command: &command,
                bindings: &bindings,
                env: &[],
                root_dir: tmp.path(),
            })
            .unwrap_err();
        assert!(matches!(err, FuzzError::SandboxConstruction(_)), "got {err:?}");
    }
}
