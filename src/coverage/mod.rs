//! Coverage report generation.
//!
//! The coverage-instrumented target replays every corpus directory once
//! (`-runs=0`) with `LLVM_PROFILE_FILE` pointing into a scratch directory.
//! The raw profiles are merged with `llvm-profdata` and rendered to a single
//! HTML file by `llvm-cov show`.

use crate::build::BuildResult;
use crate::config::project::Project;
use crate::config::types::{Binding, FuzzError, Result};
use crate::core::cancel::CancelToken;
use crate::safety::cleanup::RunResources;
use crate::sandbox::finder::{Tool, ToolFinder};
use crate::sandbox::policy::{SandboxPolicyBuilder, SandboxRequest};
use crate::utils::env;
use log::{debug, info, warn};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

pub const PROFILE_PATTERN: &str = "%m.profraw";

#[derive(Debug, Clone, Default)]
pub struct CoverageOptions {
    pub target: String,
    /// Seed directories given by the user
    pub seed_dirs: Vec<PathBuf>,
    pub target_args: Vec<String>,
    pub use_sandbox: bool,
    pub verbose: bool,
    /// Where to write the report; defaults to `<project>/<target>.coverage.html`
    pub output: Option<PathBuf>,
}

pub struct CoverageGenerator {
    project: Project,
    finder: Arc<dyn ToolFinder>,
    sandbox: Option<Box<dyn SandboxPolicyBuilder>>,
    scratch_root: PathBuf,
}

impl CoverageGenerator {
    pub fn new(
        project: Project,
        finder: Arc<dyn ToolFinder>,
        sandbox: Option<Box<dyn SandboxPolicyBuilder>>,
        scratch_root: PathBuf,
    ) -> Self {
        Self {
            project,
            finder,
            sandbox,
            scratch_root,
        }
    }

    /// Every directory replayed for coverage, symlinks resolved. Missing
    /// directories are skipped.
    pub fn corpus_dirs(&self, build: &BuildResult, options: &CoverageOptions) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = Vec::new();
        let candidates = options
            .seed_dirs
            .iter()
            .cloned()
            .chain(build.seed_corpus.clone())
            .chain(std::iter::once(self.project.generated_corpus_dir(&options.target)));
        for dir in candidates {
            match dir.canonicalize() {
                Ok(resolved) if resolved.is_dir() => {
                    if !dirs.contains(&resolved) {
                        dirs.push(resolved);
                    }
                }
                _ => debug!("Skipping corpus dir {}", dir.display()),
            }
        }
        dirs
    }

    pub fn report_path(&self, options: &CoverageOptions) -> PathBuf {
        options.output.clone().unwrap_or_else(|| {
            self.project
                .root
                .join(format!("{}.coverage.html", options.target))
        })
    }

    /// Produce the HTML report and return its path.
    pub fn generate(&self, build: &BuildResult, options: &CoverageOptions) -> Result<PathBuf> {
        let workdir = self
            .scratch_root
            .join(format!("coverage-{}", uuid::Uuid::new_v4()));
        let profiles = workdir.join("profiles");
        fs::create_dir_all(&profiles)?;

        let result = self.generate_in(build, options, &workdir, &profiles);
        if let Err(e) = fs::remove_dir_all(&workdir) {
            debug!("Failed to remove {}: {}", workdir.display(), e);
        }
        result
    }

    fn generate_in(
        &self,
        build: &BuildResult,
        options: &CoverageOptions,
        workdir: &Path,
        profiles: &Path,
    ) -> Result<PathBuf> {
        let corpus = self.corpus_dirs(build, options);
        info!(
            "Replaying {} corpus dir(s) through {}",
            corpus.len(),
            build.executable.display()
        );
        self.collect_profiles(build, options, &corpus, profiles)?;

        let raw = raw_profiles(profiles)?;
        if raw.is_empty() {
            return Err(FuzzError::Coverage(
                "the target wrote no coverage profiles; was it built with coverage instrumentation?"
                    .to_string(),
            ));
        }

        let merged = workdir.join("merged.profdata");
        let profdata = self.tool(Tool::LlvmProfdata)?;
        let mut cmd = Command::new(&profdata);
        cmd.args(["merge", "-sparse", "-o"]).arg(&merged).args(&raw);
        run_tool(cmd, "llvm-profdata merge", None)?;

        let report = self.report_path(options);
        let llvm_cov = self.tool(Tool::LlvmCov)?;
        let mut cmd = Command::new(&llvm_cov);
        cmd.args(show_args(&build.executable, &merged, &build.runtime_deps));
        run_tool(cmd, "llvm-cov show", Some(&report))?;

        info!("Coverage report written to {}", report.display());
        Ok(report)
    }

    fn tool(&self, tool: Tool) -> Result<PathBuf> {
        self.finder
            .find(tool)
            .map_err(|e| FuzzError::Coverage(e.to_string()))
    }

    fn collect_profiles(
        &self,
        build: &BuildResult,
        options: &CoverageOptions,
        corpus: &[PathBuf],
        profiles: &Path,
    ) -> Result<()> {
        let args = replay_args(&build.executable, corpus, &options.target_args);
        let mut run_env = Vec::new();
        env::set(
            &mut run_env,
            "LLVM_PROFILE_FILE",
            &profiles.join(PROFILE_PATTERN).display().to_string(),
        );

        // Sandbox roots are released by the finalizer, like a fuzz run.
        let mut resources = RunResources::new(CancelToken::new());
        let mut cmd = if options.use_sandbox {
            let builder = self.sandbox.as_deref().ok_or_else(|| {
                FuzzError::SandboxConstruction(
                    "sandboxing was requested but no sandbox builder is configured".to_string(),
                )
            })?;
            let mut bindings = vec![Binding::read_only(&build.executable)];
            bindings.extend(build.runtime_deps.iter().map(Binding::read_only));
            bindings.extend(corpus.iter().map(Binding::read_only));
            bindings.push(Binding::writable(profiles));

            let root = self
                .scratch_root
                .join(format!("run-{}", uuid::Uuid::new_v4()));
            fs::create_dir_all(&root)?;
            resources.record_scratch_dir(root.clone());
            let sandboxed = builder.build(&SandboxRequest {
                command: &args,
                bindings: &bindings,
                env: &run_env,
                root_dir: &root,
            })?;
            sandboxed.prepare(&root)?;
            let mut cmd = Command::new(sandboxed.program());
            cmd.args(&sandboxed.args[1..]);
            cmd
        } else {
            let mut cmd = Command::new(&args[0]);
            cmd.args(&args[1..]).envs(env::pairs(&run_env));
            cmd
        };

        let sink = || {
            if options.verbose {
                Stdio::from(std::io::stderr())
            } else {
                Stdio::null()
            }
        };
        let program = args[0].clone();
        let status = cmd
            .stdin(Stdio::null())
            .stdout(sink())
            .stderr(sink())
            .status()
            .map_err(|source| FuzzError::Spawn { program, source })?;
        resources.cleanup();

        if !status.success() {
            // A crashing input still leaves a usable profile behind.
            warn!("Coverage replay exited with {}; the report may be incomplete", status);
        }
        Ok(())
    }
}

/// `<exe> <corpus dirs> -runs=0 [-ignore_remaining_args=1 -- <target args>]`
pub fn replay_args(executable: &Path, corpus: &[PathBuf], target_args: &[String]) -> Vec<String> {
    let mut args = vec![executable.display().to_string()];
    args.extend(corpus.iter().map(|d| d.display().to_string()));
    args.push("-runs=0".to_string());
    if !target_args.is_empty() {
        args.push("-ignore_remaining_args=1".to_string());
        args.push(crate::core::args::TARGET_ARGS_SEPARATOR.to_string());
        args.extend(target_args.iter().cloned());
    }
    args
}

pub fn show_args(executable: &Path, profdata: &Path, objects: &[PathBuf]) -> Vec<String> {
    let mut args = vec![
        "show".to_string(),
        executable.display().to_string(),
        format!("-instr-profile={}", profdata.display()),
        "-format=html".to_string(),
    ];
    args.extend(objects.iter().map(|o| format!("-object={}", o.display())));
    args
}

fn raw_profiles(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "profraw") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Run an LLVM tool; its stdout goes to `stdout_to` when given.
fn run_tool(mut cmd: Command, what: &str, stdout_to: Option<&Path>) -> Result<()> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!("{}: {:?}", what, cmd);
    if let Some(path) = stdout_to {
        cmd.stdout(File::create(path)?);
    }
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(|source| FuzzError::Spawn { program, source })?;
    if !output.status.success() {
        return Err(FuzzError::Coverage(format!(
            "{} failed ({}): {}",
            what,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}
