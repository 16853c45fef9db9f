use crate::build::{compiler_env, find_executable, run_step, seed_corpus_for, BuildOptions, BuildResult, Builder};
use crate::config::types::{FuzzError, Result};
use crate::utils::env;
use log::info;
use std::path::PathBuf;
use std::process::Command;

/// Directories never searched for the built executable
const SKIP_DIRS: &[&str] = &[".git", ".fuzzbox-corpus", ".fuzzbox-artifacts"];

/// Runs a user supplied shell command in the project root.
pub struct CommandBuilder {
    project_dir: PathBuf,
    command: String,
    options: BuildOptions,
}

impl CommandBuilder {
    pub fn new(project_dir: impl Into<PathBuf>, command: String, options: BuildOptions) -> Self {
        Self {
            project_dir: project_dir.into(),
            command,
            options,
        }
    }
}

impl Builder for CommandBuilder {
    fn name(&self) -> &'static str {
        "command"
    }

    fn build(&self, target: &str) -> Result<BuildResult> {
        info!("Building {} with `{}`", target, self.command);
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(&self.command)
            .current_dir(&self.project_dir)
            .envs(env::pairs(&compiler_env(&self.options, &env::current())));
        run_step(cmd, "build command")?;

        let direct = self.project_dir.join(target);
        let executable = if direct.is_file() {
            direct
        } else {
            find_executable(&self.project_dir, target, SKIP_DIRS).ok_or_else(|| {
                FuzzError::Build(format!(
                    "build command succeeded but no executable named {} was found under {}",
                    target,
                    self.project_dir.display()
                ))
            })?
        };

        Ok(BuildResult {
            seed_corpus: seed_corpus_for(&executable, target),
            runtime_deps: Vec::new(),
            executable,
        })
    }
}
