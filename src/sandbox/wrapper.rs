//! The `__exec-wrapper` role.
//!
//! minijail starts the fuzzbox binary inside the sandbox with this hidden
//! subcommand. The wrapper applies the requested environment and working
//! directory, then replaces itself with the target.

use crate::config::types::{FuzzError, Result};
use crate::utils::env;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;

pub const WRAPPER_SUBCOMMAND: &str = "__exec-wrapper";

/// Arguments that make `wrapper_exe` exec `command` with `env` applied.
pub fn wrapper_args(wrapper_exe: &Path, env: &[String], command: &[String]) -> Vec<String> {
    let mut args = Vec::with_capacity(3 + env.len() * 2 + command.len());
    args.push(wrapper_exe.display().to_string());
    args.push(WRAPPER_SUBCOMMAND.to_string());
    for entry in env {
        args.push("--env".to_string());
        args.push(entry.clone());
    }
    args.push("--".to_string());
    args.extend(command.iter().cloned());
    args
}

/// Replace the current process with `command`. Only returns on failure.
pub fn exec_wrapped(env_entries: &[String], chdir: Option<&Path>, command: &[String]) -> Result<()> {
    let (program, rest) = command
        .split_first()
        .ok_or_else(|| FuzzError::Config("exec wrapper needs a command".to_string()))?;

    let mut cmd = Command::new(program);
    cmd.args(rest);
    for entry in env_entries {
        let (key, value) = env::split_entry(entry).ok_or_else(|| {
            FuzzError::Config(format!("invalid environment entry '{}'", entry))
        })?;
        cmd.env(key, value);
    }
    if let Some(dir) = chdir {
        cmd.current_dir(dir);
    }

    let source = cmd.exec();
    Err(FuzzError::Spawn {
        program: program.clone(),
        source,
    })
}
