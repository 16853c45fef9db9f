// Run configuration validation
// Every check runs before anything is spawned; errors are fatal, warnings are logged.

use crate::config::types::{FuzzError, Result, RunConfiguration};
use std::path::Path;

/// Engine flags that have a first-class option of their own
const RESERVED_ENGINE_FLAGS: &[(&str, &str)] = &[("-dict=", "--dict")];

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Validate a run configuration.
///
/// Returns the warnings on success. Any error aborts the run with a
/// `Config` error listing every problem found, except a sandbox request on
/// a platform without one, which is reported as `UnsupportedPlatform`.
pub fn validate_config(config: &RunConfiguration) -> Result<ValidationResult> {
    check_platform(config)?;

    let mut result = ValidationResult::new();

    validate_executable(config, &mut result);
    validate_seed_dirs(config, &mut result);
    validate_dictionary(config, &mut result);
    validate_engine_args(config, &mut result);
    validate_env(config, &mut result);

    if !result.is_valid() {
        return Err(FuzzError::Config(result.errors.join("; ")));
    }

    for warning in &result.warnings {
        log::warn!("{}", warning);
    }

    Ok(result)
}

/// Sandboxing is only offered where the confinement primitive exists.
pub fn check_platform(config: &RunConfiguration) -> Result<()> {
    if config.use_sandbox && !crate::sandbox::is_supported() {
        return Err(FuzzError::UnsupportedPlatform(format!(
            "the sandbox requires Linux (running on {}); pass --sandbox=false",
            std::env::consts::OS
        )));
    }
    Ok(())
}

fn validate_executable(config: &RunConfiguration, result: &mut ValidationResult) {
    match std::fs::metadata(&config.executable) {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => result.add_error(format!(
            "fuzz target {} is not a regular file",
            config.executable.display()
        )),
        Err(e) => result.add_error(format!(
            "fuzz target {}: {}",
            config.executable.display(),
            e
        )),
    }
}

fn validate_seed_dirs(config: &RunConfiguration, result: &mut ValidationResult) {
    // The primary directory may not exist yet; it is created by the supervisor.
    if config.primary_seed_dir.exists() && !config.primary_seed_dir.is_dir() {
        result.add_error(format!(
            "seed corpus {} is not a directory",
            config.primary_seed_dir.display()
        ));
    }

    for dir in &config.additional_seed_dirs {
        check_dir(dir, "seed corpus", result);
        if same_path(dir, &config.primary_seed_dir) {
            result.add_warning(format!(
                "seed corpus {} is also the primary corpus",
                dir.display()
            ));
        }
    }
}

fn validate_dictionary(config: &RunConfiguration, result: &mut ValidationResult) {
    if let Some(dict) = &config.dictionary {
        match std::fs::metadata(dict) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => result.add_error(format!("dictionary {} is not a file", dict.display())),
            Err(e) => result.add_error(format!("dictionary {}: {}", dict.display(), e)),
        }
    }
}

fn validate_engine_args(config: &RunConfiguration, result: &mut ValidationResult) {
    for arg in &config.engine_args {
        for (prefix, flag) in RESERVED_ENGINE_FLAGS {
            if arg.starts_with(prefix) {
                result.add_error(format!(
                    "engine argument '{}' duplicates {}; use {} instead",
                    arg, flag, flag
                ));
            }
        }
    }
}

fn validate_env(config: &RunConfiguration, result: &mut ValidationResult) {
    for entry in &config.env {
        if crate::utils::env::split_entry(entry).is_none() {
            result.add_error(format!(
                "environment entry '{}' is not of the form KEY=VALUE",
                entry
            ));
        }
    }
}

fn check_dir(dir: &Path, what: &str, result: &mut ValidationResult) {
    match std::fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => result.add_error(format!("{} {} is not a directory", what, dir.display())),
        Err(e) => result.add_error(format!("{} {}: {}", what, dir.display(), e)),
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
