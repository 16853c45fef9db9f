//! Build collaborators.
//!
//! A [`Builder`] turns a fuzz target name into an instrumented executable,
//! the shared libraries it needs at runtime, and an optional seed corpus
//! shipped next to it.

pub mod cmake;
pub mod command;

use crate::config::project::{BuildSystem, Project};
use crate::config::types::{FuzzError, Result};
use crate::utils::env;
use log::debug;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use walkdir::WalkDir;

pub use cmake::CMakeBuilder;
pub use command::CommandBuilder;

pub const DEFAULT_ENGINE: &str = "libfuzzer";
pub const DEFAULT_SANITIZERS: &[&str] = &["address", "undefined"];

/// Output of a successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    pub executable: PathBuf,
    pub runtime_deps: Vec<PathBuf>,
    /// `<target>_inputs` next to the executable, when present
    pub seed_corpus: Option<PathBuf>,
}

/// Instrumentation to build with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    pub engine: String,
    pub sanitizers: Vec<String>,
    /// Source-based coverage instead of sanitizers
    pub coverage: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            engine: DEFAULT_ENGINE.to_string(),
            sanitizers: DEFAULT_SANITIZERS.iter().map(|s| s.to_string()).collect(),
            coverage: false,
        }
    }
}

impl BuildOptions {
    pub fn coverage() -> Self {
        Self {
            engine: DEFAULT_ENGINE.to_string(),
            sanitizers: Vec::new(),
            coverage: true,
        }
    }

    /// Directory name distinguishing instrumentation variants.
    pub fn variant(&self) -> String {
        if self.coverage {
            "coverage".to_string()
        } else if self.sanitizers.is_empty() {
            "plain".to_string()
        } else {
            self.sanitizers.join("+")
        }
    }
}

pub trait Builder: Send + Sync {
    fn name(&self) -> &'static str;
    fn build(&self, target: &str) -> Result<BuildResult>;
}

/// Pick the builder for the project's build system.
pub fn builder_for(project: &Project, options: BuildOptions) -> Result<Box<dyn Builder>> {
    match project.build_system() {
        BuildSystem::Cmake => Ok(Box::new(CMakeBuilder::new(project, options))),
        BuildSystem::Other => {
            let command = project.config.build_command.clone().ok_or_else(|| {
                FuzzError::Config(
                    "no CMakeLists.txt found; set build_command in fuzzbox.json or pass --build-command"
                        .to_string(),
                )
            })?;
            Ok(Box::new(CommandBuilder::new(&project.root, command, options)))
        }
    }
}

/// Compiler environment shared by every build system. Values already in
/// `inherited` are extended, not replaced.
pub fn compiler_env(options: &BuildOptions, inherited: &[String]) -> Vec<String> {
    let mut compile = vec![
        "-g",
        "-Og",
        "-fno-omit-frame-pointer",
        "-DFUZZING_BUILD_MODE_UNSAFE_FOR_PRODUCTION",
        "-fsanitize=fuzzer-no-link",
    ]
    .into_iter()
    .map(str::to_string)
    .collect::<Vec<_>>();
    let mut link = Vec::new();

    if options.coverage {
        compile.push("-fprofile-instr-generate".to_string());
        compile.push("-fcoverage-mapping".to_string());
        link.push("-fprofile-instr-generate".to_string());
    } else if !options.sanitizers.is_empty() {
        let flag = format!("-fsanitize={}", options.sanitizers.join(","));
        compile.push(flag.clone());
        link.push(flag);
        if options.sanitizers.iter().any(|s| s == "address") {
            // keep running after a recoverable ASan report
            compile.push("-fsanitize-recover=address".to_string());
            compile.push("-fsanitize-address-use-after-scope".to_string());
        }
        if options.sanitizers.iter().any(|s| s == "undefined") {
            // plain clang does not pull in the C++ part of the UBSan runtime
            link.push("-fsanitize-link-c++-runtime".to_string());
        }
    }

    let mut out = Vec::new();
    for (key, default) in [("CC", "clang"), ("CXX", "clang++")] {
        if env::get(inherited, key).is_none() {
            env::set(&mut out, key, default);
        }
    }
    let compile = compile.join(" ");
    let link = link.join(" ");
    for (key, value) in [("CFLAGS", &compile), ("CXXFLAGS", &compile), ("LDFLAGS", &link)] {
        let merged = match env::get(inherited, key) {
            Some(existing) if !existing.is_empty() => format!("{} {}", existing, value),
            _ => value.to_string(),
        };
        env::set(&mut out, key, merged.trim());
    }
    env::set(&mut out, "FUZZ_TEST_CFLAGS", "-DFUZZBOX_FUZZ_TEST");
    env::set(&mut out, "FUZZ_TEST_LDFLAGS", "-fsanitize=fuzzer");
    // Configure-time checks run unlinked test programs under ASan.
    env::set(&mut out, "ASAN_OPTIONS", "detect_leaks=0:verify_asan_link_order=0");
    out
}

/// Run a build step with its output sent to our stderr.
pub(crate) fn run_step(mut cmd: Command, what: &str) -> Result<()> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!("Build step {}: {:?}", what, cmd);
    let status = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::from(std::io::stderr()))
        .status()
        .map_err(|source| FuzzError::Spawn { program, source })?;
    if !status.success() {
        return Err(FuzzError::Build(format!("{} failed ({})", what, status)));
    }
    Ok(())
}

/// First executable regular file called `name` under `root`, skipping
/// directories named in `skip_dirs`.
pub(crate) fn find_executable(root: &Path, name: &str, skip_dirs: &[&str]) -> Option<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !e.file_type().is_dir()
                || !skip_dirs.iter().any(|s| e.file_name() == *s)
        })
        .filter_map(|e| e.ok())
        .find(|e| {
            e.file_type().is_file()
                && e.file_name() == name
                && e.metadata()
                    .map(|m| m.permissions().mode() & 0o111 != 0)
                    .unwrap_or(false)
        })
        .map(|e| e.into_path())
}

/// `<target>_inputs` next to the executable, if it is a directory.
pub fn seed_corpus_for(executable: &Path, target: &str) -> Option<PathBuf> {
    let dir = executable.parent()?.join(format!("{}_inputs", target));
    dir.is_dir().then_some(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizer_flags_extend_inherited() {
        let inherited = vec!["CFLAGS=-O1".to_string(), "CC=gcc".to_string()];
        let env = compiler_env(&BuildOptions::default(), &inherited);

        assert_eq!(env::get(&env, "CC"), None, "user compiler kept");
        assert_eq!(env::get(&env, "CXX"), Some("clang++"));
        let cflags = env::get(&env, "CFLAGS").unwrap();
        assert!(cflags.starts_with("-O1 "), "{cflags}");
        assert!(cflags.contains("-fsanitize=address,undefined"));
        assert_eq!(
            env::get(&env, "LDFLAGS"),
            Some("-fsanitize=address,undefined -fsanitize-link-c++-runtime")
        );
        assert_eq!(env::get(&env, "FUZZ_TEST_LDFLAGS"), Some("-fsanitize=fuzzer"));
    }

    #[test]
    fn asan_build_keeps_recovering_and_skips_leak_checks() {
        let env = compiler_env(&BuildOptions::default(), &[]);
        let cflags = env::get(&env, "CFLAGS").unwrap();
        for flag in [
            "-DFUZZING_BUILD_MODE_UNSAFE_FOR_PRODUCTION",
            "-fsanitize-recover=address",
            "-fsanitize-address-use-after-scope",
        ] {
            assert!(cflags.split(' ').any(|f| f == flag), "{flag} missing from {cflags}");
        }
        assert_eq!(
            env::get(&env, "ASAN_OPTIONS"),
            Some("detect_leaks=0:verify_asan_link_order=0")
        );

        let ubsan_only = BuildOptions {
            sanitizers: vec!["undefined".to_string()],
            ..BuildOptions::default()
        };
        let cflags = env::get(&compiler_env(&ubsan_only, &[]), "CFLAGS").unwrap().to_string();
        assert!(!cflags.contains("-fsanitize-recover=address"), "{cflags}");
    }

    #[test]
    fn coverage_flags_replace_sanitizers() {
        let env = compiler_env(&BuildOptions::coverage(), &[]);
        let cflags = env::get(&env, "CXXFLAGS").unwrap();
        assert!(cflags.contains("-fcoverage-mapping"));
        assert!(!cflags.contains("address"));
        assert_eq!(BuildOptions::coverage().variant(), "coverage");
        assert_eq!(BuildOptions::default().variant(), "address+undefined");
    }

    #[test]
    fn executable_lookup_skips_listed_dirs() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        for dir in ["CMakeFiles/fuzz", "out"] {
            std::fs::create_dir_all(tmp.path().join(dir)).unwrap();
            let exe = tmp.path().join(dir).join("fuzz");
            std::fs::write(&exe, b"#!/bin/sh\n").unwrap();
            std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        std::fs::write(tmp.path().join("fuzz.c"), b"").unwrap();

        let found = find_executable(tmp.path(), "fuzz", &["CMakeFiles"]).unwrap();
        assert_eq!(found, tmp.path().join("out/fuzz"));
        assert_eq!(find_executable(tmp.path(), "fuzz.c", &[]), None, "not executable");
    }

    #[test]
    fn seed_corpus_next_to_executable() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = tmp.path().join("parser_fuzzer");
        std::fs::write(&exe, b"").unwrap();
        assert_eq!(seed_corpus_for(&exe, "parser_fuzzer"), None);

        std::fs::create_dir(tmp.path().join("parser_fuzzer_inputs")).unwrap();
        assert_eq!(
            seed_corpus_for(&exe, "parser_fuzzer"),
            Some(tmp.path().join("parser_fuzzer_inputs"))
        );
    }
}
