//! Fuzzer command line and filesystem exposure for one run.

use crate::config::types::{Binding, RunConfiguration};
use crate::utils::env;
use std::path::{Path, PathBuf};

/// Separates engine flags from the target's own arguments
pub const TARGET_ARGS_SEPARATOR: &str = "--";

/// Engine flags whose value is a path and how the sandbox must expose it
const PATH_FLAGS: &[(&str, PathUse)] = &[
    ("-artifact_prefix=", PathUse::WritablePrefix),
    ("-exact_artifact_path=", PathUse::WritableFile),
    ("-merge_control_file=", PathUse::WritableFile),
    ("-seed_inputs=", PathUse::ReadOnlyList),
    ("-features_dir=", PathUse::WritableDir),
];

/// Sanitizer defaults; values already present in the environment win.
const DEFAULT_ENV: &[(&str, &str)] = &[
    ("ASAN_OPTIONS", "alloc_dealloc_mismatch=0:allocator_may_return_null=1"),
    ("UBSAN_OPTIONS", "print_stacktrace=1:print_summary=1"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathUse {
    /// A filename prefix; its parent directory is written to
    WritablePrefix,
    WritableFile,
    WritableDir,
    /// Comma-separated list of input files
    ReadOnlyList,
}

/// The resolved command line plus everything it touches on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuzzerInvocation {
    pub args: Vec<String>,
    pub bindings: Vec<Binding>,
}

/// Build the libFuzzer invocation: executable, corpus directories,
/// dictionary, engine arguments, artifact prefix, then the target arguments
/// behind `-ignore_remaining_args=1 --`.
///
/// `seed_dirs` must already be resolved, primary first. Relative paths in
/// engine arguments are made absolute against `cwd`.
pub fn build_invocation(
    config: &RunConfiguration,
    executable: &Path,
    seed_dirs: &[PathBuf],
    cwd: &Path,
) -> FuzzerInvocation {
    let mut args = vec![executable.display().to_string()];
    let mut bindings = vec![Binding::read_only(executable)];
    bindings.extend(config.runtime_deps.iter().map(Binding::read_only));

    for (i, dir) in seed_dirs.iter().enumerate() {
        args.push(dir.display().to_string());
        bindings.push(if i == 0 {
            Binding::writable(dir)
        } else {
            Binding::read_only(dir)
        });
    }

    if let Some(dict) = &config.dictionary {
        let dict = absolutize(dict, cwd);
        args.push(format!("-dict={}", dict.display()));
        bindings.push(Binding::read_only(dict));
    }

    let mut user_artifact_path = false;
    for arg in &config.engine_args {
        match path_flag(arg) {
            Some((flag, value, usage)) => {
                if matches!(usage, PathUse::WritablePrefix | PathUse::WritableFile) && flag != "-merge_control_file=" {
                    user_artifact_path = true;
                }
                let (rewritten, extra) = expose_path_flag(flag, value, usage, cwd);
                args.push(rewritten);
                bindings.extend(extra);
            }
            None => args.push(arg.clone()),
        }
    }

    if !user_artifact_path {
        if let Some(dir) = &config.artifact_dir {
            args.push(format!("-artifact_prefix={}/", dir.display()));
            bindings.push(Binding::writable(dir));
        }
    }

    if !config.target_args.is_empty() {
        args.push("-ignore_remaining_args=1".to_string());
        args.push(TARGET_ARGS_SEPARATOR.to_string());
        args.extend(config.target_args.iter().cloned());
    }

    FuzzerInvocation { args, bindings }
}

/// Environment entries set explicitly for the fuzzer: the configured ones,
/// sanitizer defaults not already present in `inherited`, and the
/// symbolizer location.
pub fn fuzzer_env(
    config: &RunConfiguration,
    inherited: &[String],
    symbolizer: Option<&Path>,
) -> Vec<String> {
    let mut out = config.env.clone();
    for (key, value) in DEFAULT_ENV {
        if env::get(&out, key).is_none() && env::get(inherited, key).is_none() {
            env::set(&mut out, key, value);
        }
    }
    if let Some(path) = symbolizer {
        if env::get(&out, "LLVM_SYMBOLIZER_PATH").is_none() {
            env::set(&mut out, "LLVM_SYMBOLIZER_PATH", &path.display().to_string());
        }
    }
    out
}

fn path_flag(arg: &str) -> Option<(&'static str, &str, PathUse)> {
    PATH_FLAGS.iter().find_map(|(flag, usage)| {
        arg.strip_prefix(flag)
            .filter(|v| !v.is_empty())
            .map(|value| (*flag, value, *usage))
    })
}

fn expose_path_flag(flag: &str, value: &str, usage: PathUse, cwd: &Path) -> (String, Vec<Binding>) {
    match usage {
        PathUse::ReadOnlyList => {
            let files: Vec<PathBuf> = value
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|s| absolutize(Path::new(s), cwd))
                .collect();
            let joined = files
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(",");
            let bindings = files.into_iter().map(Binding::read_only).collect();
            (format!("{}{}", flag, joined), bindings)
        }
        PathUse::WritablePrefix => {
            let keep_slash = value.ends_with('/');
            let path = absolutize(Path::new(value), cwd);
            let dir = if keep_slash {
                path.clone()
            } else {
                path.parent().map(Path::to_path_buf).unwrap_or_else(|| cwd.to_path_buf())
            };
            let mut rendered = path.display().to_string();
            if keep_slash && !rendered.ends_with('/') {
                rendered.push('/');
            }
            (format!("{}{}", flag, rendered), vec![Binding::writable(dir)])
        }
        PathUse::WritableFile => {
            let path = absolutize(Path::new(value), cwd);
            let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| cwd.to_path_buf());
            (format!("{}{}", flag, path.display()), vec![Binding::writable(dir)])
        }
        PathUse::WritableDir => {
            let path = absolutize(Path::new(value), cwd);
            (format!("{}{}", flag, path.display()), vec![Binding::writable(path)])
        }
    }
}

fn absolutize(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RunConfiguration {
        let mut cfg = RunConfiguration::new("/work/fuzz_me", "/work/corpus");
        cfg.additional_seed_dirs = vec![PathBuf::from("/work/seeds")];
        cfg
    }

    #[test]
    fn argument_order() {
        let mut cfg = config();
        cfg.dictionary = Some(PathBuf::from("/work/fuzz.dict"));
        cfg.engine_args = vec!["-max_len=64".to_string()];
        cfg.target_args = vec!["--mode=fast".to_string()];
        cfg.artifact_dir = Some(PathBuf::from("/work/.fuzzbox-artifacts/fuzz_me"));

        let inv = build_invocation(
            &cfg,
            Path::new("/work/fuzz_me"),
            &[PathBuf::from("/work/corpus"), PathBuf::from("/work/seeds")],
            Path::new("/work"),
        );
        assert_eq!(
            inv.args,
            vec![
                "/work/fuzz_me",
                "/work/corpus",
                "/work/seeds",
                "-dict=/work/fuzz.dict",
                "-max_len=64",
                "-artifact_prefix=/work/.fuzzbox-artifacts/fuzz_me/",
                "-ignore_remaining_args=1",
                "--",
                "--mode=fast",
            ]
        );
        assert_eq!(inv.bindings[0], Binding::read_only("/work/fuzz_me"));
        assert_eq!(inv.bindings[1], Binding::writable("/work/corpus"));
        assert_eq!(inv.bindings[2], Binding::read_only("/work/seeds"));
        assert!(inv.bindings.contains(&Binding::read_only("/work/fuzz.dict")));
        assert!(inv.bindings.contains(&Binding::writable("/work/.fuzzbox-artifacts/fuzz_me")));
    }

    #[test]
    fn user_artifact_prefix_wins_and_is_absolutized() {
        let mut cfg = config();
        cfg.engine_args = vec!["-artifact_prefix=out/crash-".to_string()];
        cfg.artifact_dir = Some(PathBuf::from("/ignored"));

        let inv = build_invocation(&cfg, Path::new("/work/fuzz_me"), &[PathBuf::from("/work/corpus")], Path::new("/home/u"));
        assert!(inv.args.contains(&"-artifact_prefix=/home/u/out/crash-".to_string()));
        assert!(!inv.args.iter().any(|a| a.contains("/ignored")));
        assert!(inv.bindings.contains(&Binding::writable("/home/u/out")));
    }

    #[test]
    fn seed_inputs_are_bound_read_only() {
        let mut cfg = config();
        cfg.engine_args = vec!["-seed_inputs=a.bin,/abs/b.bin".to_string()];
        let inv = build_invocation(&cfg, Path::new("/work/fuzz_me"), &[PathBuf::from("/work/corpus")], Path::new("/w"));
        assert!(inv.args.contains(&"-seed_inputs=/w/a.bin,/abs/b.bin".to_string()));
        assert!(inv.bindings.contains(&Binding::read_only("/w/a.bin")));
        assert!(inv.bindings.contains(&Binding::read_only("/abs/b.bin")));
    }

    #[test]
    fn no_separator_without_target_args() {
        let inv = build_invocation(&config(), Path::new("/work/fuzz_me"), &[PathBuf::from("/work/corpus")], Path::new("/"));
        assert!(!inv.args.contains(&TARGET_ARGS_SEPARATOR.to_string()));
    }

    #[test]
    fn env_defaults_do_not_override() {
        let mut cfg = config();
        cfg.env = vec!["UBSAN_OPTIONS=halt_on_error=1".to_string()];
        let inherited = vec!["ASAN_OPTIONS=detect_leaks=1".to_string()];
        let env = fuzzer_env(&cfg, &inherited, Some(Path::new("/opt/llvm/bin/llvm-symbolizer")));
        assert_eq!(
            env,
            vec![
                "UBSAN_OPTIONS=halt_on_error=1",
                "LLVM_SYMBOLIZER_PATH=/opt/llvm/bin/llvm-symbolizer",
            ]
        );
    }
}
