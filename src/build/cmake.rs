use crate::build::{compiler_env, find_executable, run_step, seed_corpus_for, BuildOptions, BuildResult, Builder};
use crate::config::project::Project;
use crate::config::types::{FuzzError, Result};
use crate::utils::env;
use log::info;
use std::path::{Path, PathBuf};
use std::process::Command;
use walkdir::WalkDir;

/// Configures and builds a CMake project in a per-variant build directory.
pub struct CMakeBuilder {
    project_dir: PathBuf,
    build_root: PathBuf,
    options: BuildOptions,
}

impl CMakeBuilder {
    pub fn new(project: &Project, options: BuildOptions) -> Self {
        Self {
            project_dir: project.root.clone(),
            build_root: project.build_root(),
            options,
        }
    }

    /// `<build root>/<engine>/<variant>`
    pub fn build_dir(&self) -> PathBuf {
        self.build_root
            .join(&self.options.engine)
            .join(self.options.variant())
    }

    /// `-D` cache entries passed at configure time.
    pub fn cache_variables(&self) -> Vec<String> {
        let sanitizers = if self.options.coverage {
            "coverage".to_string()
        } else {
            self.options.sanitizers.join(";")
        };
        vec![
            "-DCMAKE_BUILD_TYPE=RelWithDebInfo".to_string(),
            format!("-DFUZZBOX_ENGINE={}", self.options.engine),
            format!("-DFUZZBOX_SANITIZERS={}", sanitizers),
            "-DFUZZBOX_TESTING=ON".to_string(),
            "-DCMAKE_BUILD_RPATH_USE_ORIGIN=ON".to_string(),
        ]
    }

    fn configure(&self, build_dir: &Path, build_env: &[String]) -> Result<()> {
        let mut cmd = Command::new("cmake");
        cmd.arg("-S")
            .arg(&self.project_dir)
            .arg("-B")
            .arg(build_dir)
            .args(self.cache_variables())
            .envs(env::pairs(build_env));
        run_step(cmd, "cmake configure")
    }
}

impl Builder for CMakeBuilder {
    fn name(&self) -> &'static str {
        "cmake"
    }

    fn build(&self, target: &str) -> Result<BuildResult> {
        let build_dir = self.build_dir();
        std::fs::create_dir_all(&build_dir)?;
        let build_env = compiler_env(&self.options, &env::current());

        info!("Building {} in {}", target, build_dir.display());
        self.configure(&build_dir, &build_env)?;

        let mut cmd = Command::new("cmake");
        cmd.arg("--build")
            .arg(&build_dir)
            .arg("--target")
            .arg(target)
            .envs(env::pairs(&build_env));
        run_step(cmd, "cmake build")?;

        let executable = find_executable(&build_dir, target, &["CMakeFiles"]).ok_or_else(|| {
            FuzzError::Build(format!(
                "target {} was built but no executable was found in {}",
                target,
                build_dir.display()
            ))
        })?;

        Ok(BuildResult {
            seed_corpus: seed_corpus_for(&executable, target),
            runtime_deps: shared_objects(&build_dir),
            executable,
        })
    }
}

/// Shared libraries produced by the build.
fn shared_objects(build_dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(build_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            let name = e.file_name().to_string_lossy();
            name.ends_with(".so") || name.contains(".so.")
        })
        .map(|e| e.into_path())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::project::ProjectConfig;

    fn project(root: &Path) -> Project {
        Project {
            root: root.to_path_buf(),
            config: ProjectConfig::default(),
        }
    }

    #[test]
    fn build_dir_is_per_variant() {
        let builder = CMakeBuilder::new(&project(Path::new("/src/app")), BuildOptions::default());
        assert_eq!(
            builder.build_dir(),
            PathBuf::from("/src/app/.fuzzbox-build/libfuzzer/address+undefined")
        );

        let coverage = CMakeBuilder::new(&project(Path::new("/src/app")), BuildOptions::coverage());
        assert!(coverage.build_dir().ends_with("libfuzzer/coverage"));
        assert!(coverage
            .cache_variables()
            .contains(&"-DFUZZBOX_SANITIZERS=coverage".to_string()));
    }

    #[test]
    fn cache_variables_list_sanitizers() {
        let builder = CMakeBuilder::new(&project(Path::new("/p")), BuildOptions::default());
        let vars = builder.cache_variables();
        assert!(vars.contains(&"-DFUZZBOX_SANITIZERS=address;undefined".to_string()));
        assert!(vars.contains(&"-DCMAKE_BUILD_RPATH_USE_ORIGIN=ON".to_string()));
    }

    #[test]
    fn shared_objects_are_runtime_deps() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("lib")).unwrap();
        std::fs::write(tmp.path().join("lib/libparser.so"), b"").unwrap();
        std::fs::write(tmp.path().join("lib/libzip.so.1.2"), b"").unwrap();
        std::fs::write(tmp.path().join("lib/parser.o"), b"").unwrap();

        let deps = shared_objects(tmp.path());
        assert_eq!(
            deps,
            vec![tmp.path().join("lib/libparser.so"), tmp.path().join("lib/libzip.so.1.2")]
        );
    }
}
