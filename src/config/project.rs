/// Project configuration loading from fuzzbox.json
use crate::config::types::{FuzzError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const PROJECT_CONFIG_FILE: &str = "fuzzbox.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildSystem {
    Cmake,
    Other,
}

/// Settings read from the project file. Every key is optional; command
/// line flags take precedence over all of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    pub build_system: Option<BuildSystem>,
    pub build_command: Option<String>,
    #[serde(default)]
    pub seed_corpus_dirs: Vec<PathBuf>,
    pub dictionary: Option<PathBuf>,
    #[serde(default)]
    pub engine_args: Vec<String>,
    /// Duration string such as "30s" or "10m"
    pub timeout: Option<String>,
    pub sandbox: Option<bool>,
    pub print_json: Option<bool>,
}

/// A located project: its root directory plus the parsed project file.
#[derive(Debug, Clone)]
pub struct Project {
    pub root: PathBuf,
    pub config: ProjectConfig,
}

impl Project {
    /// Walk up from `start` looking for the project file. Without one the
    /// start directory is the project root and every setting is default.
    pub fn discover(start: &Path) -> Result<Self> {
        let start = start.canonicalize()?;
        for dir in start.ancestors() {
            let candidate = dir.join(PROJECT_CONFIG_FILE);
            if candidate.is_file() {
                log::debug!("Using project file {}", candidate.display());
                return Self::load(dir);
            }
        }

        Ok(Self {
            root: start,
            config: ProjectConfig::default(),
        })
    }

    /// Load the project file in `root`.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(PROJECT_CONFIG_FILE);
        let content = std::fs::read_to_string(&path)?;
        let mut config: ProjectConfig = serde_json::from_str(&content).map_err(|e| {
            FuzzError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;

        // Relative paths in the project file are relative to the project root.
        config.seed_corpus_dirs = config
            .seed_corpus_dirs
            .into_iter()
            .map(|dir| root.join(dir))
            .collect();
        config.dictionary = config.dictionary.map(|dict| root.join(dict));

        Ok(Self {
            root: root.to_path_buf(),
            config,
        })
    }

    pub fn build_system(&self) -> BuildSystem {
        match self.config.build_system {
            Some(system) => system,
            None if self.root.join("CMakeLists.txt").is_file() => BuildSystem::Cmake,
            None => BuildSystem::Other,
        }
    }

    /// Persisted corpus for `target`, used when no seed dir is given.
    pub fn generated_corpus_dir(&self, target: &str) -> PathBuf {
        self.root.join(".fuzzbox-corpus").join(target)
    }

    pub fn artifact_dir(&self, target: &str) -> PathBuf {
        self.root.join(".fuzzbox-artifacts").join(target)
    }

    pub fn build_root(&self) -> PathBuf {
        self.root.join(".fuzzbox-build")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn discover_walks_up_to_project_file() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join(PROJECT_CONFIG_FILE),
            r#"{"build_command": "make fuzz", "seed_corpus_dirs": ["seeds"], "sandbox": false}"#,
        )
        .unwrap();
        let nested = tmp.path().join("src").join("deep");
        fs::create_dir_all(&nested).unwrap();

        let project = Project::discover(&nested).unwrap();
        assert_eq!(project.root, tmp.path().canonicalize().unwrap());
        assert_eq!(project.config.build_command.as_deref(), Some("make fuzz"));
        assert_eq!(project.config.sandbox, Some(false));
        assert_eq!(project.config.seed_corpus_dirs, vec![project.root.join("seeds")]);
        assert_eq!(project.build_system(), BuildSystem::Other);
    }

    #[test]
    fn cmake_is_detected_without_project_file() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("CMakeLists.txt"), "project(x)\n").unwrap();
        let project = Project::discover(tmp.path()).unwrap();
        assert_eq!(project.config, ProjectConfig::default());
        assert_eq!(project.build_system(), BuildSystem::Cmake);
        assert!(project
            .generated_corpus_dir("my_fuzz_test")
            .ends_with(".fuzzbox-corpus/my_fuzz_test"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(PROJECT_CONFIG_FILE), r#"{"sandbox": true, "bogus": 1}"#).unwrap();
        let err = Project::load(tmp.path()).unwrap_err();
        assert!(matches!(err, FuzzError::Config(_)), "got {err:?}");
    }
}
