//! `storyloop validate`: config plus manifest schema and invariants.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::EnvironmentError;
use crate::io::config::load_config;
use crate::io::init::LoopPaths;
use crate::io::manifest_store::{check_manifest, load_manifest};

/// Validation result for a project; `problems` empty means valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateReport {
    pub manifest_path: PathBuf,
    pub stories: usize,
    pub problems: Vec<String>,
}

impl ValidateReport {
    pub fn is_valid(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Check `.storyloop/config.toml` (when present) and the manifest it points at.
///
/// An unreadable config or a missing manifest is an error; schema and
/// invariant violations are collected into the report.
pub fn validate_project(root: &Path) -> Result<ValidateReport> {
    let paths = LoopPaths::new(root);
    let cfg = load_config(&paths.config_path)
        .map_err(|err| EnvironmentError::InvalidConfig(format!("{err:#}")))?;
    let manifest_path = paths.manifest_path(&cfg);
    if !manifest_path.is_file() {
        return Err(EnvironmentError::MissingManifest(manifest_path).into());
    }
    let problems = check_manifest(&manifest_path)
        .with_context(|| format!("check {}", manifest_path.display()))?;
    let stories = if problems.is_empty() {
        load_manifest(&manifest_path)?.stories.len()
    } else {
        0
    };
    Ok(ValidateReport {
        manifest_path,
        stories,
        problems,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::init::ensure_layout;
    use crate::test_support::{TestRepo, story_with_deps};

    #[test]
    fn valid_manifest_reports_story_count() {
        let repo = TestRepo::with_manifest(&["US-1", "US-2"]).expect("repo");
        let report = validate_project(repo.root()).expect("validate");
        assert!(report.is_valid(), "{:?}", report.problems);
        assert_eq!(report.stories, 2);
    }

    #[test]
    fn invariant_violations_are_collected() {
        let repo = TestRepo::with_stories(vec![
            story_with_deps("US-1", &["US-2"]),
            story_with_deps("US-2", &["US-1"]),
        ])
        .expect("repo");
        let report = validate_project(repo.root()).expect("validate");
        assert!(!report.is_valid());
        assert!(
            report.problems.iter().any(|p| p.contains("dependency cycle")),
            "{:?}",
            report.problems
        );
    }

    #[test]
    fn missing_manifest_is_an_environment_error() {
        let repo = TestRepo::new().expect("repo");
        ensure_layout(&LoopPaths::new(repo.root())).expect("layout");
        let err = validate_project(repo.root()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EnvironmentError>(),
            Some(EnvironmentError::MissingManifest(_))
        ));
    }

    #[test]
    fn broken_config_is_an_environment_error() {
        let repo = TestRepo::with_manifest(&["US-1"]).expect("repo");
        let paths = LoopPaths::new(repo.root());
        ensure_layout(&paths).expect("layout");
        std::fs::write(&paths.config_path, "max_attempts = 0\n").expect("write");
        let err = validate_project(repo.root()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EnvironmentError>(),
            Some(EnvironmentError::InvalidConfig(_))
        ));
    }
}
