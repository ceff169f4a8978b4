//! Manifest load/save helpers with schema + invariant validation.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use jsonschema::Validator;
use serde_json::Value;
use tracing::debug;

use super::atomic::write_json_atomic;
use crate::core::invariants::validate_invariants;
use crate::error::EnvironmentError;
use crate::manifest::Manifest;

pub const MANIFEST_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/manifest.schema.json"
));

static VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(MANIFEST_SCHEMA).expect("embedded manifest schema should be JSON");
    jsonschema::validator_for(&schema).expect("embedded manifest schema should compile")
});

/// Every schema and invariant problem in the manifest at `path`.
///
/// Unreadable or non-JSON files are errors; an empty vector means the manifest is valid.
pub fn check_manifest(path: &Path) -> Result<Vec<String>> {
    let value = read_value(path)?;
    let mut problems: Vec<String> = VALIDATOR
        .iter_errors(&value)
        .map(|err| format!("schema: {err}"))
        .collect();
    if !problems.is_empty() {
        return Ok(problems);
    }
    let manifest: Manifest = serde_json::from_value(value)
        .with_context(|| format!("deserialize manifest {}", path.display()))?;
    problems.extend(validate_invariants(&manifest));
    Ok(problems)
}

/// Load and validate the manifest (schema + invariants).
pub fn load_manifest(path: &Path) -> Result<Manifest> {
    let value = read_value(path)?;
    if !VALIDATOR.is_valid(&value) {
        let messages: Vec<String> = VALIDATOR.iter_errors(&value).map(|e| e.to_string()).collect();
        return Err(anyhow!(
            "manifest schema validation failed: {}",
            messages.join("; ")
        ));
    }
    let manifest: Manifest = serde_json::from_value(value)
        .with_context(|| format!("deserialize manifest {}", path.display()))?;
    let errors = validate_invariants(&manifest);
    if !errors.is_empty() {
        return Err(anyhow!("manifest invariants failed: {}", errors.join("; ")));
    }
    debug!(path = %path.display(), stories = manifest.stories.len(), "manifest loaded");
    Ok(manifest)
}

/// Load the manifest, turning a missing or invalid file into an [`EnvironmentError`].
pub fn open_manifest(path: &Path) -> Result<Manifest> {
    if !path.is_file() {
        return Err(EnvironmentError::MissingManifest(path.to_path_buf()).into());
    }
    let problems = check_manifest(path).map_err(|err| EnvironmentError::InvalidManifest {
        path: path.to_path_buf(),
        problems: vec![format!("{err:#}")],
    })?;
    if !problems.is_empty() {
        return Err(EnvironmentError::InvalidManifest {
            path: path.to_path_buf(),
            problems,
        }
        .into());
    }
    load_manifest(path)
}

/// Atomically persist the manifest (temp file + rename).
pub fn write_manifest(path: &Path, manifest: &Manifest) -> Result<()> {
    debug!(path = %path.display(), passed = manifest.passed_count(), "writing manifest");
    write_json_atomic(path, manifest)
}

fn read_value(path: &Path) -> Result<Value> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read manifest {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse manifest {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::StoryStatus;
    use crate::test_support::{manifest, story, story_with_deps};

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("prd.json");
        let mut m = manifest(vec![story("A"), story_with_deps("B", &["A"])]);
        m.mark_passed("A", chrono::Utc::now()).expect("pass");
        write_manifest(&path, &m).expect("write");

        let loaded = load_manifest(&path).expect("load");
        assert_eq!(loaded, m);
        assert_eq!(loaded.stories[0].status, StoryStatus::Passed);
    }

    #[test]
    fn schema_rejects_empty_backlog_and_bad_status() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("prd.json");

        fs::write(&path, r#"{"stories": []}"#).expect("write");
        assert!(load_manifest(&path).is_err());
        assert!(!check_manifest(&path).expect("check").is_empty());

        fs::write(&path, r#"{"stories": [{"id": "A", "title": "a", "status": "done"}]}"#)
            .expect("write");
        let problems = check_manifest(&path).expect("check");
        assert!(problems.iter().any(|p| p.contains("schema")));
    }

    #[test]
    fn invariants_are_checked_after_schema() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("prd.json");
        fs::write(
            &path,
            r#"{"stories": [{"id": "A", "title": "a", "depends_on": ["B"]}]}"#,
        )
        .expect("write");
        let err = load_manifest(&path).unwrap_err();
        assert!(err.to_string().contains("unknown dependency 'B'"));
        assert_eq!(
            check_manifest(&path).expect("check"),
            vec!["A: unknown dependency 'B'".to_string()]
        );
    }

    #[test]
    fn invalid_json_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("prd.json");
        fs::write(&path, "{not json").expect("write");
        assert!(check_manifest(&path).is_err());
    }

    #[test]
    fn open_manifest_types_missing_and_invalid_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("prd.json");
        let err = open_manifest(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EnvironmentError>(),
            Some(EnvironmentError::MissingManifest(_))
        ));

        fs::write(&path, "{not json").expect("write");
        let err = open_manifest(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EnvironmentError>(),
            Some(EnvironmentError::InvalidManifest { .. })
        ));
    }
}
