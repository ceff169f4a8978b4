//! Persisted baselines under `.storyloop/baselines/<name>.json`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use super::atomic::write_json_atomic;
use crate::core::baseline::Baseline;

/// Baseline captured once when a run starts.
pub const LOOP_INIT: &str = "loop-init";
/// Rolling baseline for sequential mode, refreshed after each clean pass.
pub const CURRENT: &str = "current";

/// Name of the baseline persisted for one story in teams mode.
pub fn story_baseline_name(story_id: &str) -> String {
    format!("story-{story_id}")
}

#[derive(Debug, Clone)]
pub struct BaselineStore {
    dir: PathBuf,
}

impl BaselineStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(name)))
    }

    pub fn load(&self, name: &str) -> Result<Option<Baseline>> {
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read baseline {}", path.display()))?;
        let baseline: Baseline = serde_json::from_str(&contents)
            .with_context(|| format!("parse baseline {}", path.display()))?;
        debug!(
            name,
            revision = %baseline.revision,
            failing = baseline.failing.len(),
            "baseline loaded"
        );
        Ok(Some(baseline))
    }

    /// Persist `baseline` under its own name.
    pub fn save(&self, baseline: &Baseline) -> Result<PathBuf> {
        let path = self.path_for(&baseline.name);
        debug!(
            name = %baseline.name,
            revision = %baseline.revision,
            failing = baseline.failing.len(),
            "saving baseline"
        );
        write_json_atomic(&path, baseline)?;
        Ok(path)
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let path = self.path_for(name);
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Story ids are free-form; keep file names portable.
fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeSet;

    #[test]
    fn save_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = BaselineStore::new(temp.path().join("baselines"));
        let failing: BTreeSet<String> = ["test_x".to_string()].into_iter().collect();
        let baseline = Baseline::new(
            story_baseline_name("US-1"),
            "abc123",
            Some("US-1"),
            failing,
            Utc::now(),
        );
        store.save(&baseline).expect("save");

        let loaded = store.load("story-US-1").expect("load");
        assert_eq!(loaded, Some(baseline));
        assert_eq!(store.load(CURRENT).expect("load"), None);
    }

    #[test]
    fn odd_story_ids_become_safe_file_names() {
        let store = BaselineStore::new("/tmp/b");
        assert_eq!(
            store.path_for("story-feat/login page"),
            PathBuf::from("/tmp/b/story-feat_login_page.json")
        );
    }

    #[test]
    fn remove_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = BaselineStore::new(temp.path());
        store
            .save(&Baseline::new(LOOP_INIT, "r", None, BTreeSet::new(), Utc::now()))
            .expect("save");
        store.remove(LOOP_INIT).expect("remove");
        store.remove(LOOP_INIT).expect("remove again");
        assert!(!store.path_for(LOOP_INIT).exists());
    }
}
