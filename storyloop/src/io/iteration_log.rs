//! Iteration logging helpers for `.storyloop/iterations/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::AttemptOutcome;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IterationMeta {
    pub run_id: String,
    pub iter: u32,
    pub story_id: String,
    /// Peers delegated alongside the primary in teams mode.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peers: Vec<String>,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub base_revision: String,
    pub head_revision: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub note: String,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub brief_path: PathBuf,
    pub agent_log_path: PathBuf,
    pub gates_log_path: PathBuf,
}

impl IterationPaths {
    pub fn new(iterations_dir: &Path, run_id: &str, iter: u32) -> Self {
        Self::at(iterations_dir.join(run_id).join(iter.to_string()))
    }

    fn at(dir: PathBuf) -> Self {
        Self {
            meta_path: dir.join("meta.json"),
            brief_path: dir.join("brief.md"),
            agent_log_path: dir.join("agent.log"),
            gates_log_path: dir.join("gates.log"),
            dir,
        }
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create iteration dir {}", self.dir.display()))
    }
}

pub fn write_brief(paths: &IterationPaths, brief: &str) -> Result<()> {
    paths.create()?;
    fs::write(&paths.brief_path, brief)
        .with_context(|| format!("write {}", paths.brief_path.display()))
}

pub fn write_meta(paths: &IterationPaths, meta: &IterationMeta) -> Result<()> {
    paths.create()?;
    let mut buf = serde_json::to_string_pretty(meta)?;
    buf.push('\n');
    fs::write(&paths.meta_path, buf)
        .with_context(|| format!("write {}", paths.meta_path.display()))
}

/// Most recent iteration of the most recent run, if any.
///
/// Run ids embed a UTC timestamp, so the greatest name is the latest run.
pub fn latest_iteration(iterations_dir: &Path) -> Result<Option<IterationPaths>> {
    let Some(run_dir) = max_entry(iterations_dir, |name| Some(name.to_string()))? else {
        return Ok(None);
    };
    let iter_dir = max_entry(&run_dir, |name| name.parse::<u32>().ok())?;
    Ok(iter_dir.map(IterationPaths::at))
}

fn max_entry<K: Ord>(dir: &Path, key: impl Fn(&str) -> Option<K>) -> Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut best: Option<(K, PathBuf)> = None;
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(k) = key(&name) else { continue };
        if best.as_ref().is_none_or(|(current, _)| k > *current) {
            best = Some((k, entry.path()));
        }
    }
    Ok(best.map(|(_, path)| path))
}
