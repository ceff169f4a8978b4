//! Run state storage for iteration bookkeeping.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::atomic::write_json_atomic;

/// Persisted bookkeeping for the current run (`.storyloop/state/run_state.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunState {
    /// Identifier for the current execution run.
    pub run_id: Option<String>,
    /// Next iteration number (1-indexed, monotonically increasing).
    pub next_iter: u32,
    /// Attempts consumed per story id.
    pub attempts: BTreeMap<String, u32>,
    /// Revision each story's first attempt started from.
    pub base_revisions: BTreeMap<String, String>,
    /// Failure note from each story's most recent failed attempt.
    pub last_failures: BTreeMap<String, String>,
    /// Stories completed in this run with their wall-clock seconds.
    pub completed: Vec<CompletedStory>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletedStory {
    pub story_id: String,
    pub duration_secs: u64,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            run_id: None,
            next_iter: 1,
            attempts: BTreeMap::new(),
            base_revisions: BTreeMap::new(),
            last_failures: BTreeMap::new(),
            completed: Vec::new(),
        }
    }
}

impl RunState {
    pub fn attempts_for(&self, story_id: &str) -> u32 {
        self.attempts.get(story_id).copied().unwrap_or(0)
    }

    /// Count one more attempt for `story_id` and return the new total.
    pub fn record_attempt(&mut self, story_id: &str) -> u32 {
        let count = self.attempts.entry(story_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Remember the revision a story started from; later attempts keep the first one.
    pub fn base_revision_or_insert(&mut self, story_id: &str, revision: &str) -> String {
        self.base_revisions
            .entry(story_id.to_string())
            .or_insert_with(|| revision.to_string())
            .clone()
    }

    pub fn record_failure(&mut self, story_id: &str, note: impl Into<String>) {
        self.last_failures.insert(story_id.to_string(), note.into());
    }

    /// Drop per-story bookkeeping once the story has passed.
    pub fn record_pass(&mut self, story_id: &str, duration_secs: u64) {
        self.attempts.remove(story_id);
        self.base_revisions.remove(story_id);
        self.last_failures.remove(story_id);
        self.completed.push(CompletedStory {
            story_id: story_id.to_string(),
            duration_secs,
        });
    }

    /// Allocate the next iteration number.
    pub fn take_iter(&mut self) -> u32 {
        let iter = self.next_iter;
        self.next_iter += 1;
        iter
    }
}

/// Load run state from disk, or the default when the file does not exist yet.
pub fn load_run_state(path: &Path) -> Result<RunState> {
    if !path.exists() {
        debug!(path = %path.display(), "no run state yet");
        return Ok(RunState::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run state {}", path.display()))?;
    let state: RunState = serde_json::from_str(&contents)
        .with_context(|| format!("parse run state {}", path.display()))?;
    debug!(run_id = ?state.run_id, next_iter = state.next_iter, "run state loaded");
    Ok(state)
}

/// Atomically write run state to disk (temp file + rename).
pub fn write_run_state(path: &Path, state: &RunState) -> Result<()> {
    debug!(
        path = %path.display(),
        run_id = ?state.run_id,
        next_iter = state.next_iter,
        "writing run state"
    );
    write_json_atomic(path, state)
}
