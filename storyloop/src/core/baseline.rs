//! Baseline of accepted check failures and regression classification.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Failing checks accepted as pre-existing at one repository revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baseline {
    pub name: String,
    pub captured_at: DateTime<Utc>,
    /// Revision the failing set was observed at. The baseline is only trusted
    /// while this matches the revision a story starts from.
    pub revision: String,
    pub story_id: Option<String>,
    pub failing: BTreeSet<String>,
}

impl Baseline {
    pub fn new(
        name: impl Into<String>,
        revision: impl Into<String>,
        story_id: Option<&str>,
        failing: BTreeSet<String>,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            captured_at,
            revision: revision.into(),
            story_id: story_id.map(str::to_string),
            failing,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failing.is_empty()
    }

    pub fn matches_revision(&self, revision: &str) -> bool {
        self.revision == revision
    }

    /// True if captured at `revision` no more than `max_age_secs` before `now`.
    pub fn is_fresh(&self, revision: &str, now: DateTime<Utc>, max_age_secs: u64) -> bool {
        if !self.matches_revision(revision) {
            return false;
        }
        let age = now.signed_duration_since(self.captured_at).num_seconds();
        age >= 0 && (age as u64) <= max_age_secs
    }
}

/// Classification of current failures against a baseline.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Comparison {
    /// Failing now, not failing in the baseline. Must be empty to pass.
    pub new: Vec<String>,
    /// Failing in the baseline, passing now.
    pub resolved: Vec<String>,
    /// Failing in both; tolerated.
    pub preexisting_count: usize,
}

impl Comparison {
    pub fn passes(&self) -> bool {
        self.new.is_empty()
    }
}

/// Partition `current` failures into new, resolved and pre-existing.
pub fn compare(baseline: &Baseline, current: &BTreeSet<String>) -> Comparison {
    Comparison {
        new: current.difference(&baseline.failing).cloned().collect(),
        resolved: baseline.failing.difference(current).cloned().collect(),
        preexisting_count: current.intersection(&baseline.failing).count(),
    }
}

/// Baseline that replaces `previous` once `story_id` passed with no new failures.
///
/// The tolerated set never grows: it becomes exactly what still fails at the
/// new revision, and a fully green run resets it to empty for every later story.
pub fn refreshed(
    previous: &Baseline,
    story_id: &str,
    revision: &str,
    current: &BTreeSet<String>,
    now: DateTime<Utc>,
) -> Baseline {
    let failing = if current.is_empty() {
        BTreeSet::new()
    } else {
        current.intersection(&previous.failing).cloned().collect()
    };
    Baseline::new(
        previous.name.clone(),
        revision,
        Some(story_id),
        failing,
        now,
    )
}
