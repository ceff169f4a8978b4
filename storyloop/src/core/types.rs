//! Shared deterministic types for loop core logic.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// TDD phase a commit claims to belong to.
///
/// Agents mark commits with `[RED]`, `[GREEN]` or `[REFACTOR]` in the subject.
/// The raw tag is parsed once at the repository boundary; everything downstream
/// works with this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Red,
    Green,
    Refactor,
}

static PHASE_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[(red|green|refactor)\]").expect("phase tag regex should be valid")
});

impl Phase {
    /// Canonical tag agents are asked to put in commit subjects.
    pub fn tag(self) -> &'static str {
        match self {
            Phase::Red => "[RED]",
            Phase::Green => "[GREEN]",
            Phase::Refactor => "[REFACTOR]",
        }
    }

    /// Parse the first phase tag found in `message` (case-insensitive).
    ///
    /// A message carrying several tags belongs to the first one only, which keeps
    /// the three classes disjoint.
    pub fn parse(message: &str) -> Option<Phase> {
        let caps = PHASE_TAG_RE.captures(message)?;
        match caps.get(1)?.as_str().to_ascii_lowercase().as_str() {
            "red" => Some(Phase::Red),
            "green" => Some(Phase::Green),
            "refactor" => Some(Phase::Refactor),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Red => "red",
            Phase::Green => "green",
            Phase::Refactor => "refactor",
        };
        f.write_str(name)
    }
}

/// Result of a single quality gate command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateOutcome {
    /// Command exited successfully.
    Pass,
    /// Command failed, timed out, or could not be run.
    Fail,
    /// Command not configured, or its scope was empty.
    Skipped,
}

/// Outcome recorded for one story attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Passed,
    Failed,
    TimedOut,
}

impl AttemptOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptOutcome::Passed => "passed",
            AttemptOutcome::Failed => "failed",
            AttemptOutcome::TimedOut => "timed_out",
        }
    }
}
