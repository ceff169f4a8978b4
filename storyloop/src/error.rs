//! Typed failures the loop recovers from or the CLI maps to exit codes.
//!
//! Everything else travels as plain `anyhow::Error` with context.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::protocol::ProtocolViolation;
use crate::core::types::AttemptOutcome;

/// Why one delegation attempt was rejected. Recovered by cleanup + retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptFailure {
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
    #[error("new failures: {}", .new_failures.join(", "))]
    Regression { new_failures: Vec<String> },
    #[error("agent timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

impl AttemptFailure {
    pub fn outcome(&self) -> AttemptOutcome {
        match self {
            AttemptFailure::Timeout(_) => AttemptOutcome::TimedOut,
            _ => AttemptOutcome::Failed,
        }
    }
}

/// Startup problems that make running the loop pointless. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentError {
    #[error("{} is not inside a git work tree", .0.display())]
    NotAGitRepo(PathBuf),
    #[error("repository has no commits yet (create an initial commit first)")]
    NoHeadCommit,
    #[error("manifest not found: {}", .0.display())]
    MissingManifest(PathBuf),
    #[error("invalid manifest {}: {}", .path.display(), .problems.join("; "))]
    InvalidManifest { path: PathBuf, problems: Vec<String> },
    #[error("{role} command '{program}' not found on PATH")]
    MissingTool { role: String, program: String },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("no eligible story but {} remain unfinished: {}", .0.len(), .0.join(", "))]
    Blocked(Vec<String>),
}

/// A story failed `attempts` times in a row.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("story {story_id} failed {attempts} attempts; last failure: {last_failure}")]
pub struct RetriesExhausted {
    pub story_id: String,
    pub attempts: u32,
    pub last_failure: String,
}

/// The full gate pass after a wave found failures no story was blamed for.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("wave checkpoint found new failures: {}", .new_failures.join(", "))]
pub struct WaveCheckpointFailed {
    pub new_failures: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Phase;

    #[test]
    fn messages_name_the_failure() {
        let protocol = AttemptFailure::from(ProtocolViolation::MissingPhase(Phase::Red));
        assert_eq!(
            protocol.to_string(),
            "protocol violation: missing red phase (no commit tagged [RED])"
        );
        let regression = AttemptFailure::Regression {
            new_failures: vec!["a::b".to_string(), "lint".to_string()],
        };
        assert_eq!(regression.to_string(), "new failures: a::b, lint");
        assert_eq!(regression.outcome(), AttemptOutcome::Failed);
        assert_eq!(
            AttemptFailure::Timeout(Duration::from_secs(90)).outcome(),
            AttemptOutcome::TimedOut
        );
    }

    #[test]
    fn typed_errors_survive_anyhow() {
        let err = anyhow::Error::new(RetriesExhausted {
            story_id: "US-2".to_string(),
            attempts: 3,
            last_failure: "new failures: t".to_string(),
        })
        .context("run loop");
        let exhausted = err.downcast_ref::<RetriesExhausted>().expect("typed");
        assert_eq!(exhausted.story_id, "US-2");
    }
}
