//! Commit protocol: tests first, then the code that makes them pass, then cleanup.

use thiserror::Error;

use crate::core::types::Phase;

/// Protocol requirements for one story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProtocolPolicy {
    /// Require a `[REFACTOR]` commit in addition to red and green.
    pub refactor_required: bool,
}

impl ProtocolPolicy {
    pub fn min_commits(&self) -> usize {
        if self.refactor_required { 3 } else { 2 }
    }
}

/// Why a story's commits do not satisfy the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("expected at least {required} new commits, found {found}")]
    TooFewCommits { found: usize, required: usize },
    #[error("missing {0} phase (no commit tagged {tag})", tag = .0.tag())]
    MissingPhase(Phase),
    #[error("{later} commit must come after the first {earlier} commit")]
    OutOfOrder { earlier: Phase, later: Phase },
}

/// Where each phase first appears among the inspected commits.
///
/// Indices refer to the newest-first message list, so a larger index is older.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseReport {
    pub commits: usize,
    pub red: usize,
    pub green: usize,
    pub refactor: Option<usize>,
}

/// Check newest-first commit subjects against the protocol.
///
/// Ordering is judged on the earliest commit of each phase: the first red commit
/// must be older than the first green commit, and the first refactor commit (if
/// any) must be newer than the first green commit.
pub fn verify_phases<S: AsRef<str>>(
    messages_newest_first: &[S],
    policy: ProtocolPolicy,
) -> Result<PhaseReport, ProtocolViolation> {
    let required = policy.min_commits();
    if messages_newest_first.len() < required {
        return Err(ProtocolViolation::TooFewCommits {
            found: messages_newest_first.len(),
            required,
        });
    }

    let phases: Vec<Option<Phase>> = messages_newest_first
        .iter()
        .map(|message| Phase::parse(message.as_ref()))
        .collect();
    let earliest = |phase: Phase| phases.iter().rposition(|p| *p == Some(phase));

    let red = earliest(Phase::Red).ok_or(ProtocolViolation::MissingPhase(Phase::Red))?;
    let green = earliest(Phase::Green).ok_or(ProtocolViolation::MissingPhase(Phase::Green))?;
    let refactor = earliest(Phase::Refactor);
    if policy.refactor_required && refactor.is_none() {
        return Err(ProtocolViolation::MissingPhase(Phase::Refactor));
    }

    if red <= green {
        return Err(ProtocolViolation::OutOfOrder {
            earlier: Phase::Red,
            later: Phase::Green,
        });
    }
    if let Some(refactor) = refactor
        && refactor >= green
    {
        return Err(ProtocolViolation::OutOfOrder {
            earlier: Phase::Green,
            later: Phase::Refactor,
        });
    }

    Ok(PhaseReport {
        commits: messages_newest_first.len(),
        red,
        green,
        refactor,
    })
}
