//! Commit-protocol verification against the repository.

use anyhow::Result;
use tracing::debug;

use crate::core::protocol::{PhaseReport, ProtocolPolicy, ProtocolViolation, verify_phases};
use crate::io::git::Git;

/// Check the commits added since `commits_before` follow red, green, then optional refactor.
///
/// The outer `Result` carries git failures; the inner one the verdict.
pub fn verify_new_commits(
    git: &Git,
    commits_before: usize,
    policy: ProtocolPolicy,
) -> Result<Result<PhaseReport, ProtocolViolation>> {
    let after = git.commit_count()?;
    let new = after.saturating_sub(commits_before);
    debug!(commits_before, after, new, "verifying new commits");
    if new < policy.min_commits() {
        return Ok(Err(ProtocolViolation::TooFewCommits {
            found: new,
            required: policy.min_commits(),
        }));
    }
    let messages = git.recent_messages(new)?;
    Ok(verify_phases(&messages, policy))
}
