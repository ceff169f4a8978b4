//! Deterministic story selection over the dependency graph.

use std::collections::HashSet;

use crate::manifest::{Manifest, Story, StoryStatus};

/// Result of asking the scheduler for work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection<'a> {
    /// Every story has passed.
    Complete,
    /// The first eligible story in manifest order.
    Next(&'a Story),
    /// Open stories remain but each waits on a dependency that has not passed.
    Blocked,
}

/// True if `story` still needs work and every dependency is in `completed`.
///
/// A dependency that is merely in progress never unblocks its dependents.
pub fn is_eligible(story: &Story, completed: &HashSet<&str>) -> bool {
    story.status != StoryStatus::Passed
        && story
            .depends_on
            .iter()
            .all(|dep| completed.contains(dep.as_str()))
}

/// First eligible story in manifest order, or `None` when nothing is runnable.
pub fn next_story(manifest: &Manifest) -> Option<&Story> {
    let completed = manifest.passed_ids();
    manifest
        .stories
        .iter()
        .find(|story| is_eligible(story, &completed))
}

/// Every eligible story except `exclude`, in manifest order.
pub fn wave<'a>(manifest: &'a Manifest, exclude: Option<&str>) -> Vec<&'a Story> {
    let completed = manifest.passed_ids();
    manifest
        .stories
        .iter()
        .filter(|story| Some(story.id.as_str()) != exclude)
        .filter(|story| is_eligible(story, &completed))
        .collect()
}

/// Classify the manifest for the loop's terminal checks.
pub fn select(manifest: &Manifest) -> Selection<'_> {
    match next_story(manifest) {
        Some(story) => Selection::Next(story),
        None if manifest.stories.iter().all(Story::is_passed) => Selection::Complete,
        None => Selection::Blocked,
    }
}
