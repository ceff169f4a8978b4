//! Hybrid commit attribution for waves of concurrently worked stories.
//!
//! A commit belongs to a story when its message names the story id, or when it
//! touches one of the story's declared files. Workers do not tag every commit,
//! and file overlap alone misfires on shared files, so both signals are used:
//! an explicit id mention takes precedence over file overlap.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::manifest::Story;

/// Immutable snapshot of one commit taken at a wave boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub hash: String,
    pub message: String,
    pub files: Vec<String>,
}

/// How to settle a commit that matches more than one story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreak {
    /// Earliest matching story in manifest order takes the commit.
    #[default]
    FirstCome,
    /// Every matching story claims the commit.
    Shared,
}

/// Story → commit mapping over a commit arena.
///
/// Commit indices point into the slice passed to [`attribute`], which is kept
/// oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Attribution {
    by_story: BTreeMap<String, Vec<usize>>,
    unattributed: Vec<usize>,
}

impl Attribution {
    /// Indices of commits attributed to `story_id`, oldest first.
    pub fn commits_for(&self, story_id: &str) -> &[usize] {
        self.by_story
            .get(story_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Commits that matched no story; ignored by verification and revert.
    pub fn unattributed(&self) -> &[usize] {
        &self.unattributed
    }

    /// Attributed commits for `story_id`, oldest first.
    pub fn records_for<'a>(
        &self,
        story_id: &str,
        commits: &'a [CommitRecord],
    ) -> Vec<&'a CommitRecord> {
        self.commits_for(story_id)
            .iter()
            .filter_map(|idx| commits.get(*idx))
            .collect()
    }

    /// Attributed commit messages for `story_id`, newest first (the order
    /// `git log` prints and the protocol check expects).
    pub fn messages_newest_first<'a>(
        &self,
        story_id: &str,
        commits: &'a [CommitRecord],
    ) -> Vec<&'a str> {
        let mut messages: Vec<&str> = self
            .records_for(story_id, commits)
            .into_iter()
            .map(|commit| commit.message.as_str())
            .collect();
        messages.reverse();
        messages
    }
}

/// Attribute `commits` (oldest first) to `stories` (manifest order).
pub fn attribute(commits: &[CommitRecord], stories: &[&Story], tie_break: TieBreak) -> Attribution {
    let mut attribution = Attribution::default();
    for story in stories {
        attribution.by_story.entry(story.id.clone()).or_default();
    }

    for (idx, commit) in commits.iter().enumerate() {
        let mut candidates: Vec<&Story> = stories
            .iter()
            .copied()
            .filter(|story| mentions_id(&commit.message, &story.id))
            .collect();
        if candidates.is_empty() {
            candidates = stories
                .iter()
                .copied()
                .filter(|story| touches_declared(&commit.files, &story.files))
                .collect();
        }

        if candidates.is_empty() {
            attribution.unattributed.push(idx);
            continue;
        }
        if tie_break == TieBreak::FirstCome {
            candidates.truncate(1);
        }
        for story in candidates {
            attribution
                .by_story
                .entry(story.id.clone())
                .or_default()
                .push(idx);
        }
    }

    attribution
}

/// True if `message` names `id` as a whole token (`US-1` does not match `US-10`).
pub fn mentions_id(message: &str, id: &str) -> bool {
    if id.is_empty() {
        return false;
    }
    message.match_indices(id).any(|(start, _)| {
        let before = message[..start].chars().next_back();
        let after = message[start + id.len()..].chars().next();
        !before.is_some_and(is_id_char) && !after.is_some_and(is_id_char)
    })
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// True if any changed path falls under any declared entry.
pub fn touches_declared(changed: &[String], declared: &[String]) -> bool {
    changed
        .iter()
        .any(|path| declared.iter().any(|entry| path_matches(entry, path)))
}

/// Match one changed path against a declared entry.
///
/// Entries may be exact paths, directories (`src/auth` or `src/auth/`), or glob
/// patterns (`src/**/*.rs`).
pub fn path_matches(declared: &str, path: &str) -> bool {
    let declared = normalize(declared);
    let path = normalize(path);
    if declared.is_empty() {
        return false;
    }
    if declared.contains(['*', '?', '[']) {
        return glob::Pattern::new(declared).is_ok_and(|pattern| pattern.matches(path));
    }
    let dir = declared.trim_end_matches('/');
    path == dir || path.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
}

fn normalize(path: &str) -> &str {
    path.trim().trim_start_matches("./")
}
