//! Story manifest model (the backlog file the loop drives to completion).

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Manifest layout version written by this crate.
pub const SCHEMA_VERSION: u32 = 1;

/// Lifecycle state of a story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Pending,
    InProgress,
    Passed,
    Failed,
}

impl StoryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StoryStatus::Pending => "pending",
            StoryStatus::InProgress => "in_progress",
            StoryStatus::Passed => "passed",
            StoryStatus::Failed => "failed",
        }
    }
}

/// One schedulable unit of backlog work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StoryRecord", into = "StoryRecord")]
pub struct Story {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: StoryStatus,
    pub depends_on: Vec<String>,
    /// Paths (or globs) the story is expected to touch. Used for attribution and
    /// scoping, never enforced.
    pub files: Vec<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Story {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: StoryStatus::Pending,
            depends_on: Vec::new(),
            files: Vec::new(),
            completed_at: None,
        }
    }

    pub fn is_passed(&self) -> bool {
        self.status == StoryStatus::Passed
    }
}

/// On-disk shape of a story.
///
/// Older manifests only carry `passes: bool`; `status` wins when both exist.
/// Writes always emit both so either kind of reader keeps working.
#[derive(Serialize, Deserialize)]
struct StoryRecord {
    id: String,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    status: Option<StoryStatus>,
    #[serde(default)]
    passes: bool,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
}

impl From<StoryRecord> for Story {
    fn from(record: StoryRecord) -> Self {
        let status = record.status.unwrap_or(if record.passes {
            StoryStatus::Passed
        } else {
            StoryStatus::Pending
        });
        Self {
            id: record.id,
            title: record.title,
            description: record.description,
            status,
            depends_on: record.depends_on,
            files: record.files,
            completed_at: record.completed_at,
        }
    }
}

impl From<Story> for StoryRecord {
    fn from(story: Story) -> Self {
        Self {
            passes: story.is_passed(),
            id: story.id,
            title: story.title,
            description: story.description,
            status: Some(story.status),
            depends_on: story.depends_on,
            files: story.files,
            completed_at: story.completed_at,
        }
    }
}

/// Rejected status transitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("unknown story '{0}'")]
    UnknownStory(String),
    #[error("story '{story}' cannot pass before dependency '{dependency}' has passed")]
    DependencyNotPassed { story: String, dependency: String },
}

/// Ordered backlog plus metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub stories: Vec<Story>,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl Manifest {
    pub fn new(stories: Vec<Story>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            project: None,
            stories,
        }
    }

    pub fn story(&self, id: &str) -> Option<&Story> {
        self.stories.iter().find(|story| story.id == id)
    }

    fn story_mut(&mut self, id: &str) -> Result<&mut Story, ManifestError> {
        self.stories
            .iter_mut()
            .find(|story| story.id == id)
            .ok_or_else(|| ManifestError::UnknownStory(id.to_string()))
    }

    /// Ids of every story whose status is `Passed`.
    pub fn passed_ids(&self) -> HashSet<&str> {
        self.stories
            .iter()
            .filter(|story| story.is_passed())
            .map(|story| story.id.as_str())
            .collect()
    }

    pub fn passed_count(&self) -> usize {
        self.stories.iter().filter(|story| story.is_passed()).count()
    }

    pub fn is_complete(&self) -> bool {
        !self.stories.is_empty() && self.stories.iter().all(Story::is_passed)
    }

    /// Position of `id` in manifest order (used for deterministic tie-breaks).
    pub fn position(&self, id: &str) -> Option<usize> {
        self.stories.iter().position(|story| story.id == id)
    }

    pub fn mark_in_progress(&mut self, id: &str) -> Result<(), ManifestError> {
        let story = self.story_mut(id)?;
        story.status = StoryStatus::InProgress;
        Ok(())
    }

    pub fn mark_failed(&mut self, id: &str) -> Result<(), ManifestError> {
        let story = self.story_mut(id)?;
        story.status = StoryStatus::Failed;
        story.completed_at = None;
        Ok(())
    }

    /// Mark `id` as passed, refusing while any dependency is not yet `Passed`.
    pub fn mark_passed(&mut self, id: &str, at: DateTime<Utc>) -> Result<(), ManifestError> {
        let pending_dependency = {
            let story = self
                .story(id)
                .ok_or_else(|| ManifestError::UnknownStory(id.to_string()))?;
            story
                .depends_on
                .iter()
                .find(|dep| !self.story(dep).is_some_and(Story::is_passed))
                .cloned()
        };
        if let Some(dependency) = pending_dependency {
            return Err(ManifestError::DependencyNotPassed {
                story: id.to_string(),
                dependency,
            });
        }
        let story = self.story_mut(id)?;
        story.status = StoryStatus::Passed;
        story.completed_at = Some(at);
        Ok(())
    }

    /// Put every story back to `Pending` (used by `reset --stories`).
    pub fn reset_all(&mut self) {
        for story in &mut self.stories {
            story.status = StoryStatus::Pending;
            story.completed_at = None;
        }
    }
}
