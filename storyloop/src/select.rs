//! Read-only queries for `storyloop next` and `storyloop status`.

use std::path::Path;

use anyhow::{Context, Result};

use crate::core::progress::progress_bar;
use crate::core::scheduler::{Selection, select};
use crate::io::config::load_config;
use crate::io::init::LoopPaths;
use crate::io::manifest_store::open_manifest;
use crate::io::run_state::{RunState, load_run_state};
use crate::manifest::{Manifest, StoryStatus};

/// Structured answer to "what would the loop pick next?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextOutcome {
    /// Every story has passed.
    Complete,
    Next(NextStory),
    /// Unfinished stories remain but none has its dependencies satisfied.
    Blocked(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextStory {
    pub id: String,
    pub title: String,
    pub attempts: u32,
    pub max_attempts: u32,
}

impl NextStory {
    /// The loop would halt on this story instead of delegating it.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

pub fn next_story_for(manifest: &Manifest, run_state: &RunState, max_attempts: u32) -> NextOutcome {
    match select(manifest) {
        Selection::Complete => NextOutcome::Complete,
        Selection::Next(story) => NextOutcome::Next(NextStory {
            id: story.id.clone(),
            title: story.title.clone(),
            attempts: run_state.attempts_for(&story.id),
            max_attempts,
        }),
        Selection::Blocked => NextOutcome::Blocked(
            manifest
                .stories
                .iter()
                .filter(|story| !story.is_passed())
                .map(|story| story.id.clone())
                .collect(),
        ),
    }
}

/// Load config, manifest and run state from disk and select the next story.
pub fn next_from_root(root: &Path) -> Result<NextOutcome> {
    let (manifest, run_state, max_attempts) = load_for_query(root)?;
    Ok(next_story_for(&manifest, &run_state, max_attempts))
}

/// One manifest line of `storyloop status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRow {
    pub id: String,
    pub title: String,
    pub status: StoryStatus,
    pub attempts: u32,
    pub last_failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub run_id: Option<String>,
    pub rows: Vec<StatusRow>,
    pub next: NextOutcome,
}

impl StatusReport {
    pub fn passed(&self) -> usize {
        self.rows
            .iter()
            .filter(|row| row.status == StoryStatus::Passed)
            .count()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(run_id) = &self.run_id {
            out.push_str(&format!("run: {run_id}\n"));
        }
        out.push_str(&progress_bar(self.passed(), self.rows.len()));
        out.push('\n');
        for row in &self.rows {
            out.push_str(&format!(
                "  {:<11} {}  {}",
                row.status.as_str(),
                row.id,
                row.title
            ));
            if row.attempts > 0 && row.status != StoryStatus::Passed {
                out.push_str(&format!(" (attempts: {})", row.attempts));
            }
            out.push('\n');
            if let Some(failure) = &row.last_failure
                && row.status == StoryStatus::Failed
            {
                out.push_str(&format!("              last failure: {failure}\n"));
            }
        }
        match &self.next {
            NextOutcome::Complete => out.push_str("next: none (all stories passed)\n"),
            NextOutcome::Next(next) => out.push_str(&format!("next: {}\n", next.id)),
            NextOutcome::Blocked(ids) => {
                out.push_str(&format!("next: blocked ({})\n", ids.join(", ")));
            }
        }
        out
    }
}

pub fn status_for(manifest: &Manifest, run_state: &RunState, max_attempts: u32) -> StatusReport {
    let rows = manifest
        .stories
        .iter()
        .map(|story| StatusRow {
            id: story.id.clone(),
            title: story.title.clone(),
            status: story.status,
            attempts: run_state.attempts_for(&story.id),
            last_failure: run_state.last_failures.get(&story.id).cloned(),
        })
        .collect();
    StatusReport {
        run_id: run_state.run_id.clone(),
        rows,
        next: next_story_for(manifest, run_state, max_attempts),
    }
}

pub fn status_from_root(root: &Path) -> Result<StatusReport> {
    let (manifest, run_state, max_attempts) = load_for_query(root)?;
    Ok(status_for(&manifest, &run_state, max_attempts))
}

fn load_for_query(root: &Path) -> Result<(Manifest, RunState, u32)> {
    let paths = LoopPaths::new(root);
    let cfg = load_config(&paths.config_path).context("load config.toml")?;
    let manifest = open_manifest(&paths.manifest_path(&cfg))?;
    let run_state = load_run_state(&paths.run_state_path).context("load run state")?;
    Ok((manifest, run_state, cfg.max_attempts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{manifest, passed, story, story_with_deps};

    #[test]
    fn next_reports_attempts_so_far() {
        let m = manifest(vec![passed("US-1"), story("US-2")]);
        let mut state = RunState::default();
        state.record_attempt("US-2");
        let outcome = next_story_for(&m, &state, 3);
        let NextOutcome::Next(next) = outcome else {
            panic!("expected a next story, got {outcome:?}");
        };
        assert_eq!(next.id, "US-2");
        assert_eq!(next.attempts, 1);
        assert!(!next.is_exhausted());
    }

    #[test]
    fn next_is_complete_or_blocked_without_eligible_story() {
        let done = manifest(vec![passed("US-1")]);
        assert_eq!(next_story_for(&done, &RunState::default(), 3), NextOutcome::Complete);

        let blocked = manifest(vec![passed("US-1"), story_with_deps("US-2", &["US-9"])]);
        assert_eq!(
            next_story_for(&blocked, &RunState::default(), 3),
            NextOutcome::Blocked(vec!["US-2".to_string()])
        );
    }

    #[test]
    fn status_render_shows_bar_failures_and_next() {
        let mut m = manifest(vec![passed("US-1"), story("US-2"), story("US-3")]);
        m.stories[1].status = StoryStatus::Failed;
        let mut state = RunState::default();
        state.record_attempt("US-2");
        state.record_failure("US-2", "new failures: test_a");

        let report = status_for(&m, &state, 3);
        assert_eq!(report.passed(), 1);
        let text = report.render();
        assert!(text.contains("1/3 (33%)"), "{text}");
        assert!(text.contains("failed      US-2  US-2 title (attempts: 1)"), "{text}");
        assert!(text.contains("last failure: new failures: test_a"), "{text}");
        assert!(text.ends_with("next: US-2\n"), "{text}");
    }
}
