//! Per-iteration orchestration strategies.
//!
//! The loop controller owns delegation, persistence and retries; an
//! [`Orchestrator`] decides what to delegate and how the result is verified,
//! gated and cleaned up. [`Sequential`] handles one story per iteration;
//! [`Wave`] delegates every unblocked story at once (teams mode).

mod sequential;
mod wave;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use anyhow::Result;

use crate::core::baseline::Comparison;
use crate::core::protocol::ProtocolPolicy;
use crate::error::AttemptFailure;
use crate::io::agent::DelegationResult;
use crate::io::config::LoopConfig;
use crate::io::gates::GateRunner;
use crate::io::git::Git;
use crate::io::iteration_log::IterationPaths;
use crate::manifest::{Manifest, Story};
use crate::regression::RegressionGate;

pub use sequential::Sequential;
pub use wave::Wave;

/// Stories delegated together in one iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub primary: String,
    /// Unblocked stories handed to parallel workers (teams mode only).
    pub peers: Vec<String>,
}

impl WorkUnit {
    pub fn single(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            peers: Vec::new(),
        }
    }

    /// Primary first, then peers.
    pub fn story_ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.peers.iter().map(String::as_str))
    }
}

/// Repository facts captured right before delegation.
#[derive(Debug, Clone)]
pub struct UnitContext<'a> {
    pub manifest: &'a Manifest,
    pub iteration: &'a IterationPaths,
    /// HEAD when the agent was handed the unit.
    pub head_before: String,
    pub commits_before: usize,
    /// Untracked or modified paths that predate the delegation; cleanup leaves them alone.
    pub dirty_before: BTreeSet<String>,
    /// Revision each story's first attempt started from.
    pub story_bases: BTreeMap<String, String>,
}

impl UnitContext<'_> {
    pub fn story_base(&self, story_id: &str) -> &str {
        self.story_bases
            .get(story_id)
            .map(String::as_str)
            .unwrap_or(&self.head_before)
    }
}

/// Outcome for one story of a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryVerdict {
    pub story_id: String,
    pub failure: Option<AttemptFailure>,
    /// Human-readable detail for the progress log.
    pub note: String,
}

impl StoryVerdict {
    pub fn pass(story_id: &str) -> Self {
        Self {
            story_id: story_id.to_string(),
            failure: None,
            note: String::new(),
        }
    }

    pub fn fail(story_id: &str, failure: AttemptFailure) -> Self {
        Self {
            story_id: story_id.to_string(),
            note: failure.to_string(),
            failure: Some(failure),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }

    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }

    fn reject(&mut self, failure: AttemptFailure) {
        self.note = failure.to_string();
        self.failure = Some(failure);
    }
}

/// One way of turning the manifest into delegations and judging the result.
pub trait Orchestrator {
    fn mode(&self) -> &'static str;

    /// Stories to delegate next. `exhausted` stories are never chosen as peers.
    fn next_unit_of_work(&self, manifest: &Manifest, exhausted: &HashSet<&str>) -> Option<WorkUnit>;

    /// Establish the baselines the unit will be gated against.
    fn prepare_unit(&mut self, unit: &WorkUnit, cx: &UnitContext<'_>) -> Result<()>;

    /// Commit-protocol check for every story in the unit.
    fn verify_unit(
        &mut self,
        unit: &WorkUnit,
        cx: &UnitContext<'_>,
        delegation: &DelegationResult,
    ) -> Result<Vec<StoryVerdict>>;

    /// Regression gates, cleanup of rejected work, and baseline refresh.
    fn gate_unit(
        &mut self,
        unit: &WorkUnit,
        cx: &UnitContext<'_>,
        verdicts: Vec<StoryVerdict>,
    ) -> Result<Vec<StoryVerdict>>;
}

/// Shared handles every orchestrator works through.
pub struct Workspace<'a, G: GateRunner> {
    pub git: Git,
    pub cfg: &'a LoopConfig,
    pub gate: RegressionGate<'a, G>,
    /// Repository-relative paths cleanup must never touch (manifest, loop state).
    pub protected: Vec<String>,
}

impl<'a, G: GateRunner> Workspace<'a, G> {
    pub fn new(root: &Path, cfg: &'a LoopConfig, gate: RegressionGate<'a, G>) -> Self {
        Self {
            git: Git::new(root),
            cfg,
            gate,
            protected: vec![
                cfg.manifest_path.trim_start_matches("./").to_string(),
                ".storyloop/".to_string(),
            ],
        }
    }

    pub fn policy(&self) -> ProtocolPolicy {
        ProtocolPolicy {
            refactor_required: self.cfg.refactor_required,
        }
    }

    pub fn is_protected(&self, path: &str) -> bool {
        self.protected.iter().any(|protected| {
            path == protected || (protected.ends_with('/') && path.starts_with(protected.as_str()))
        })
    }

    /// Paths a story's scoped gates look at: `touched` plus declared plain
    /// paths, keeping only those that exist. Glob declarations are not passed on.
    pub fn scope_files(
        &self,
        story: &Story,
        touched: impl IntoIterator<Item = String>,
    ) -> BTreeSet<String> {
        let root = self.git.workdir();
        touched
            .into_iter()
            .chain(
                story
                    .files
                    .iter()
                    .filter(|path| !path.contains(['*', '?', '[']))
                    .map(|path| path.trim_start_matches("./").to_string()),
            )
            .filter(|path| !self.is_protected(path))
            .filter(|path| root.join(path).exists())
            .collect()
    }
}

/// Extend `note` with what the regression gate tolerated or fixed.
fn gate_note(note: &str, comparison: &Comparison) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !note.is_empty() {
        parts.push(note.to_string());
    }
    if comparison.preexisting_count > 0 {
        parts.push(format!(
            "{} pre-existing failure(s) tolerated",
            comparison.preexisting_count
        ));
    }
    if !comparison.resolved.is_empty() {
        parts.push(format!("resolved: {}", comparison.resolved.join(", ")));
    }
    parts.join("; ")
}

/// Pick the orchestrator for this run.
pub fn for_config<'a, G: GateRunner + 'a>(ws: &'a Workspace<'a, G>) -> Box<dyn Orchestrator + 'a> {
    if ws.cfg.teams {
        Box::new(Wave::new(ws))
    } else {
        Box::new(Sequential::new(ws))
    }
}
