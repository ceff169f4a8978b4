//! One story per iteration, gated against the rolling baseline.

use std::collections::HashSet;
use std::fs;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument};

use super::{Orchestrator, StoryVerdict, UnitContext, WorkUnit, Workspace, gate_note};
use crate::core::baseline::Baseline;
use crate::core::scheduler::next_story;
use crate::error::AttemptFailure;
use crate::io::agent::DelegationResult;
use crate::io::gates::GateRunner;
use crate::manifest::Manifest;
use crate::verify::verify_new_commits;

pub struct Sequential<'a, G: GateRunner> {
    ws: &'a Workspace<'a, G>,
    baseline: Option<Baseline>,
}

impl<'a, G: GateRunner> Sequential<'a, G> {
    pub fn new(ws: &'a Workspace<'a, G>) -> Self {
        Self { ws, baseline: None }
    }

    /// Undo the attempt: move HEAD back to `head_before` and restore or delete
    /// every path the agent touched. Paths that were already dirty before
    /// delegation, the manifest, and loop state are left alone.
    #[instrument(skip_all, fields(base = %cx.head_before))]
    fn rollback(&self, cx: &UnitContext<'_>) -> Result<Vec<String>> {
        let git = &self.ws.git;
        let base = cx.head_before.as_str();
        let touched: Vec<String> = git
            .changed_files_since(base)?
            .into_iter()
            .filter(|path| !self.ws.is_protected(path) && !cx.dirty_before.contains(path))
            .collect();

        git.reset_soft(base)?;
        for path in &touched {
            if git.path_exists_at(base, path)? {
                git.restore_path(base, path)?;
                continue;
            }
            git.rm_cached(path)?;
            let full = git.workdir().join(path);
            if full.is_file() {
                fs::remove_file(&full).with_context(|| format!("remove {}", full.display()))?;
            }
        }
        info!(paths = touched.len(), "rolled back attempt");
        Ok(touched)
    }
}

impl<G: GateRunner> Orchestrator for Sequential<'_, G> {
    fn mode(&self) -> &'static str {
        "sequential"
    }

    fn next_unit_of_work(
        &self,
        manifest: &Manifest,
        _exhausted: &HashSet<&str>,
    ) -> Option<WorkUnit> {
        next_story(manifest).map(|story| WorkUnit::single(story.id.as_str()))
    }

    fn prepare_unit(&mut self, _unit: &WorkUnit, cx: &UnitContext<'_>) -> Result<()> {
        let baseline = self
            .ws
            .gate
            .chain_baseline(&cx.head_before, &cx.iteration.gates_log_path)?;
        self.baseline = Some(baseline);
        Ok(())
    }

    fn verify_unit(
        &mut self,
        unit: &WorkUnit,
        cx: &UnitContext<'_>,
        delegation: &DelegationResult,
    ) -> Result<Vec<StoryVerdict>> {
        let id = unit.primary.as_str();
        if delegation.timed_out {
            let budget = Duration::from_secs(self.ws.cfg.delegation_timeout_secs);
            return Ok(vec![StoryVerdict::fail(id, AttemptFailure::Timeout(budget))]);
        }
        let verdict = match verify_new_commits(&self.ws.git, cx.commits_before, self.ws.policy())? {
            Ok(report) => {
                StoryVerdict::pass(id).with_note(format!("{} new commits", report.commits))
            }
            Err(violation) => StoryVerdict::fail(id, violation.into()),
        };
        Ok(vec![verdict])
    }

    fn gate_unit(
        &mut self,
        _unit: &WorkUnit,
        cx: &UnitContext<'_>,
        mut verdicts: Vec<StoryVerdict>,
    ) -> Result<Vec<StoryVerdict>> {
        let ws = self.ws;
        for verdict in verdicts.iter_mut().filter(|v| v.passed()) {
            let id = verdict.story_id.clone();
            let story = cx
                .manifest
                .story(&id)
                .ok_or_else(|| anyhow!("story {id} missing from manifest"))?;
            let baseline = self
                .baseline
                .as_ref()
                .ok_or_else(|| anyhow!("no baseline prepared for {id}"))?;

            let touched = ws.git.changed_files_since(cx.story_base(&id))?;
            let scope = ws.scope_files(story, touched);
            let run = ws.gate.story_checks(&scope, &cx.iteration.gates_log_path)?;
            let comparison = ws.gate.compare(baseline, &run);
            if !comparison.passes() {
                verdict.reject(AttemptFailure::Regression {
                    new_failures: comparison.new,
                });
                continue;
            }
            verdict.note = gate_note(&verdict.note, &comparison);
            let head = ws.git.head()?;
            let next = ws.gate.refresh(baseline, &id, &head, &run.failing)?;
            self.baseline = Some(next);
        }

        if verdicts.iter().any(|v| !v.passed()) {
            self.rollback(cx)?;
        }
        Ok(verdicts)
    }
}
