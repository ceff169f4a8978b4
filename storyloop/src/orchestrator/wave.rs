//! Teams mode: the primary story and every unblocked peer share one delegation.
//!
//! Commits produced by the wave are snapshotted once, attributed to stories,
//! and judged per story. Rejected work is undone with compensating reverts of
//! exactly the rejected story's commits, so peers keep theirs. A regression
//! seen by both the primary and a peer is charged to the peer first.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{info, instrument, warn};

use super::{Orchestrator, StoryVerdict, UnitContext, WorkUnit, Workspace, gate_note};
use crate::core::attribution::{Attribution, CommitRecord, attribute};
use crate::core::baseline::{Baseline, Comparison};
use crate::core::protocol::verify_phases;
use crate::core::scheduler::{next_story, wave};
use crate::error::{AttemptFailure, WaveCheckpointFailed};
use crate::io::agent::DelegationResult;
use crate::io::gates::{GateKind, GateRunner, GateScope};
use crate::manifest::{Manifest, Story};
use crate::regression::FULL_SUITE;

/// Gates each peer runs on its own files; type-check runs once for the batch.
const PEER_CHECKS: [GateKind; 2] = [GateKind::Lint, GateKind::Test];

pub struct Wave<'a, G: GateRunner> {
    ws: &'a Workspace<'a, G>,
    wave_baseline: Option<Baseline>,
    story_baselines: BTreeMap<String, Baseline>,
    arena: Vec<CommitRecord>,
    attribution: Attribution,
    reverted: BTreeSet<usize>,
}

impl<'a, G: GateRunner> Wave<'a, G> {
    pub fn new(ws: &'a Workspace<'a, G>) -> Self {
        Self {
            ws,
            wave_baseline: None,
            story_baselines: BTreeMap::new(),
            arena: Vec::new(),
            attribution: Attribution::default(),
            reverted: BTreeSet::new(),
        }
    }

    /// Unit stories in manifest order, the order attribution settles ties in.
    fn stories<'m>(&self, unit: &WorkUnit, manifest: &'m Manifest) -> Result<Vec<&'m Story>> {
        let ids: HashSet<&str> = unit.story_ids().collect();
        let stories: Vec<&Story> = manifest
            .stories
            .iter()
            .filter(|story| ids.contains(story.id.as_str()))
            .collect();
        if stories.len() != ids.len() {
            return Err(anyhow!("wave references stories missing from the manifest"));
        }
        Ok(stories)
    }

    fn story_baseline(&self, story_id: &str) -> Result<&Baseline> {
        self.story_baselines
            .get(story_id)
            .ok_or_else(|| anyhow!("no baseline prepared for {story_id}"))
    }

    /// Paths touched by the commits attributed to `story_id`.
    fn touched_by(&self, story_id: &str) -> BTreeSet<String> {
        self.attribution
            .records_for(story_id, &self.arena)
            .into_iter()
            .flat_map(|commit| commit.files.iter().cloned())
            .collect()
    }

    /// Gate `story_id` on its own files against its own baseline.
    fn check_story(
        &self,
        manifest: &Manifest,
        story_id: &str,
        kinds: &[GateKind],
        log: &Path,
    ) -> Result<Comparison> {
        let story = story_in(manifest, story_id)?;
        let scope = self.ws.scope_files(story, self.touched_by(story_id));
        let run = self
            .ws
            .gate
            .run_checks(kinds, &GateScope::Files(scope.into_iter().collect()), log)?;
        Ok(self.ws.gate.compare(self.story_baseline(story_id)?, &run))
    }

    /// Revert the commits of `failed` stories, newest first, skipping any commit
    /// also attributed to a story that is still passing.
    ///
    /// Newest first keeps each revert applicable when a later commit of the
    /// same story edited a file an earlier one created.
    #[instrument(skip_all, fields(stories = ?failed))]
    fn revert_stories(&mut self, failed: &[String], verdicts: &[StoryVerdict]) -> Result<usize> {
        let keep: BTreeSet<usize> = verdicts
            .iter()
            .filter(|verdict| verdict.passed())
            .flat_map(|verdict| self.attribution.commits_for(&verdict.story_id).iter().copied())
            .collect();
        let targets: BTreeSet<usize> = failed
            .iter()
            .flat_map(|id| self.attribution.commits_for(id).iter().copied())
            .filter(|idx| !keep.contains(idx) && !self.reverted.contains(idx))
            .collect();
        for idx in targets.iter().rev() {
            let commit = &self.arena[*idx];
            self.ws.git.revert(&commit.hash)?;
            self.reverted.insert(*idx);
        }
        info!(reverted = targets.len(), "selective revert done");
        Ok(targets.len())
    }
}

impl<G: GateRunner> Orchestrator for Wave<'_, G> {
    fn mode(&self) -> &'static str {
        "teams"
    }

    fn next_unit_of_work(
        &self,
        manifest: &Manifest,
        exhausted: &HashSet<&str>,
    ) -> Option<WorkUnit> {
        let primary = next_story(manifest)?;
        let peers = wave(manifest, Some(&primary.id))
            .into_iter()
            .filter(|story| !exhausted.contains(story.id.as_str()))
            .map(|story| story.id.clone())
            .collect();
        Some(WorkUnit {
            primary: primary.id.clone(),
            peers,
        })
    }

    fn prepare_unit(&mut self, unit: &WorkUnit, cx: &UnitContext<'_>) -> Result<()> {
        let log = &cx.iteration.gates_log_path;
        self.wave_baseline = Some(self.ws.gate.chain_baseline(&cx.head_before, log)?);
        self.story_baselines.clear();
        for id in unit.story_ids() {
            let baseline = self
                .ws
                .gate
                .capture_for_story(id, cx.story_base(id), &cx.head_before, log)?;
            self.story_baselines.insert(id.to_string(), baseline);
        }
        Ok(())
    }

    #[instrument(skip_all, fields(primary = %unit.primary, peers = unit.peers.len()))]
    fn verify_unit(
        &mut self,
        unit: &WorkUnit,
        cx: &UnitContext<'_>,
        delegation: &DelegationResult,
    ) -> Result<Vec<StoryVerdict>> {
        self.arena = self.ws.git.commits_since(&cx.head_before)?;
        self.reverted.clear();
        let stories = self.stories(unit, cx.manifest)?;
        self.attribution = attribute(&self.arena, &stories, self.ws.cfg.attribution.tie_break);
        for idx in self.attribution.unattributed() {
            let commit = &self.arena[*idx];
            warn!(hash = %commit.hash, "commit matches no story in the wave; ignored");
        }

        let policy = self.ws.policy();
        let mut verdicts = Vec::new();
        for id in unit.story_ids() {
            if id == unit.primary && delegation.timed_out {
                let budget = Duration::from_secs(self.ws.cfg.delegation_timeout_secs);
                verdicts.push(StoryVerdict::fail(id, AttemptFailure::Timeout(budget)));
                continue;
            }
            let messages = self.attribution.messages_newest_first(id, &self.arena);
            verdicts.push(match verify_phases(&messages, policy) {
                Ok(report) => StoryVerdict::pass(id)
                    .with_note(format!("{} attributed commits", report.commits)),
                Err(violation) => StoryVerdict::fail(id, violation.into()),
            });
        }
        Ok(verdicts)
    }

    #[instrument(skip_all, fields(primary = %unit.primary))]
    fn gate_unit(
        &mut self,
        unit: &WorkUnit,
        cx: &UnitContext<'_>,
        mut verdicts: Vec<StoryVerdict>,
    ) -> Result<Vec<StoryVerdict>> {
        let ws = self.ws;
        let log = &cx.iteration.gates_log_path;
        let wave_baseline = self
            .wave_baseline
            .clone()
            .ok_or_else(|| anyhow!("no wave baseline prepared"))?;
        let primary = verdicts
            .iter()
            .position(|v| v.story_id == unit.primary)
            .ok_or_else(|| anyhow!("no verdict for primary {}", unit.primary))?;

        // Protocol rejects leave the tree before any gate looks at it.
        let rejected: Vec<String> = verdicts
            .iter()
            .filter(|v| !v.passed())
            .map(|v| v.story_id.clone())
            .collect();
        if !rejected.is_empty() {
            self.revert_stories(&rejected, &verdicts)?;
        }

        // Primary: full gates; peers: scoped lint and tests. Each against its own baseline.
        let mut primary_check = None;
        let mut regressed_peers = Vec::new();
        for idx in 0..verdicts.len() {
            if !verdicts[idx].passed() {
                continue;
            }
            let id = verdicts[idx].story_id.clone();
            if idx == primary {
                primary_check = Some(self.check_story(cx.manifest, &id, &FULL_SUITE, log)?);
                continue;
            }
            let comparison = self.check_story(cx.manifest, &id, &PEER_CHECKS, log)?;
            settle(&mut verdicts[idx], comparison);
            if !verdicts[idx].passed() {
                regressed_peers.push(id);
            }
        }
        if !regressed_peers.is_empty() {
            self.revert_stories(&regressed_peers, &verdicts)?;
            // Repository-wide failures show up for every story; the primary is
            // judged again once the regressed peers are gone.
            if primary_check.as_ref().is_some_and(|c| !c.passes()) {
                let recheck = self.check_story(cx.manifest, &unit.primary, &FULL_SUITE, log)?;
                primary_check = Some(recheck);
            }
        }
        if let Some(comparison) = primary_check {
            settle(&mut verdicts[primary], comparison);
            if !verdicts[primary].passed() {
                self.revert_stories(std::slice::from_ref(&unit.primary), &verdicts)?;
            }
        }

        // One type-check for the whole batch of passing peers.
        let batch: Vec<String> = verdicts
            .iter()
            .enumerate()
            .filter(|(idx, v)| *idx != primary && v.passed())
            .map(|(_, v)| v.story_id.clone())
            .collect();
        if !batch.is_empty() {
            let run = ws.gate.run_checks(&[GateKind::Typecheck], &GateScope::Full, log)?;
            let comparison = ws.gate.compare(&wave_baseline, &run);
            if !comparison.passes() {
                warn!(peers = batch.len(), failures = ?comparison.new, "batch type-check failed");
                reject_all(&mut verdicts, &batch, &comparison.new);
                self.revert_stories(&batch, &verdicts)?;
            }
        }

        // Checkpoint: the whole repository, before the next wave is computed.
        // Passing peers are reverted first, then the primary.
        let mut run = ws.gate.full_suite(log)?;
        let mut comparison = ws.gate.compare(&wave_baseline, &run);
        for primary_stage in [false, true] {
            if comparison.passes() {
                break;
            }
            let suspects: Vec<String> = verdicts
                .iter()
                .enumerate()
                .filter(|(idx, v)| v.passed() && (*idx == primary) == primary_stage)
                .map(|(_, v)| v.story_id.clone())
                .collect();
            if suspects.is_empty() {
                continue;
            }
            warn!(
                stories = ?suspects,
                failures = ?comparison.new,
                "checkpoint regressed; reverting"
            );
            reject_all(&mut verdicts, &suspects, &comparison.new);
            self.revert_stories(&suspects, &verdicts)?;
            run = ws.gate.full_suite(log)?;
            comparison = ws.gate.compare(&wave_baseline, &run);
        }
        if !comparison.passes() {
            return Err(WaveCheckpointFailed {
                new_failures: comparison.new,
            }
            .into());
        }

        if let Some(first) = verdicts.iter().find(|v| v.passed()) {
            let head = ws.git.head()?;
            let next = ws.gate.refresh(&wave_baseline, &first.story_id, &head, &run.failing)?;
            self.wave_baseline = Some(next);
        }
        for verdict in verdicts.iter().filter(|v| v.passed()) {
            ws.gate.forget_story(&verdict.story_id)?;
        }
        Ok(verdicts)
    }
}

/// Record the gate result on a story that passed verification so far.
fn settle(verdict: &mut StoryVerdict, comparison: Comparison) {
    if comparison.passes() {
        verdict.note = gate_note(&verdict.note, &comparison);
    } else {
        verdict.reject(AttemptFailure::Regression {
            new_failures: comparison.new,
        });
    }
}

fn reject_all(verdicts: &mut [StoryVerdict], ids: &[String], new_failures: &[String]) {
    for verdict in verdicts.iter_mut().filter(|v| ids.contains(&v.story_id)) {
        verdict.reject(AttemptFailure::Regression {
            new_failures: new_failures.to_vec(),
        });
    }
}

fn story_in<'m>(manifest: &'m Manifest, id: &str) -> Result<&'m Story> {
    manifest
        .story(id)
        .ok_or_else(|| anyhow!("story {id} missing from manifest"))
}
