//! Baseline-aware regression gate.
//!
//! Runs the configured quality gates, captures baselines of already-failing
//! checks, and classifies later failures as new (blocking) or pre-existing.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, instrument};

use crate::core::baseline::{Baseline, Comparison, compare, refreshed};
use crate::core::types::GateOutcome;
use crate::io::baseline_store::{BaselineStore, CURRENT, LOOP_INIT, story_baseline_name};
use crate::io::config::LoopConfig;
use crate::io::gates::{GateKind, GateReport, GateRequest, GateRunner, GateScope};

/// Every gate, in execution order.
pub const FULL_SUITE: [GateKind; 3] = [GateKind::Lint, GateKind::Typecheck, GateKind::Test];

/// Reports from one pass over a set of gates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckRun {
    pub reports: Vec<GateReport>,
    /// Union of failing identifiers across all reports.
    pub failing: BTreeSet<String>,
}

impl CheckRun {
    pub fn all_passed(&self) -> bool {
        self.reports
            .iter()
            .all(|report| report.outcome != GateOutcome::Fail)
    }
}

pub struct RegressionGate<'a, G: GateRunner> {
    runner: &'a G,
    store: BaselineStore,
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
    max_age_secs: u64,
}

impl<'a, G: GateRunner> RegressionGate<'a, G> {
    pub fn new(runner: &'a G, store: BaselineStore, workdir: &Path, cfg: &LoopConfig) -> Self {
        Self {
            runner,
            store,
            workdir: workdir.to_path_buf(),
            timeout: Duration::from_secs(cfg.gates.timeout_secs),
            output_limit_bytes: cfg.gate_output_limit_bytes,
            max_age_secs: cfg.baseline_max_age_secs,
        }
    }

    pub fn store(&self) -> &BaselineStore {
        &self.store
    }

    /// Run `kinds` in order under one shared deadline.
    pub fn run_checks(
        &self,
        kinds: &[GateKind],
        scope: &GateScope,
        log_path: &Path,
    ) -> Result<CheckRun> {
        let request = GateRequest {
            workdir: self.workdir.clone(),
            log_path: log_path.to_path_buf(),
            deadline: Instant::now() + self.timeout,
            output_limit_bytes: self.output_limit_bytes,
            scope: scope.clone(),
        };
        let mut run = CheckRun::default();
        for kind in kinds {
            let report = self.runner.run(*kind, &request)?;
            debug!(
                gate = %kind,
                outcome = ?report.outcome,
                failing = report.failing.len(),
                "gate finished"
            );
            run.failing.extend(report.failing.iter().cloned());
            run.reports.push(report);
        }
        Ok(run)
    }

    pub fn full_suite(&self, log_path: &Path) -> Result<CheckRun> {
        self.run_checks(&FULL_SUITE, &GateScope::Full, log_path)
    }

    /// Gates for one story: scoped gates see only `files`, the rest run repository-wide.
    pub fn story_checks(&self, files: &BTreeSet<String>, log_path: &Path) -> Result<CheckRun> {
        let scope = GateScope::Files(files.iter().cloned().collect());
        self.run_checks(&FULL_SUITE, &scope, log_path)
    }

    /// Baseline named `name` at `revision`, reusing a fresh stored result when possible.
    #[instrument(skip_all, fields(name, revision))]
    pub fn capture_named(&self, name: &str, revision: &str, log_path: &Path) -> Result<Baseline> {
        if let Some(stored) = self.store.load(name)?
            && stored.is_fresh(revision, Utc::now(), self.max_age_secs)
        {
            debug!("reusing fresh baseline");
            return Ok(stored);
        }
        let failing = self.failing_at(revision, log_path)?;
        let baseline = Baseline::new(name, revision, None, failing, Utc::now());
        self.store.save(&baseline)?;
        Ok(baseline)
    }

    /// Baseline a story is gated against.
    ///
    /// A persisted snapshot taken at the story's base revision is reused
    /// verbatim, so failures left behind by an earlier failed attempt are
    /// never absorbed into what the story may leave broken.
    #[instrument(skip_all, fields(story_id, base_revision))]
    pub fn capture_for_story(
        &self,
        story_id: &str,
        base_revision: &str,
        head: &str,
        log_path: &Path,
    ) -> Result<Baseline> {
        let name = story_baseline_name(story_id);
        if let Some(stored) = self.store.load(&name)?
            && stored.matches_revision(base_revision)
        {
            debug!("reusing story baseline");
            return Ok(stored);
        }
        let failing = self.failing_at(head, log_path)?;
        let baseline = Baseline::new(name, head, Some(story_id), failing, Utc::now());
        self.store.save(&baseline)?;
        info!(story_id, failing = baseline.failing.len(), "story baseline captured");
        Ok(baseline)
    }

    /// Rolling baseline for the next story, recaptured when HEAD moved underneath it.
    pub fn chain_baseline(&self, revision: &str, log_path: &Path) -> Result<Baseline> {
        if let Some(stored) = self.store.load(CURRENT)?
            && stored.matches_revision(revision)
        {
            return Ok(stored);
        }
        let failing = self.failing_at(revision, log_path)?;
        let baseline = Baseline::new(CURRENT, revision, None, failing, Utc::now());
        self.store.save(&baseline)?;
        Ok(baseline)
    }

    pub fn compare(&self, baseline: &Baseline, run: &CheckRun) -> Comparison {
        compare(baseline, &run.failing)
    }

    /// Replace the rolling baseline after `story_id` passed cleanly.
    pub fn refresh(
        &self,
        previous: &Baseline,
        story_id: &str,
        revision: &str,
        current: &BTreeSet<String>,
    ) -> Result<Baseline> {
        let mut next = refreshed(previous, story_id, revision, current, Utc::now());
        next.name = CURRENT.to_string();
        self.store.save(&next)?;
        info!(story_id, tolerated = next.failing.len(), "baseline refreshed");
        Ok(next)
    }

    pub fn forget_story(&self, story_id: &str) -> Result<()> {
        self.store.remove(&story_baseline_name(story_id))
    }

    /// Failing set at `revision`: a fresh stored result if one exists, else a full run.
    fn failing_at(&self, revision: &str, log_path: &Path) -> Result<BTreeSet<String>> {
        let now = Utc::now();
        for name in [CURRENT, LOOP_INIT] {
            if let Some(stored) = self.store.load(name)?
                && stored.is_fresh(revision, now, self.max_age_secs)
            {
                debug!(source = name, "reusing cached failing set");
                return Ok(stored.failing);
            }
        }
        Ok(self.full_suite(log_path)?.failing)
    }
}
