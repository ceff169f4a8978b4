//! The story loop behind `storyloop run`.
//!
//! Each iteration picks a unit of work, delegates it to the agent, verifies the
//! commit protocol, gates regressions against a baseline, then persists the
//! manifest, run state and progress log before moving on.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::progress::estimate_remaining;
use crate::core::types::AttemptOutcome;
use crate::error::{AttemptFailure, EnvironmentError, RetriesExhausted};
use crate::io::agent::{Agent, DelegationRequest, DelegationResult};
use crate::io::baseline_store::LOOP_INIT;
use crate::io::config::LoopConfig;
use crate::io::gates::GateRunner;
use crate::io::git::Git;
use crate::io::heartbeat::{Heartbeat, HeartbeatEvent, HeartbeatOptions};
use crate::io::init::{LoopPaths, ensure_layout};
use crate::io::iteration_log::{IterationMeta, IterationPaths, write_brief, write_meta};
use crate::io::manifest_store::{open_manifest, write_manifest};
use crate::io::progress_log::{ProgressEntry, append_entry, append_run_header};
use crate::io::prompt::{BriefInput, render_brief};
use crate::io::run_state::{RunState, load_run_state, write_run_state};
use crate::manifest::{Manifest, Story};
use crate::orchestrator::{self, StoryVerdict, UnitContext, WorkUnit, Workspace};
use crate::regression::RegressionGate;

/// Why `run_loop` stopped without an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// No eligible story is left: every story has passed.
    Idle,
    /// The iteration limit for this invocation was reached.
    Exhausted { max_iterations: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub run_id: String,
    pub iterations: u32,
    /// Stories that passed during this invocation, in completion order.
    pub passed: Vec<String>,
    pub stop: LoopStop,
}

/// Notifications for the CLI's human-facing output.
#[derive(Debug)]
pub enum LoopEvent<'a> {
    Started {
        run_id: &'a str,
        mode: &'static str,
        tolerated_failures: usize,
    },
    Delegating {
        iter: u32,
        unit: &'a WorkUnit,
        attempt: u32,
        max_attempts: u32,
    },
    StoryFinished {
        iter: u32,
        verdict: &'a StoryVerdict,
    },
    Progress {
        passed: usize,
        total: usize,
        eta: Option<Duration>,
    },
}

/// Run iterations until every story passed, a story exhausts its attempts, or
/// `cfg.max_iterations` is reached.
///
/// Typed errors: [`EnvironmentError`] for an unusable manifest or config,
/// [`RetriesExhausted`] when a story keeps failing, and
/// [`crate::error::WaveCheckpointFailed`] when a teams-mode checkpoint regresses.
#[instrument(skip_all, fields(root = %root.display(), teams = cfg.teams))]
pub fn run_loop<A, G, F>(
    root: &Path,
    cfg: &LoopConfig,
    agent: &A,
    gates: &G,
    mut on_event: F,
) -> Result<LoopOutcome>
where
    A: Agent,
    G: GateRunner,
    F: FnMut(&LoopEvent<'_>),
{
    cfg.validate()
        .map_err(|err| EnvironmentError::InvalidConfig(format!("{err:#}")))?;
    let paths = LoopPaths::new(root);
    ensure_layout(&paths)?;
    let git = Git::new(root);
    let manifest_path = paths.manifest_path(cfg);
    let mut manifest = open_manifest(&manifest_path)?;

    let started_at = Utc::now();
    let run_id = new_run_id(&paths, started_at);
    let mut run_state = load_run_state(&paths.run_state_path)
        .with_context(|| format!("load {}", paths.run_state_path.display()))?;
    run_state.run_id = Some(run_id.clone());
    run_state.next_iter = 1;
    run_state.completed.clear();
    write_run_state(&paths.run_state_path, &run_state)?;
    let pid_file = PidFile::create(&paths.pids_dir)?;
    append_run_header(&paths.progress_log_path, &run_id, started_at)?;

    let gate = RegressionGate::new(gates, paths.baselines(), root, cfg);
    let ws = Workspace::new(root, cfg, gate);
    let mut orchestrator = orchestrator::for_config(&ws);

    let init_log = paths.run_dir(&run_id).join("baseline-gates.log");
    let loop_init = ws.gate.capture_named(LOOP_INIT, &git.head()?, &init_log)?;
    info!(%run_id, mode = orchestrator.mode(), tolerated = loop_init.failing.len(), "loop started");
    on_event(&LoopEvent::Started {
        run_id: &run_id,
        mode: orchestrator.mode(),
        tolerated_failures: loop_init.failing.len(),
    });

    let mut passed = Vec::new();
    let mut iterations = 0u32;
    while iterations < cfg.max_iterations {
        let unit = {
            let exhausted = exhausted_stories(&manifest, &run_state, cfg.max_attempts);
            orchestrator.next_unit_of_work(&manifest, &exhausted)
        };
        let Some(unit) = unit else {
            if manifest.is_complete() {
                info!(%run_id, iterations, "all stories passed");
                return Ok(LoopOutcome {
                    run_id,
                    iterations,
                    passed,
                    stop: LoopStop::Idle,
                });
            }
            let unfinished = manifest
                .stories
                .iter()
                .filter(|story| !story.is_passed())
                .map(|story| story.id.clone())
                .collect();
            return Err(EnvironmentError::Blocked(unfinished).into());
        };
        if run_state.attempts_for(&unit.primary) >= cfg.max_attempts {
            return Err(retries_exhausted(&run_state, &unit.primary, cfg.max_attempts).into());
        }
        iterations += 1;

        let iter = run_state.take_iter();
        let head_before = git.head()?;
        let mut story_bases = BTreeMap::new();
        for id in unit.story_ids() {
            run_state.record_attempt(id);
            story_bases.insert(id.to_string(), run_state.base_revision_or_insert(id, &head_before));
            manifest.mark_in_progress(id)?;
        }
        let attempt = run_state.attempts_for(&unit.primary);
        write_manifest(&manifest_path, &manifest)?;
        write_run_state(&paths.run_state_path, &run_state)?;

        let iteration = IterationPaths::new(&paths.iterations_dir, &run_id, iter);
        iteration.create()?;
        let brief = render_unit_brief(&manifest, &unit, cfg, attempt, &run_state)?;
        write_brief(&iteration, &brief)?;

        let snapshot = manifest.clone();
        let cx = UnitContext {
            manifest: &snapshot,
            iteration: &iteration,
            head_before: head_before.clone(),
            commits_before: git.commit_count()?,
            dirty_before: git.changed_files_since("HEAD")?,
            story_bases,
        };
        orchestrator.prepare_unit(&unit, &cx)?;

        on_event(&LoopEvent::Delegating {
            iter,
            unit: &unit,
            attempt,
            max_attempts: cfg.max_attempts,
        });
        let iter_started_at = Utc::now();
        let clock = Instant::now();
        let request = DelegationRequest {
            workdir: root.to_path_buf(),
            brief,
            model: cfg.model.clone(),
            log_path: iteration.agent_log_path.clone(),
            pid_path: Some(pid_file.agent_path()),
            timeout: Duration::from_secs(cfg.delegation_timeout_secs),
            output_limit_bytes: cfg.agent_output_limit_bytes,
        };
        let delegation = delegate(agent, &request, cfg, &unit.primary)?;
        if let Some(code) = delegation.exit_code
            && code != 0
        {
            warn!(
                code,
                story_id = %unit.primary,
                "agent exited non-zero; judging its commits anyway"
            );
        }

        let judged = orchestrator
            .verify_unit(&unit, &cx, &delegation)
            .and_then(|verdicts| orchestrator.gate_unit(&unit, &cx, verdicts));
        let verdicts = match judged {
            Ok(verdicts) => verdicts,
            Err(err) => {
                let note = format!("{err:#}");
                if let Err(record_err) =
                    abandon_unit(&paths, cfg, &mut manifest, &mut run_state, &unit, iter, &note)
                {
                    warn!(err = %record_err, "failed to record abandoned unit");
                }
                return Err(err);
            }
        };
        let elapsed = clock.elapsed();
        let ended_at = Utc::now();

        for verdict in &verdicts {
            let id = verdict.story_id.as_str();
            if verdict.passed() {
                manifest.mark_passed(id, ended_at)?;
                run_state.record_pass(id, elapsed.as_secs());
                passed.push(id.to_string());
            } else {
                manifest.mark_failed(id)?;
                run_state.record_failure(id, verdict.note.clone());
            }
            append_entry(
                &paths.progress_log_path,
                &ProgressEntry {
                    at: ended_at,
                    iter,
                    story_id: id.to_string(),
                    outcome: outcome_of(verdict).as_str().to_string(),
                    note: verdict.note.clone(),
                },
            )?;
        }
        write_manifest(&manifest_path, &manifest)?;
        write_run_state(&paths.run_state_path, &run_state)?;

        let primary = verdicts
            .iter()
            .find(|verdict| verdict.story_id == unit.primary);
        write_meta(
            &iteration,
            &IterationMeta {
                run_id: run_id.clone(),
                iter,
                story_id: unit.primary.clone(),
                peers: unit.peers.clone(),
                attempt,
                outcome: primary.map_or(AttemptOutcome::Failed, outcome_of),
                base_revision: head_before,
                head_revision: Some(git.head()?),
                started_at: iter_started_at,
                ended_at,
                duration_ms: elapsed.as_millis() as u64,
                note: primary.map(|v| v.note.clone()).unwrap_or_default(),
            },
        )?;

        for verdict in &verdicts {
            on_event(&LoopEvent::StoryFinished { iter, verdict });
        }
        let durations: Vec<Duration> = run_state
            .completed
            .iter()
            .map(|done| Duration::from_secs(done.duration_secs))
            .collect();
        let total = manifest.stories.len();
        let done = manifest.passed_count();
        on_event(&LoopEvent::Progress {
            passed: done,
            total,
            eta: estimate_remaining(&durations, total - done),
        });

        if primary.is_some_and(|v| !v.passed())
            && run_state.attempts_for(&unit.primary) >= cfg.max_attempts
        {
            return Err(retries_exhausted(&run_state, &unit.primary, cfg.max_attempts).into());
        }
    }

    warn!(max_iterations = cfg.max_iterations, "iteration limit reached");
    Ok(LoopOutcome {
        run_id,
        iterations,
        passed,
        stop: LoopStop::Exhausted {
            max_iterations: cfg.max_iterations,
        },
    })
}

/// Mark every story of `unit` failed with `note` after a fatal error.
fn abandon_unit(
    paths: &LoopPaths,
    cfg: &LoopConfig,
    manifest: &mut Manifest,
    run_state: &mut RunState,
    unit: &WorkUnit,
    iter: u32,
    note: &str,
) -> Result<()> {
    let at = Utc::now();
    for id in unit.story_ids() {
        manifest.mark_failed(id)?;
        run_state.record_failure(id, note.to_string());
        append_entry(
            &paths.progress_log_path,
            &ProgressEntry {
                at,
                iter,
                story_id: id.to_string(),
                outcome: AttemptOutcome::Failed.as_str().to_string(),
                note: note.to_string(),
            },
        )?;
    }
    write_manifest(&paths.manifest_path(cfg), manifest)?;
    write_run_state(&paths.run_state_path, run_state)
}

fn exhausted_stories<'m>(
    manifest: &'m Manifest,
    run_state: &RunState,
    max_attempts: u32,
) -> HashSet<&'m str> {
    manifest
        .stories
        .iter()
        .filter(|story| !story.is_passed() && run_state.attempts_for(&story.id) >= max_attempts)
        .map(|story| story.id.as_str())
        .collect()
}

fn retries_exhausted(run_state: &RunState, story_id: &str, max_attempts: u32) -> RetriesExhausted {
    RetriesExhausted {
        story_id: story_id.to_string(),
        attempts: run_state.attempts_for(story_id).max(max_attempts),
        last_failure: run_state
            .last_failures
            .get(story_id)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string()),
    }
}

fn outcome_of(verdict: &StoryVerdict) -> AttemptOutcome {
    verdict
        .failure
        .as_ref()
        .map_or(AttemptOutcome::Passed, AttemptFailure::outcome)
}

fn render_unit_brief(
    manifest: &Manifest,
    unit: &WorkUnit,
    cfg: &LoopConfig,
    attempt: u32,
    run_state: &RunState,
) -> Result<String> {
    let story = manifest
        .story(&unit.primary)
        .with_context(|| format!("story {} missing from manifest", unit.primary))?;
    let peers: Vec<&Story> = unit
        .peers
        .iter()
        .filter_map(|id| manifest.story(id))
        .collect();
    render_brief(&BriefInput {
        story,
        peers: &peers,
        refactor_required: cfg.refactor_required,
        attempt,
        max_attempts: cfg.max_attempts,
        failure: run_state.last_failures.get(&unit.primary).map(String::as_str),
        manifest_path: &cfg.manifest_path,
    })
}

/// Run the agent with a heartbeat watching its log.
fn delegate<A: Agent>(
    agent: &A,
    request: &DelegationRequest,
    cfg: &LoopConfig,
    label: &str,
) -> Result<DelegationResult> {
    let heartbeat = Heartbeat::start(HeartbeatOptions {
        label: label.to_string(),
        watch_path: request.log_path.clone(),
        interval: Duration::from_secs(cfg.heartbeat.interval_secs),
        stall: Duration::from_secs(cfg.heartbeat.stall_secs),
    });
    let result = agent.delegate(request);
    let events = heartbeat.stop();
    let stalls = events
        .iter()
        .filter(|event| matches!(event, HeartbeatEvent::Stalled { .. }))
        .count();
    debug!(ticks = events.len(), stalls, "heartbeat stopped");
    result
}

/// Run ids embed the UTC start time; a numeric suffix keeps same-second runs apart.
fn new_run_id(paths: &LoopPaths, now: DateTime<Utc>) -> String {
    let base = format!("run-{}", now.format("%Y%m%dT%H%M%SZ"));
    let mut candidate = base.clone();
    let mut n = 2;
    while paths.run_dir(&candidate).exists() {
        candidate = format!("{base}-{n}");
        n += 1;
    }
    candidate
}

/// `.storyloop/pids/<pid>.pid` for the lifetime of a loop; the agent's process
/// group id sits next to it in `<pid>.agent` while delegation runs.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn create(pids_dir: &Path) -> Result<Self> {
        let pid = std::process::id();
        let path = pids_dir.join(format!("{pid}.pid"));
        fs::write(&path, format!("{pid}\n"))
            .with_context(|| format!("write pid file {}", path.display()))?;
        Ok(Self { path })
    }

    fn agent_path(&self) -> PathBuf {
        self.path.with_extension("agent")
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.agent_path());
        let _ = fs::remove_file(&self.path);
    }
}
