//! Loop-level tests for full `run_loop` lifecycles.
//!
//! Each test drives a scratch git repository with a scripted agent that
//! really commits, and gate runners that answer from the working tree, so
//! cleanup, reverts and baselines are exercised against real git.

use std::collections::BTreeSet;
use std::fs;

use anyhow::Result;

use storyloop::core::types::GateOutcome;
use storyloop::error::{RetriesExhausted, WaveCheckpointFailed};
use storyloop::io::config::LoopConfig;
use storyloop::io::gates::{GateKind, GateReport, GateRequest, GateRunner, GateScope};
use storyloop::io::init::LoopPaths;
use storyloop::io::run_state::load_run_state;
use storyloop::looping::{LoopEvent, LoopStop, run_loop};
use storyloop::manifest::StoryStatus;
use storyloop::test_support::{
    ScriptedAgent, ScriptedGateRunner, ScriptedTurn, TestRepo, story, story_with_deps,
};

fn quiet(_: &LoopEvent<'_>) {}

fn config() -> LoopConfig {
    LoopConfig {
        max_iterations: 10,
        ..LoopConfig::default()
    }
}

fn progress_log(repo: &TestRepo) -> String {
    fs::read_to_string(LoopPaths::new(repo.root()).progress_log_path).expect("progress log")
}

/// Test gate that always reports `test_legacy` and reports `test_broken`
/// while `src/broken.rs` exists.
struct WorkingTreeGates;

impl GateRunner for WorkingTreeGates {
    fn run(&self, kind: GateKind, request: &GateRequest) -> Result<GateReport> {
        let mut failing = BTreeSet::new();
        if kind == GateKind::Test {
            failing.insert("test_legacy".to_string());
            if request.workdir.join("src/broken.rs").exists() {
                failing.insert("test_broken".to_string());
            }
        }
        Ok(GateReport {
            kind,
            outcome: if failing.is_empty() {
                GateOutcome::Pass
            } else {
                GateOutcome::Fail
            },
            failing,
            summary: String::new(),
        })
    }
}

/// Test gate that reports `test_broken` only from repository-wide runs, so
/// scoped story checks miss it and only the checkpoint sees it.
struct FullRunOnlyGates;

impl GateRunner for FullRunOnlyGates {
    fn run(&self, kind: GateKind, request: &GateRequest) -> Result<GateReport> {
        let mut failing = BTreeSet::new();
        if kind == GateKind::Test
            && request.scope == GateScope::Full
            && request.workdir.join("src/broken.rs").exists()
        {
            failing.insert("test_broken".to_string());
        }
        Ok(GateReport {
            kind,
            outcome: if failing.is_empty() {
                GateOutcome::Pass
            } else {
                GateOutcome::Fail
            },
            failing,
            summary: String::new(),
        })
    }
}

fn teams_config() -> LoopConfig {
    LoopConfig {
        teams: true,
        ..config()
    }
}

/// Wave turn where US-1 is clean and peer US-2's green commit adds `src/broken.rs`.
fn wave_with_breaking_peer() -> ScriptedTurn {
    ScriptedTurn::tdd("US-1", "src/one.rs")
        .commit("[RED] US-2: failing test", &[("tests/us-2.txt", "assert\n")])
        .commit("[GREEN] US-2: implement", &[("src/broken.rs", "oops\n")])
}

/// Two dependent stories, each passing on the first attempt.
#[test]
fn sequential_run_passes_stories_in_dependency_order() {
    let repo = TestRepo::with_stories(vec![story_with_deps("US-2", &["US-1"]), story("US-1")])
        .expect("repo");
    let agent = ScriptedAgent::new(vec![
        ScriptedTurn::tdd("US-1", "src/one.rs"),
        ScriptedTurn::tdd("US-2", "src/two.rs"),
    ]);
    let gates = ScriptedGateRunner::passing();

    let mut finished = Vec::new();
    let outcome = run_loop(repo.root(), &config(), &agent, &gates, |event| {
        if let LoopEvent::StoryFinished { verdict, .. } = event {
            finished.push((verdict.story_id.clone(), verdict.passed()));
        }
    })
    .expect("run");

    assert_eq!(outcome.stop, LoopStop::Idle);
    assert_eq!(outcome.iterations, 2);
    assert_eq!(outcome.passed, vec!["US-1".to_string(), "US-2".to_string()]);
    assert_eq!(
        finished,
        vec![("US-1".to_string(), true), ("US-2".to_string(), true)]
    );

    let manifest = repo.read_manifest().expect("manifest");
    assert!(manifest.is_complete());
    assert!(manifest.stories.iter().all(|s| s.completed_at.is_some()));

    let subjects = repo.subjects().expect("subjects");
    assert_eq!(
        &subjects[2..],
        &[
            "[RED] US-1: failing test",
            "[GREEN] US-1: implement",
            "[RED] US-2: failing test",
            "[GREEN] US-2: implement",
        ]
    );
    assert!(agent.briefs()[1].starts_with("# Story US-2"));

    let state = load_run_state(&LoopPaths::new(repo.root()).run_state_path).expect("state");
    assert_eq!(state.completed.len(), 2);
    assert!(state.attempts.is_empty());
    assert_eq!(progress_log(&repo).matches("outcome=passed").count(), 2);
}

/// A protocol violation is rolled back and the failure is fed into the retry brief.
#[test]
fn protocol_violation_is_rolled_back_and_retried() {
    let repo = TestRepo::with_manifest(&["US-1"]).expect("repo");
    let agent = ScriptedAgent::new(vec![
        ScriptedTurn::new()
            .commit("[GREEN] US-1: implement", &[("src/one.rs", "impl\n")])
            .stray("scratch.txt", "junk\n"),
        ScriptedTurn::tdd("US-1", "src/one.rs"),
    ]);
    let gates = ScriptedGateRunner::passing();

    let outcome = run_loop(repo.root(), &config(), &agent, &gates, quiet).expect("run");

    assert_eq!(outcome.stop, LoopStop::Idle);
    assert_eq!(outcome.iterations, 2);
    let briefs = agent.briefs();
    assert!(!briefs[0].contains("was rejected"));
    assert!(briefs[1].contains("Previous attempt 1 of 3 was rejected"), "{}", briefs[1]);
    assert!(briefs[1].contains("protocol violation"), "{}", briefs[1]);

    let subjects = repo.subjects().expect("subjects");
    assert_eq!(
        &subjects[2..],
        &["[RED] US-1: failing test", "[GREEN] US-1: implement"]
    );
    assert!(!repo.root().join("scratch.txt").exists());
    let log = progress_log(&repo);
    assert!(log.contains("story=US-1 outcome=failed"), "{log}");
    assert!(log.contains("story=US-1 outcome=passed"), "{log}");
}

/// A timed-out delegation counts as a failed attempt even when its commits look fine.
#[test]
fn timeout_is_a_failed_attempt() {
    let repo = TestRepo::with_manifest(&["US-1"]).expect("repo");
    let agent = ScriptedAgent::new(vec![
        ScriptedTurn::tdd("US-1", "src/one.rs").timing_out(),
        ScriptedTurn::tdd("US-1", "src/one.rs"),
    ]);
    let gates = ScriptedGateRunner::passing();

    let outcome = run_loop(repo.root(), &config(), &agent, &gates, quiet).expect("run");

    assert_eq!(outcome.passed, vec!["US-1".to_string()]);
    assert_eq!(repo.subjects().expect("subjects").len(), 4);
    assert!(progress_log(&repo).contains("outcome=timed_out"));
}

/// New failures block a story; failures present before the loop started do not.
#[test]
fn new_failures_reject_while_preexisting_ones_are_tolerated() {
    let repo = TestRepo::with_manifest(&["US-1"]).expect("repo");
    let agent = ScriptedAgent::new(vec![
        ScriptedTurn::new()
            .commit("[RED] US-1: failing test", &[("tests/us-1.txt", "assert\n")])
            .commit("[GREEN] US-1: implement", &[("src/broken.rs", "oops\n")]),
        ScriptedTurn::tdd("US-1", "src/one.rs"),
    ]);

    let outcome = run_loop(repo.root(), &config(), &agent, &WorkingTreeGates, quiet).expect("run");

    assert_eq!(outcome.stop, LoopStop::Idle);
    assert_eq!(outcome.iterations, 2);
    assert!(!repo.root().join("src/broken.rs").exists());
    let log = progress_log(&repo);
    assert!(log.contains("new failures: test_broken"), "{log}");
    assert!(log.contains("1 pre-existing failure(s) tolerated"), "{log}");
}

/// Repeated failures halt the run, and a later invocation halts before delegating.
#[test]
fn exhausted_story_halts_the_run() {
    let repo = TestRepo::with_manifest(&["US-1", "US-2"]).expect("repo");
    let cfg = LoopConfig {
        max_attempts: 2,
        ..config()
    };
    let green_only =
        || ScriptedTurn::new().commit("[GREEN] US-1: implement", &[("src/one.rs", "impl\n")]);
    let agent = ScriptedAgent::new(vec![green_only(), green_only()]);
    let gates = ScriptedGateRunner::passing();

    let err = run_loop(repo.root(), &cfg, &agent, &gates, quiet).unwrap_err();
    let exhausted = err
        .downcast_ref::<RetriesExhausted>()
        .expect("retries exhausted");
    assert_eq!(exhausted.story_id, "US-1");
    assert_eq!(exhausted.attempts, 2);
    assert!(exhausted.last_failure.contains("protocol violation"));
    assert_eq!(agent.remaining(), 0);

    let manifest = repo.read_manifest().expect("manifest");
    assert_eq!(manifest.story("US-1").map(|s| s.status), Some(StoryStatus::Failed));
    assert_eq!(manifest.story("US-2").map(|s| s.status), Some(StoryStatus::Pending));

    let idle_agent = ScriptedAgent::new(Vec::new());
    let err = run_loop(repo.root(), &cfg, &idle_agent, &gates, quiet).unwrap_err();
    assert!(err.downcast_ref::<RetriesExhausted>().is_some());
    assert!(idle_agent.briefs().is_empty());
}

/// The iteration limit stops a run cleanly; the next invocation resumes.
#[test]
fn iteration_limit_stops_and_next_run_resumes() {
    let repo = TestRepo::with_manifest(&["US-1", "US-2"]).expect("repo");
    let cfg = LoopConfig {
        max_iterations: 1,
        ..config()
    };
    let gates = ScriptedGateRunner::passing();

    let first = ScriptedAgent::new(vec![ScriptedTurn::tdd("US-1", "src/one.rs")]);
    let outcome = run_loop(repo.root(), &cfg, &first, &gates, quiet).expect("first run");
    assert_eq!(outcome.stop, LoopStop::Exhausted { max_iterations: 1 });
    assert_eq!(outcome.passed, vec!["US-1".to_string()]);

    let second = ScriptedAgent::new(vec![ScriptedTurn::tdd("US-2", "src/two.rs")]);
    let resumed = run_loop(repo.root(), &cfg, &second, &gates, quiet).expect("second run");
    assert_ne!(resumed.run_id, outcome.run_id);
    assert_eq!(resumed.passed, vec!["US-2".to_string()]);
    assert!(repo.read_manifest().expect("manifest").is_complete());
    assert_eq!(progress_log(&repo).matches("=== run ").count(), 2);
}

/// Teams mode: one delegation covers every unblocked story; only the story that
/// broke the protocol loses its commits, and it is retried alone.
#[test]
fn teams_mode_keeps_peer_work_when_one_story_fails() {
    let repo = TestRepo::with_manifest(&["US-1", "US-2", "US-3"]).expect("repo");
    let cfg = teams_config();
    let wave = ScriptedTurn::tdd("US-1", "src/one.rs")
        .commit("[RED] US-2: failing test", &[("tests/us-2.txt", "assert\n")])
        .commit("[GREEN] US-2: implement", &[("src/two.rs", "impl\n")])
        .commit("[GREEN] US-3: implement", &[("src/three.rs", "impl\n")]);
    let agent = ScriptedAgent::new(vec![wave, ScriptedTurn::tdd("US-3", "src/three.rs")]);
    let gates = ScriptedGateRunner::passing();

    let mut units = Vec::new();
    let outcome = run_loop(repo.root(), &cfg, &agent, &gates, |event| {
        if let LoopEvent::Delegating { unit, .. } = event {
            units.push(unit.story_ids().map(str::to_string).collect::<Vec<_>>());
        }
    })
    .expect("run");

    assert_eq!(outcome.stop, LoopStop::Idle);
    assert_eq!(
        units,
        vec![
            vec!["US-1".to_string(), "US-2".to_string(), "US-3".to_string()],
            vec!["US-3".to_string()],
        ]
    );
    assert_eq!(
        outcome.passed,
        vec!["US-1".to_string(), "US-2".to_string(), "US-3".to_string()]
    );
    assert!(agent.briefs()[0].contains("## Parallel stories"));

    let subjects = repo.subjects().expect("subjects");
    assert!(subjects.contains(&"Revert \"[GREEN] US-3: implement\"".to_string()));
    assert!(subjects.contains(&"[GREEN] US-2: implement".to_string()));
    assert!(repo.root().join("src/two.rs").exists());
    assert!(repo.read_manifest().expect("manifest").is_complete());
}

/// A peer whose commits break a test is reverted and retried; the primary keeps its work.
#[test]
fn teams_peer_regression_reverts_only_the_peer() {
    let repo = TestRepo::with_manifest(&["US-1", "US-2"]).expect("repo");
    let agent = ScriptedAgent::new(vec![
        wave_with_breaking_peer(),
        ScriptedTurn::tdd("US-2", "src/two.rs"),
    ]);

    let outcome =
        run_loop(repo.root(), &teams_config(), &agent, &WorkingTreeGates, quiet).expect("run");

    assert_eq!(outcome.stop, LoopStop::Idle);
    assert_eq!(outcome.passed, vec!["US-1".to_string(), "US-2".to_string()]);
    let subjects = repo.subjects().expect("subjects");
    assert!(subjects.contains(&"Revert \"[GREEN] US-2: implement\"".to_string()));
    assert!(!subjects.iter().any(|s| s.starts_with("Revert \"[GREEN] US-1")));
    assert!(repo.root().join("src/one.rs").exists());
    assert!(!repo.root().join("src/broken.rs").exists());
    let log = progress_log(&repo);
    assert!(log.contains("story=US-2 outcome=failed\n  new failures: test_broken"), "{log}");
}

/// A regression only the checkpoint sees is charged to the passing peers first.
#[test]
fn teams_checkpoint_regression_reverts_peers_before_the_primary() {
    let repo = TestRepo::with_manifest(&["US-1", "US-2"]).expect("repo");
    let agent = ScriptedAgent::new(vec![
        wave_with_breaking_peer(),
        ScriptedTurn::tdd("US-2", "src/two.rs"),
    ]);

    let outcome =
        run_loop(repo.root(), &teams_config(), &agent, &FullRunOnlyGates, quiet).expect("run");

    assert_eq!(outcome.passed, vec!["US-1".to_string(), "US-2".to_string()]);
    let subjects = repo.subjects().expect("subjects");
    assert!(subjects.contains(&"Revert \"[GREEN] US-2: implement\"".to_string()));
    assert!(!subjects.iter().any(|s| s.starts_with("Revert \"[GREEN] US-1")));
    assert!(!repo.root().join("src/broken.rs").exists());
}

/// A commit naming no story and touching no declared file survives a revert.
#[test]
fn teams_unattributed_commit_survives_primary_revert() {
    let repo = TestRepo::with_manifest(&["US-1", "US-2"]).expect("repo");
    let wave = ScriptedTurn::new()
        .commit("[GREEN] US-1: implement", &[("src/one.rs", "impl\n")])
        .commit("chore: tidy notes", &[("docs/notes.md", "notes\n")])
        .commit("[RED] US-2: failing test", &[("tests/us-2.txt", "assert\n")])
        .commit("[GREEN] US-2: implement", &[("src/two.rs", "impl\n")]);
    let agent = ScriptedAgent::new(vec![wave, ScriptedTurn::tdd("US-1", "src/one.rs")]);
    let gates = ScriptedGateRunner::passing();

    let outcome = run_loop(repo.root(), &teams_config(), &agent, &gates, quiet).expect("run");

    assert_eq!(outcome.passed, vec!["US-2".to_string(), "US-1".to_string()]);
    let subjects = repo.subjects().expect("subjects");
    assert!(subjects.contains(&"Revert \"[GREEN] US-1: implement\"".to_string()));
    assert!(subjects.contains(&"chore: tidy notes".to_string()));
    assert!(!subjects.iter().any(|s| s.contains("Revert \"chore")));
    assert!(repo.root().join("docs/notes.md").exists());
}

/// A fatal checkpoint failure still lands in the progress log and the manifest.
#[test]
fn teams_checkpoint_failure_is_recorded_before_halting() {
    let repo = TestRepo::with_manifest(&["US-1"]).expect("repo");
    let turn = ScriptedTurn::tdd("US-1", "src/one.rs")
        .commit("chore: scratch", &[("src/broken.rs", "oops\n")]);
    let agent = ScriptedAgent::new(vec![turn]);

    let err = run_loop(repo.root(), &teams_config(), &agent, &WorkingTreeGates, quiet)
        .unwrap_err();
    let checkpoint = err
        .downcast_ref::<WaveCheckpointFailed>()
        .expect("checkpoint failure");
    assert_eq!(checkpoint.new_failures, vec!["test_broken".to_string()]);

    let manifest = repo.read_manifest().expect("manifest");
    assert_eq!(manifest.story("US-1").map(|s| s.status), Some(StoryStatus::Failed));
    let log = progress_log(&repo);
    assert!(log.contains("story=US-1 outcome=failed"), "{log}");
    assert!(log.contains("wave checkpoint found new failures: test_broken"), "{log}");
    let state = load_run_state(&LoopPaths::new(repo.root()).run_state_path).expect("state");
    assert!(state.last_failures["US-1"].contains("test_broken"));
}
