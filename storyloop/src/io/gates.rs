//! Quality gate runner (lint, type-check, test-run).

use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::core::budget::remaining_budget;
use crate::core::types::GateOutcome;
use crate::io::config::{GateCommand, GatesConfig};
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Pseudo identifier for a failed test run that named no failing test.
pub const TEST_RUN_ID: &str = "test-run";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GateKind {
    Lint,
    Typecheck,
    Test,
}

impl GateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GateKind::Lint => "lint",
            GateKind::Typecheck => "typecheck",
            GateKind::Test => "test",
        }
    }
}

impl fmt::Display for GateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which files a gate should look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateScope {
    /// Whole repository.
    Full,
    /// Only these paths (appended as arguments to scoped gates).
    Files(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct GateRequest {
    pub workdir: PathBuf,
    /// Gate output is appended here, one section per gate.
    pub log_path: PathBuf,
    /// Shared deadline for every gate in one pass.
    pub deadline: Instant,
    pub output_limit_bytes: usize,
    pub scope: GateScope,
}

/// Result of one gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateReport {
    pub kind: GateKind,
    pub outcome: GateOutcome,
    /// Failing check identifiers. Tests report test names; lint and type-check
    /// report their own gate name.
    pub failing: BTreeSet<String>,
    pub summary: String,
}

impl GateReport {
    pub fn skipped(kind: GateKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            outcome: GateOutcome::Skipped,
            failing: BTreeSet::new(),
            summary: reason.into(),
        }
    }
}

pub trait GateRunner {
    fn run(&self, kind: GateKind, request: &GateRequest) -> Result<GateReport>;
}

/// Gate runner that spawns the commands from `[gates]` in the config.
pub struct CommandGateRunner {
    gates: GatesConfig,
    patterns: Vec<Regex>,
}

impl CommandGateRunner {
    pub fn new(gates: GatesConfig) -> Result<Self> {
        let patterns = gates
            .failure_patterns
            .iter()
            .map(|pattern| {
                Regex::new(&format!("(?m){pattern}"))
                    .with_context(|| format!("compile failure pattern '{pattern}'"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { gates, patterns })
    }

    fn gate(&self, kind: GateKind) -> Option<&GateCommand> {
        match kind {
            GateKind::Lint => self.gates.lint.as_ref(),
            GateKind::Typecheck => self.gates.typecheck.as_ref(),
            GateKind::Test => self.gates.test.as_ref(),
        }
    }
}

impl GateRunner for CommandGateRunner {
    #[instrument(skip_all, fields(gate = %kind))]
    fn run(&self, kind: GateKind, request: &GateRequest) -> Result<GateReport> {
        let Some(gate) = self.gate(kind) else {
            return Ok(GateReport::skipped(kind, "not configured"));
        };
        let scoped_files: &[String] = match (&request.scope, gate.scoped) {
            (GateScope::Files(files), true) if files.is_empty() => {
                return Ok(GateReport::skipped(kind, "no files in scope"));
            }
            (GateScope::Files(files), true) => files.as_slice(),
            _ => &[],
        };

        let (program, args) = gate
            .command
            .split_first()
            .ok_or_else(|| anyhow!("gates.{kind}.command is empty"))?;
        let timeout = match remaining_budget(request.deadline) {
            Ok(timeout) => timeout,
            Err(_) => {
                append_log(&request.log_path, kind, "[gate budget exhausted before start]\n")?;
                return Ok(failed(kind, fallback_failing(kind), "gate budget exhausted"));
            }
        };
        let mut cmd = Command::new(program);
        cmd.args(args).args(scoped_files).current_dir(&request.workdir);

        debug!(files = scoped_files.len(), "running gate");
        let output = run_command_with_timeout(cmd, None, timeout, request.output_limit_bytes)
            .with_context(|| format!("run {kind} gate"))?;
        append_log(&request.log_path, kind, &render_output(&output))?;

        if output.success() {
            return Ok(GateReport {
                kind,
                outcome: GateOutcome::Pass,
                failing: BTreeSet::new(),
                summary: "passed".to_string(),
            });
        }

        let summary = if output.timed_out {
            format!("timed out after {}s", timeout.as_secs())
        } else {
            format!("exit status {:?}", output.status.code())
        };
        warn!(gate = %kind, %summary, "gate failed");
        let failing = match kind {
            GateKind::Test => parse_failing_tests(&self.patterns, &output.combined_text()),
            _ => BTreeSet::new(),
        };
        let failing = if failing.is_empty() {
            fallback_failing(kind)
        } else {
            failing
        };
        Ok(failed(kind, failing, summary))
    }
}

/// Identifier recorded when a gate fails without naming individual checks.
fn fallback_failing(kind: GateKind) -> BTreeSet<String> {
    let id = match kind {
        GateKind::Test => TEST_RUN_ID,
        other => other.as_str(),
    };
    BTreeSet::from([id.to_string()])
}

fn failed(kind: GateKind, failing: BTreeSet<String>, summary: impl Into<String>) -> GateReport {
    GateReport {
        kind,
        outcome: GateOutcome::Fail,
        failing,
        summary: summary.into(),
    }
}

/// Collect failing test identifiers from the first capture group of every pattern.
pub fn parse_failing_tests(patterns: &[Regex], output: &str) -> BTreeSet<String> {
    let mut ids = BTreeSet::new();
    for pattern in patterns {
        for caps in pattern.captures_iter(output) {
            if let Some(id) = caps.get(1) {
                let id = id.as_str().trim();
                if !id.is_empty() {
                    ids.insert(id.to_string());
                }
            }
        }
    }
    ids
}

fn render_output(output: &CommandOutput) -> String {
    let mut buf = String::new();
    buf.push_str("--- stdout ---\n");
    buf.push_str(&String::from_utf8_lossy(&output.stdout));
    buf.push_str("\n--- stderr ---\n");
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    buf.push_str(&output.truncated_notice("gate"));
    if output.timed_out {
        buf.push_str("\n[gate timed out]\n");
    }
    buf
}

fn append_log(path: &Path, kind: GateKind, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create gate log dir {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open gate log {}", path.display()))?;
    writeln!(file, "=== {kind} ===\n{body}")
        .with_context(|| format!("write gate log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn patterns() -> Vec<Regex> {
        CommandGateRunner::new(GatesConfig::default())
            .expect("default patterns compile")
            .patterns
    }

    #[test]
    fn parses_cargo_pytest_and_go_failures() {
        let output = "\
running 3 tests
test auth::login_works ... ok
test auth::logout_works ... FAILED
FAILED tests/test_api.py::test_create - AssertionError
--- FAIL: TestParse (0.00s)
";
        let ids = parse_failing_tests(&patterns(), output);
        let expected: BTreeSet<String> = [
            "TestParse",
            "auth::logout_works",
            "tests/test_api.py::test_create",
        ]
        .into_iter()
            .map(str::to_string)
            .collect();
        assert_eq!(ids, expected);
    }

    #[cfg(unix)]
    fn sh_gate(script: &str, scoped: bool) -> GateCommand {
        GateCommand {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                script.to_string(),
                "gate".to_string(),
            ],
            scoped,
        }
    }

    #[cfg(unix)]
    fn request(dir: &Path, scope: GateScope) -> GateRequest {
        GateRequest {
            workdir: dir.to_path_buf(),
            log_path: dir.join("gates.log"),
            deadline: Instant::now() + Duration::from_secs(30),
            output_limit_bytes: 10_000,
            scope,
        }
    }

    #[cfg(unix)]
    #[test]
    fn failed_test_gate_reports_test_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = CommandGateRunner::new(GatesConfig {
            test: Some(sh_gate("echo 'test a::b ... FAILED'; exit 101", false)),
            ..GatesConfig::default()
        })
        .expect("runner");
        let report = runner
            .run(GateKind::Test, &request(temp.path(), GateScope::Full))
            .expect("run");
        assert_eq!(report.outcome, GateOutcome::Fail);
        assert_eq!(report.failing, BTreeSet::from(["a::b".to_string()]));
        let log = fs::read_to_string(temp.path().join("gates.log")).expect("read log");
        assert!(log.starts_with("=== test ==="));
    }

    #[cfg(unix)]
    #[test]
    fn failed_test_gate_without_ids_uses_pseudo_id() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = CommandGateRunner::new(GatesConfig {
            test: Some(sh_gate("echo boom; exit 1", false)),
            ..GatesConfig::default()
        })
        .expect("runner");
        let report = runner
            .run(GateKind::Test, &request(temp.path(), GateScope::Full))
            .expect("run");
        assert_eq!(report.failing, BTreeSet::from([TEST_RUN_ID.to_string()]));
    }

    #[cfg(unix)]
    #[test]
    fn scoped_lint_receives_files_and_skips_empty_scope() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = CommandGateRunner::new(GatesConfig {
            lint: Some(sh_gate("echo \"files: $*\"; test \"$1\" = src/a.rs", true)),
            ..GatesConfig::default()
        })
        .expect("runner");

        let report = runner
            .run(
                GateKind::Lint,
                &request(temp.path(), GateScope::Files(vec!["src/a.rs".to_string()])),
            )
            .expect("run");
        assert_eq!(report.outcome, GateOutcome::Pass);

        let skipped = runner
            .run(GateKind::Lint, &request(temp.path(), GateScope::Files(Vec::new())))
            .expect("run");
        assert_eq!(skipped.outcome, GateOutcome::Skipped);

        let failed = runner
            .run(
                GateKind::Lint,
                &request(temp.path(), GateScope::Files(vec!["src/b.rs".to_string()])),
            )
            .expect("run");
        assert_eq!(failed.failing, BTreeSet::from(["lint".to_string()]));
    }

    #[test]
    fn unconfigured_gate_is_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = CommandGateRunner::new(GatesConfig::default()).expect("runner");
        let report = runner
            .run(
                GateKind::Typecheck,
                &GateRequest {
                    workdir: temp.path().to_path_buf(),
                    log_path: temp.path().join("gates.log"),
                    deadline: Instant::now() + Duration::from_secs(5),
                    output_limit_bytes: 100,
                    scope: GateScope::Full,
                },
            )
            .expect("run");
        assert_eq!(report.outcome, GateOutcome::Skipped);
    }
}
