//! Test-only helpers: story builders, a scratch git repository, and scripted
//! stand-ins for the agent and the quality gates.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tempfile::TempDir;

use crate::core::types::GateOutcome;
use crate::io::agent::{Agent, DelegationRequest, DelegationResult};
use crate::io::gates::{GateKind, GateReport, GateRequest, GateRunner, GateScope};
use crate::io::git::Git;
use crate::io::manifest_store::{load_manifest, write_manifest};
use crate::manifest::{Manifest, Story, StoryStatus};

/// Create a deterministic pending story with no dependencies.
pub fn story(id: &str) -> Story {
    let mut story = Story::new(id, format!("{id} title"));
    story.description = format!("{id} description");
    story
}

pub fn story_with_deps(id: &str, deps: &[&str]) -> Story {
    Story {
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        ..story(id)
    }
}

pub fn story_with_files(id: &str, files: &[&str]) -> Story {
    Story {
        files: files.iter().map(|f| f.to_string()).collect(),
        ..story(id)
    }
}

pub fn passed(id: &str) -> Story {
    Story {
        status: StoryStatus::Passed,
        completed_at: Some(Utc::now()),
        ..story(id)
    }
}

pub fn manifest(stories: Vec<Story>) -> Manifest {
    Manifest::new(stories)
}

/// Scratch git repository with one initial commit.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        let repo = Self { dir };
        repo.git_cmd(&["init", "--quiet"])?;
        repo.git_cmd(&["config", "user.email", "test@example.com"])?;
        repo.git_cmd(&["config", "user.name", "test"])?;
        repo.git_cmd(&["config", "commit.gpgsign", "false"])?;
        repo.commit_file("README.md", "hi\n", "chore: init")?;
        Ok(repo)
    }

    /// Repository with a committed `prd.json` holding pending stories `ids`.
    pub fn with_manifest(ids: &[&str]) -> Result<Self> {
        Self::with_stories(ids.iter().map(|id| story(id)).collect())
    }

    pub fn with_stories(stories: Vec<Story>) -> Result<Self> {
        let repo = Self::new()?;
        repo.write_manifest(&manifest(stories))?;
        repo.commit_all("chore: add manifest")?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn git(&self) -> Git {
        Git::new(self.root())
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root().join("prd.json")
    }

    pub fn read_manifest(&self) -> Result<Manifest> {
        load_manifest(&self.manifest_path())
    }

    pub fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        write_manifest(&self.manifest_path(), manifest)
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        write_in(self.root(), rel, contents)
    }

    /// Write one file and commit it; returns the new HEAD.
    pub fn commit_file(&self, rel: &str, contents: &str, message: &str) -> Result<String> {
        self.write(rel, contents)?;
        self.git_cmd(&["add", "--", rel])?;
        self.git_cmd(&["commit", "--quiet", "-m", message])?;
        self.git().head()
    }

    pub fn commit_all(&self, message: &str) -> Result<String> {
        self.git_cmd(&["add", "-A"])?;
        self.git_cmd(&["commit", "--quiet", "--allow-empty", "-m", message])?;
        self.git().head()
    }

    /// Subjects of every commit, oldest first.
    pub fn subjects(&self) -> Result<Vec<String>> {
        let out = self.git_output(&["log", "--reverse", "--format=%s"])?;
        Ok(out.lines().map(str::to_string).collect())
    }

    fn git_cmd(&self, args: &[&str]) -> Result<()> {
        self.git_output(args).map(|_| ())
    }

    fn git_output(&self, args: &[&str]) -> Result<String> {
        git_in(self.root(), args)
    }
}

fn write_in(root: &Path, rel: &str, contents: &str) -> Result<()> {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
}

fn git_in(root: &Path, args: &[&str]) -> Result<String> {
    let out = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .with_context(|| format!("spawn git {args:?}"))?;
    if !out.status.success() {
        return Err(anyhow!(
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// One scripted agent turn: files to write and commit, in order.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTurn {
    /// `(message, [(path, contents)])` per commit.
    pub commits: Vec<(String, Vec<(String, String)>)>,
    /// Files left uncommitted in the working tree.
    pub stray_files: Vec<(String, String)>,
    pub timed_out: bool,
}

impl ScriptedTurn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit(mut self, message: &str, files: &[(&str, &str)]) -> Self {
        let files = files
            .iter()
            .map(|(path, contents)| (path.to_string(), contents.to_string()))
            .collect();
        self.commits.push((message.to_string(), files));
        self
    }

    pub fn stray(mut self, path: &str, contents: &str) -> Self {
        self.stray_files.push((path.to_string(), contents.to_string()));
        self
    }

    pub fn timing_out(mut self) -> Self {
        self.timed_out = true;
        self
    }

    /// Red/green pair for `story_id`, touching one test file and one source file.
    pub fn tdd(story_id: &str, src: &str) -> Self {
        let test_path = format!("tests/{}.txt", story_id.to_lowercase());
        Self::new()
            .commit(
                &format!("[RED] {story_id}: failing test"),
                &[(test_path.as_str(), "assert\n")],
            )
            .commit(&format!("[GREEN] {story_id}: implement"), &[(src, "impl\n")])
    }
}

/// Agent that replays queued turns against the request's workdir.
#[derive(Default)]
pub struct ScriptedAgent {
    turns: RefCell<VecDeque<ScriptedTurn>>,
    briefs: RefCell<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: RefCell::new(turns.into()),
            briefs: RefCell::new(Vec::new()),
        }
    }

    pub fn briefs(&self) -> Vec<String> {
        self.briefs.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.turns.borrow().len()
    }
}

impl Agent for ScriptedAgent {
    fn delegate(&self, request: &DelegationRequest) -> Result<DelegationResult> {
        self.briefs.borrow_mut().push(request.brief.clone());
        let turn = self
            .turns
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent has no turns left"))?;
        for (message, files) in &turn.commits {
            for (path, contents) in files {
                write_in(&request.workdir, path, contents)?;
                git_in(&request.workdir, &["add", "--", path])?;
            }
            git_in(&request.workdir, &["commit", "--quiet", "--allow-empty", "-m", message])?;
        }
        for (path, contents) in &turn.stray_files {
            write_in(&request.workdir, path, contents)?;
        }
        if let Some(parent) = request.log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&request.log_path, "scripted agent\n")?;
        Ok(DelegationResult {
            exit_code: if turn.timed_out { None } else { Some(0) },
            timed_out: turn.timed_out,
        })
    }
}

/// Gate runner with programmable failures and call counting.
///
/// Lint and type-check pass unless told otherwise; the test gate fails with
/// the configured identifiers.
#[derive(Default)]
pub struct ScriptedGateRunner {
    failing: RefCell<BTreeMap<GateKind, BTreeSet<String>>>,
    calls: RefCell<Vec<(GateKind, GateScope)>>,
}

impl ScriptedGateRunner {
    pub fn passing() -> Self {
        Self::default()
    }

    pub fn failing(test_ids: &[&str]) -> Self {
        let runner = Self::default();
        runner.set_failing(test_ids);
        runner
    }

    pub fn set_failing(&self, test_ids: &[&str]) {
        self.set_gate_failing(GateKind::Test, test_ids);
    }

    pub fn set_gate_failing(&self, kind: GateKind, ids: &[&str]) {
        self.failing
            .borrow_mut()
            .insert(kind, ids.iter().map(|id| id.to_string()).collect());
    }

    pub fn calls(&self, kind: GateKind) -> usize {
        self.calls.borrow().iter().filter(|(k, _)| *k == kind).count()
    }

    pub fn scopes(&self, kind: GateKind) -> Vec<GateScope> {
        self.calls
            .borrow()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, scope)| scope.clone())
            .collect()
    }
}

impl GateRunner for ScriptedGateRunner {
    fn run(&self, kind: GateKind, request: &GateRequest) -> Result<GateReport> {
        self.calls.borrow_mut().push((kind, request.scope.clone()));
        let failing = self.failing.borrow().get(&kind).cloned().unwrap_or_default();
        let outcome = if failing.is_empty() {
            GateOutcome::Pass
        } else {
            GateOutcome::Fail
        };
        Ok(GateReport {
            kind,
            outcome,
            summary: format!("scripted {kind}"),
            failing,
        })
    }
}
