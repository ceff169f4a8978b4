//! Initialization helpers for `.storyloop/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::baseline_store::BaselineStore;
use super::config::LoopConfig;
use super::run_state::{RunState, write_run_state};

/// All canonical paths within `.storyloop/` for a project root.
#[derive(Debug, Clone)]
pub struct LoopPaths {
    pub root: PathBuf,
    pub loop_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub state_dir: PathBuf,
    pub run_state_path: PathBuf,
    pub baselines_dir: PathBuf,
    pub iterations_dir: PathBuf,
    pub pids_dir: PathBuf,
    pub progress_log_path: PathBuf,
}

impl LoopPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let loop_dir = root.join(".storyloop");
        let state_dir = loop_dir.join("state");
        Self {
            root: root.clone(),
            gitignore_path: loop_dir.join(".gitignore"),
            config_path: loop_dir.join("config.toml"),
            run_state_path: state_dir.join("run_state.json"),
            state_dir,
            baselines_dir: loop_dir.join("baselines"),
            iterations_dir: loop_dir.join("iterations"),
            pids_dir: loop_dir.join("pids"),
            progress_log_path: loop_dir.join("progress.log"),
            loop_dir,
        }
    }

    /// Manifest location from config, resolved against the project root.
    pub fn manifest_path(&self, cfg: &LoopConfig) -> PathBuf {
        self.root.join(&cfg.manifest_path)
    }

    pub fn baselines(&self) -> BaselineStore {
        BaselineStore::new(&self.baselines_dir)
    }

    /// Directory holding one run's iteration logs.
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.iterations_dir.join(run_id)
    }
}

/// Options for `init_loop`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing loop-owned files.
    pub force: bool,
}

/// Create `.storyloop/` scaffolding in `root`.
///
/// Fails if `.storyloop/` already exists unless `options.force` is set. A
/// starter manifest is written only when none exists; it is never overwritten.
pub fn init_loop(root: &Path, options: &InitOptions) -> Result<LoopPaths> {
    let paths = LoopPaths::new(root);
    if paths.loop_dir.exists() && !options.force {
        return Err(anyhow!(
            "storyloop init: .storyloop already exists (use --force to overwrite)"
        ));
    }
    if paths.loop_dir.exists() && !paths.loop_dir.is_dir() {
        return Err(anyhow!(
            "storyloop init: .storyloop exists but is not a directory"
        ));
    }

    ensure_layout(&paths)?;
    write_file(&paths.config_path, CONFIG_TEMPLATE)?;
    write_run_state(&paths.run_state_path, &RunState::default())?;

    let manifest_path = paths.manifest_path(&LoopConfig::default());
    if !manifest_path.exists() {
        write_file(&manifest_path, STARTER_MANIFEST)?;
    }

    Ok(paths)
}

/// Create the `.storyloop/` directories and gitignore if missing. Never overwrites config.
pub fn ensure_layout(paths: &LoopPaths) -> Result<()> {
    for dir in [
        &paths.loop_dir,
        &paths.state_dir,
        &paths.baselines_dir,
        &paths.iterations_dir,
        &paths.pids_dir,
    ] {
        create_dir(dir)?;
    }
    write_file(&paths.gitignore_path, LOOP_GITIGNORE)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

/// Everything under `.storyloop/` is local state.
const LOOP_GITIGNORE: &str = "*\n";

const CONFIG_TEMPLATE: &str = r#"# storyloop configuration. Every field is optional.
manifest_path = "prd.json"
max_iterations = 50
max_attempts = 3
refactor_required = false
teams = false
# model = "sonnet"
delegation_timeout_secs = 3600
agent_output_limit_bytes = 200000
gate_output_limit_bytes = 200000
baseline_max_age_secs = 600

[agent]
command = ["claude", "-p", "--dangerously-skip-permissions"]
model_flag = "--model"

[gates]
timeout_secs = 1800
failure_patterns = [
  '^test (\S+) \.\.\. FAILED',
  '^FAILED (\S+)',
  '^--- FAIL: (\S+)',
]
# [gates.lint]
# command = ["cargo", "clippy", "--quiet", "--"]
# scoped = true
# [gates.typecheck]
# command = ["cargo", "check", "--quiet"]
# [gates.test]
# command = ["cargo", "test", "--quiet"]

[heartbeat]
interval_secs = 60
stall_secs = 300

[attribution]
tie_break = "first-come"
"#;

const STARTER_MANIFEST: &str = r#"{
  "schema_version": 1,
  "stories": [
    {
      "id": "US-1",
      "title": "Describe the first story",
      "description": "What should be true when this story is done?",
      "status": "pending",
      "passes": false,
      "depends_on": [],
      "files": []
    }
  ]
}
"#;
