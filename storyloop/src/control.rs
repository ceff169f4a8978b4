//! Maintenance commands: `storyloop stop`, `storyloop log`, `storyloop reset`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::io::config::load_config;
use crate::io::init::LoopPaths;
use crate::io::iteration_log::latest_iteration;
use crate::io::manifest_store::{open_manifest, write_manifest};
use crate::io::process::{terminate_group, terminate_process};

/// What `stop_loops` found in `.storyloop/pids/`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    /// Loop processes that received SIGTERM.
    pub loops: Vec<u32>,
    /// Agent process groups that received SIGTERM.
    pub agents: Vec<u32>,
    /// Pid files whose process was already gone.
    pub stale: usize,
}

/// Signal every recorded agent process group, then every recorded loop.
///
/// Pid files are removed afterwards; a terminated loop cannot clean up after itself.
pub fn stop_loops(root: &Path) -> Result<StopReport> {
    let paths = LoopPaths::new(root);
    let mut report = StopReport::default();
    if !paths.pids_dir.is_dir() {
        return Ok(report);
    }

    let mut loops = Vec::new();
    let mut agents = Vec::new();
    for entry in fs::read_dir(&paths.pids_dir)
        .with_context(|| format!("read dir {}", paths.pids_dir.display()))?
    {
        let path = entry
            .with_context(|| format!("read entry in {}", paths.pids_dir.display()))?
            .path();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("agent") => agents.push(path),
            Some("pid") => loops.push(path),
            _ => debug!(path = %path.display(), "ignoring unknown file in pids dir"),
        }
    }

    for path in agents {
        match read_pid(&path)? {
            Some(pid) if terminate_group(pid)? => report.agents.push(pid),
            _ => report.stale += 1,
        }
        remove_pid_file(&path);
    }
    for path in loops {
        match read_pid(&path)? {
            Some(pid) if pid != std::process::id() && terminate_process(pid)? => {
                report.loops.push(pid)
            }
            _ => report.stale += 1,
        }
        remove_pid_file(&path);
    }
    info!(
        loops = report.loops.len(),
        agents = report.agents.len(),
        stale = report.stale,
        "stop finished"
    );
    Ok(report)
}

fn read_pid(path: &Path) -> Result<Option<u32>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let pid = raw.trim().parse::<u32>().ok();
    if pid.is_none() {
        warn!(path = %path.display(), "pid file does not hold a pid");
    }
    Ok(pid)
}

fn remove_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!(err = %e, path = %path.display(), "failed to remove pid file");
    }
}

/// The latest iteration's files, for `storyloop log`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationLog {
    pub dir: PathBuf,
    pub meta: Option<String>,
    pub gates: Option<String>,
    pub agent: Option<String>,
}

impl IterationLog {
    pub fn render(&self) -> String {
        let mut out = format!("iteration: {}\n", self.dir.display());
        let sections = [("meta", &self.meta), ("gates", &self.gates), ("agent", &self.agent)];
        for (label, body) in sections {
            if let Some(body) = body {
                out.push_str(&format!("\n== {label} ==\n{body}"));
                if !body.ends_with('\n') {
                    out.push('\n');
                }
            }
        }
        out
    }
}

/// Most recent iteration of the most recent run, or `None` before the first run.
pub fn latest_log(root: &Path) -> Result<Option<IterationLog>> {
    let paths = LoopPaths::new(root);
    let Some(iteration) = latest_iteration(&paths.iterations_dir)? else {
        return Ok(None);
    };
    Ok(Some(IterationLog {
        meta: read_optional(&iteration.meta_path)?,
        gates: read_optional(&iteration.gates_log_path)?,
        agent: read_optional(&iteration.agent_log_path)?,
        dir: iteration.dir,
    }))
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    if !path.is_file() {
        return Ok(None);
    }
    fs::read_to_string(path)
        .map(Some)
        .with_context(|| format!("read {}", path.display()))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResetOptions {
    /// Also set every story back to pending.
    pub stories: bool,
}

/// Forget run state, baselines, iteration logs and the progress log.
///
/// Config and pid files are kept. Returns the number of stories reset.
pub fn reset_loop(root: &Path, options: ResetOptions) -> Result<usize> {
    let paths = LoopPaths::new(root);
    for dir in [&paths.state_dir, &paths.baselines_dir, &paths.iterations_dir] {
        if dir.is_dir() {
            fs::remove_dir_all(dir).with_context(|| format!("remove {}", dir.display()))?;
        }
    }
    if paths.progress_log_path.is_file() {
        fs::remove_file(&paths.progress_log_path)
            .with_context(|| format!("remove {}", paths.progress_log_path.display()))?;
    }

    if !options.stories {
        info!("loop state reset");
        return Ok(0);
    }
    let cfg = load_config(&paths.config_path).context("load config.toml")?;
    let manifest_path = paths.manifest_path(&cfg);
    let mut manifest = open_manifest(&manifest_path)?;
    let count = manifest.stories.len();
    manifest.reset_all();
    write_manifest(&manifest_path, &manifest)?;
    info!(stories = count, "loop state and stories reset");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::init::ensure_layout;
    use crate::io::iteration_log::IterationPaths;
    use crate::manifest::StoryStatus;
    use crate::test_support::{TestRepo, passed, story};

    #[cfg(unix)]
    #[test]
    fn stop_clears_stale_pid_files() {
        let repo = TestRepo::new().expect("repo");
        let paths = LoopPaths::new(repo.root());
        ensure_layout(&paths).expect("layout");
        fs::write(paths.pids_dir.join("4194311.pid"), "4194311\n").expect("write");
        fs::write(paths.pids_dir.join("4194311.agent"), "4194312\n").expect("write");
        fs::write(paths.pids_dir.join("junk.pid"), "not a pid\n").expect("write");

        let report = stop_loops(repo.root()).expect("stop");
        assert_eq!(report.stale, 3);
        assert!(report.loops.is_empty());
        assert!(report.agents.is_empty());
        assert_eq!(fs::read_dir(&paths.pids_dir).expect("read").count(), 0);
    }

    #[test]
    fn stop_without_layout_is_a_no_op() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(stop_loops(temp.path()).expect("stop"), StopReport::default());
    }

    #[test]
    fn latest_log_reads_newest_iteration() {
        let repo = TestRepo::new().expect("repo");
        let paths = LoopPaths::new(repo.root());
        assert_eq!(latest_log(repo.root()).expect("log"), None);

        for (run, iter) in [
            ("run-20260101T000000Z", 9),
            ("run-20260102T000000Z", 2),
            ("run-20260102T000000Z", 10),
        ] {
            let it = IterationPaths::new(&paths.iterations_dir, run, iter);
            it.create().expect("create");
            fs::write(&it.gates_log_path, format!("{run}/{iter}")).expect("write");
        }
        let log = latest_log(repo.root()).expect("log").expect("some");
        assert!(log.dir.ends_with("run-20260102T000000Z/10"));
        assert_eq!(log.gates.as_deref(), Some("run-20260102T000000Z/10"));
        assert_eq!(log.agent, None);
        assert!(log.render().contains("== gates ==\nrun-20260102T000000Z/10\n"));
    }

    #[test]
    fn reset_removes_state_and_optionally_stories() {
        let repo = TestRepo::with_stories(vec![passed("US-1"), story("US-2")]).expect("repo");
        let paths = LoopPaths::new(repo.root());
        ensure_layout(&paths).expect("layout");
        fs::write(&paths.progress_log_path, "x\n").expect("write");
        fs::write(paths.baselines_dir.join("current.json"), "{}").expect("write");

        assert_eq!(reset_loop(repo.root(), ResetOptions::default()).expect("reset"), 0);
        assert!(!paths.progress_log_path.exists());
        assert!(!paths.baselines_dir.exists());
        assert!(repo.read_manifest().expect("manifest").stories[0].is_passed());

        let reset = reset_loop(repo.root(), ResetOptions { stories: true }).expect("reset");
        assert_eq!(reset, 2);
        let manifest = repo.read_manifest().expect("manifest");
        assert!(manifest.stories.iter().all(|s| s.status == StoryStatus::Pending));
    }
}
