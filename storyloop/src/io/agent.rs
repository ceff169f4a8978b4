//! Agent abstraction for story delegation.
//!
//! The [`Agent`] trait decouples the loop from the actual coding agent backend
//! (by default `claude -p`). The loop only observes the commits an agent leaves
//! behind plus its exit status; tests use scripted agents that commit directly.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::io::config::AgentConfig;
use crate::io::process::{Tracking, run_command_with_stream};

/// Parameters for one delegation.
#[derive(Debug, Clone)]
pub struct DelegationRequest {
    /// Repository the agent works in.
    pub workdir: PathBuf,
    /// Brief written to the agent's stdin.
    pub brief: String,
    pub model: Option<String>,
    /// Live log of agent stdout/stderr.
    pub log_path: PathBuf,
    /// Holds the agent's process group id while it runs, for `storyloop stop`.
    pub pid_path: Option<PathBuf>,
    /// Wall-clock budget; the whole process tree is killed when it runs out.
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// What the loop learns from a finished delegation besides the commit graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelegationResult {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl DelegationResult {
    pub fn completed(exit_code: i32) -> Self {
        Self {
            exit_code: Some(exit_code),
            timed_out: false,
        }
    }
}

/// Abstraction over coding agent backends. Blocks until the agent returns.
pub trait Agent {
    fn delegate(&self, request: &DelegationRequest) -> Result<DelegationResult>;
}

/// Agent that spawns the configured command and writes the brief to its stdin.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    config: AgentConfig,
}

impl CommandAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    fn command(&self, request: &DelegationRequest) -> Result<Command> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .context("agent.command is empty")?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(model) = &request.model {
            cmd.arg(&self.config.model_flag).arg(model);
        }
        cmd.current_dir(&request.workdir);
        Ok(cmd)
    }
}

impl Agent for CommandAgent {
    #[instrument(
        skip_all,
        fields(timeout_secs = request.timeout.as_secs(), model = ?request.model)
    )]
    fn delegate(&self, request: &DelegationRequest) -> Result<DelegationResult> {
        info!(workdir = %request.workdir.display(), "delegating to agent");
        let cmd = self.command(request)?;
        let output = run_command_with_stream(
            cmd,
            Some(request.brief.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
            Tracking {
                stream_path: Some(&request.log_path),
                pid_path: request.pid_path.as_deref(),
            },
        )
        .context("run agent command")?;

        let mut trailer = output.truncated_notice("agent");
        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
            trailer.push_str(&format!(
                "\n[agent timed out after {}s]\n",
                request.timeout.as_secs()
            ));
        }
        if !trailer.is_empty() {
            let mut log = OpenOptions::new()
                .append(true)
                .open(&request.log_path)
                .with_context(|| format!("open agent log {}", request.log_path.display()))?;
            log.write_all(trailer.as_bytes())
                .with_context(|| format!("append agent log {}", request.log_path.display()))?;
        }

        debug!(exit_code = ?output.status.code(), "agent returned");
        Ok(DelegationResult {
            exit_code: output.status.code(),
            timed_out: output.timed_out,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn request(dir: &std::path::Path, timeout: Duration) -> DelegationRequest {
        DelegationRequest {
            workdir: dir.to_path_buf(),
            brief: "do the story\n".to_string(),
            model: Some("opus".to_string()),
            log_path: dir.join("iter/agent.log"),
            pid_path: None,
            timeout,
            output_limit_bytes: 10_000,
        }
    }

    #[test]
    fn brief_goes_to_stdin_and_model_flag_is_appended() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = CommandAgent::new(AgentConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "cat; echo \"args: $*\"".to_string(),
                "agent".to_string(),
            ],
            model_flag: "--model".to_string(),
        });
        let req = request(temp.path(), Duration::from_secs(10));
        let result = agent.delegate(&req).expect("delegate");
        assert_eq!(result, DelegationResult::completed(0));

        let log = std::fs::read_to_string(&req.log_path).expect("read log");
        assert!(log.contains("do the story"));
        assert!(log.contains("args: --model opus"));
    }

    #[test]
    fn timeout_is_reported_not_raised() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = CommandAgent::new(AgentConfig {
            command: vec!["sh".to_string(), "-c".to_string(), "sleep 30".to_string()],
            model_flag: "--model".to_string(),
        });
        let result = agent
            .delegate(&request(temp.path(), Duration::from_millis(200)))
            .expect("delegate");
        assert!(result.timed_out);
        let log = std::fs::read_to_string(temp.path().join("iter/agent.log")).expect("read");
        assert!(log.contains("timed out"));
    }
}
