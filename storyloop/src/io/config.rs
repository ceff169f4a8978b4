//! Loop configuration stored under `.storyloop/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::atomic::write_atomic;
use crate::core::attribution::TieBreak;

/// Loop configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields fall back to
/// defaults; CLI flags override individual values for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    /// Story manifest, relative to the project root.
    pub manifest_path: String,

    /// Upper bound on iterations per `storyloop run` invocation.
    pub max_iterations: u32,

    /// Attempts per story before the run halts.
    pub max_attempts: u32,

    /// Require a `[REFACTOR]` commit after green.
    pub refactor_required: bool,

    /// Delegate a whole wave of eligible stories at once.
    pub teams: bool,

    /// Model passed to the agent command, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Wall-clock budget for one delegation in seconds.
    pub delegation_timeout_secs: u64,

    /// Truncate captured agent output beyond this many bytes.
    pub agent_output_limit_bytes: usize,

    /// Truncate captured gate output beyond this many bytes.
    pub gate_output_limit_bytes: usize,

    /// Reuse a captured baseline at the same revision for this long.
    pub baseline_max_age_secs: u64,

    pub agent: AgentConfig,
    pub gates: GatesConfig,
    pub heartbeat: HeartbeatConfig,
    pub attribution: AttributionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent command; the brief is written to its stdin.
    pub command: Vec<String>,
    /// Flag placed before the model name.
    pub model_flag: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "claude".to_string(),
                "-p".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
            model_flag: "--model".to_string(),
        }
    }
}

/// One quality gate command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateCommand {
    pub command: Vec<String>,
    /// Append the story's scoped file list as arguments.
    #[serde(default)]
    pub scoped: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatesConfig {
    /// Total budget for one gate pass in seconds.
    pub timeout_secs: u64,
    /// Regexes whose first capture group names a failing test.
    pub failure_patterns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lint: Option<GateCommand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typecheck: Option<GateCommand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test: Option<GateCommand>,
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30 * 60,
            failure_patterns: default_failure_patterns(),
            lint: None,
            typecheck: None,
            test: None,
        }
    }
}

fn default_failure_patterns() -> Vec<String> {
    vec![
        r"^test (\S+) \.\.\. FAILED".to_string(),
        r"^FAILED (\S+)".to_string(),
        r"^--- FAIL: (\S+)".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    /// Warn when the agent log has not grown for this long.
    pub stall_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            stall_secs: 5 * 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AttributionConfig {
    pub tie_break: TieBreak,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            manifest_path: "prd.json".to_string(),
            max_iterations: 50,
            max_attempts: 3,
            refactor_required: false,
            teams: false,
            model: None,
            delegation_timeout_secs: 60 * 60,
            agent_output_limit_bytes: 200_000,
            gate_output_limit_bytes: 200_000,
            baseline_max_age_secs: 10 * 60,
            agent: AgentConfig::default(),
            gates: GatesConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            attribution: AttributionConfig::default(),
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.manifest_path.trim().is_empty() {
            return Err(anyhow!("manifest_path must not be empty"));
        }
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.delegation_timeout_secs == 0 {
            return Err(anyhow!("delegation_timeout_secs must be > 0"));
        }
        if self.agent_output_limit_bytes == 0 {
            return Err(anyhow!("agent_output_limit_bytes must be > 0"));
        }
        if self.gate_output_limit_bytes == 0 {
            return Err(anyhow!("gate_output_limit_bytes must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        for (name, gate) in self.gates.configured() {
            if gate.command.is_empty() || gate.command[0].trim().is_empty() {
                return Err(anyhow!("gates.{name}.command must be a non-empty array"));
            }
        }
        if self.gates.timeout_secs == 0 {
            return Err(anyhow!("gates.timeout_secs must be > 0"));
        }
        for pattern in &self.gates.failure_patterns {
            let re = Regex::new(pattern)
                .with_context(|| format!("gates.failure_patterns: invalid regex '{pattern}'"))?;
            if re.captures_len() < 2 {
                return Err(anyhow!(
                    "gates.failure_patterns: '{pattern}' needs a capture group for the test id"
                ));
            }
        }
        if self.heartbeat.interval_secs == 0 {
            return Err(anyhow!("heartbeat.interval_secs must be > 0"));
        }
        if self.heartbeat.stall_secs < self.heartbeat.interval_secs {
            return Err(anyhow!("heartbeat.stall_secs must be >= heartbeat.interval_secs"));
        }
        Ok(())
    }
}

impl GatesConfig {
    /// Configured gates in execution order.
    pub fn configured(&self) -> Vec<(&'static str, &GateCommand)> {
        [
            ("lint", self.lint.as_ref()),
            ("typecheck", self.typecheck.as_ref()),
            ("test", self.test.as_ref()),
        ]
        .into_iter()
        .filter_map(|(name, gate)| gate.map(|gate| (name, gate)))
        .collect()
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        let cfg = LoopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LoopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, LoopConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = LoopConfig::default();
        cfg.model = Some("opus".to_string());
        cfg.gates.test = Some(GateCommand {
            command: vec!["cargo".to_string(), "test".to_string()],
            scoped: false,
        });
        cfg.attribution.tie_break = TieBreak::Shared;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "teams = true\n[gates.lint]\ncommand = [\"ruff\", \"check\"]\nscoped = true\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert!(cfg.teams);
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.gates.configured().len(), 1);
        assert!(cfg.gates.lint.as_ref().is_some_and(|g| g.scoped));
    }

    #[test]
    fn rejects_pattern_without_capture_group() {
        let mut cfg = LoopConfig::default();
        cfg.gates.failure_patterns = vec!["FAILED".to_string()];
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("capture group"));
    }

    #[test]
    fn rejects_empty_gate_command() {
        let mut cfg = LoopConfig::default();
        cfg.gates.typecheck = Some(GateCommand {
            command: Vec::new(),
            scoped: false,
        });
        assert!(cfg.validate().is_err());
    }
}
