//! Startup checks: git repository, manifest, and external commands.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::debug;

use crate::error::EnvironmentError;
use crate::io::config::LoopConfig;
use crate::io::git::Git;
use crate::io::init::LoopPaths;
use crate::io::manifest_store::open_manifest;

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && (m.permissions().mode() & 0o111 != 0))
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

fn path_contains_separator(cmd: &str) -> bool {
    cmd.contains(std::path::MAIN_SEPARATOR) || cmd.contains('/')
}

pub fn find_executable_in_dirs(name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    if name.trim().is_empty() {
        return None;
    }
    dirs.iter()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

pub fn find_executable_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    let dirs: Vec<PathBuf> = std::env::split_paths(&path_var).collect();
    find_executable_in_dirs(name, &dirs)
}

/// True if `cmd` is an executable path, or a bare name found on `PATH`.
///
/// Relative paths resolve against `workdir`, where commands are spawned.
pub fn can_resolve_command(cmd: &str, workdir: &Path) -> bool {
    let trimmed = cmd.trim();
    if trimmed.is_empty() {
        return false;
    }
    if path_contains_separator(trimmed) {
        return is_executable(&workdir.join(trimmed));
    }
    find_executable_in_path(trimmed).is_some()
}

/// Verify everything `storyloop run` needs before the first delegation.
///
/// Returns the first problem found as a typed [`EnvironmentError`].
pub fn check_environment(paths: &LoopPaths, cfg: &LoopConfig, git: &Git) -> Result<()> {
    if !git.is_work_tree()? {
        return Err(EnvironmentError::NotAGitRepo(paths.root.clone()).into());
    }
    if !git.has_head()? {
        return Err(EnvironmentError::NoHeadCommit.into());
    }

    open_manifest(&paths.manifest_path(cfg))?;

    let mut tools: Vec<(String, &str)> = Vec::new();
    if let Some(program) = cfg.agent.command.first() {
        tools.push(("agent".to_string(), program));
    }
    for (name, gate) in cfg.gates.configured() {
        if let Some(program) = gate.command.first() {
            tools.push((format!("{name} gate"), program));
        }
    }
    for (role, program) in tools {
        if !can_resolve_command(program, &paths.root) {
            return Err(EnvironmentError::MissingTool {
                role,
                program: program.to_string(),
            }
            .into());
        }
        debug!(%role, %program, "command resolved");
    }
    Ok(())
}
