//! Git adapter for the loop.
//!
//! Everything the loop knows about an agent's work comes from the commit graph,
//! so we keep a small, explicit wrapper around `git` subprocess calls.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::attribution::CommitRecord;

const RECORD_SEP: char = '\x1e';
const FIELD_SEP: char = '\x1f';

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True if the workdir is inside a git work tree.
    pub fn is_work_tree(&self) -> Result<bool> {
        let out = self.run(&["rev-parse", "--is-inside-work-tree"])?;
        Ok(out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "true")
    }

    /// True if HEAD points at a commit (false in a freshly initialized repo).
    pub fn has_head(&self) -> Result<bool> {
        Ok(self
            .run(&["rev-parse", "--verify", "--quiet", "HEAD"])?
            .status
            .success())
    }

    /// Full SHA of HEAD.
    pub fn head(&self) -> Result<String> {
        Ok(self.run_capture(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Number of commits reachable from HEAD.
    pub fn commit_count(&self) -> Result<usize> {
        let out = self.run_capture(&["rev-list", "--count", "HEAD"])?;
        out.trim()
            .parse()
            .with_context(|| format!("parse commit count '{}'", out.trim()))
    }

    /// Full messages of the `n` most recent commits, newest first.
    ///
    /// One entry per commit, empty messages included.
    pub fn recent_messages(&self, n: usize) -> Result<Vec<String>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let count = format!("-n{n}");
        let format = format!("--format={RECORD_SEP}%B");
        let out = self.run_capture(&["log", &count, &format])?;
        Ok(split_messages(&out))
    }

    /// Snapshot every commit in `base..HEAD`, oldest first.
    #[instrument(skip_all, fields(base))]
    pub fn commits_since(&self, base: &str) -> Result<Vec<CommitRecord>> {
        let range = format!("{base}..HEAD");
        let format = format!("--format={RECORD_SEP}%H{FIELD_SEP}%B{FIELD_SEP}");
        let out = self.run_capture(&["log", "--reverse", "--name-only", &format, &range])?;
        let commits = parse_commit_log(&out)?;
        debug!(count = commits.len(), "read commits since base");
        Ok(commits)
    }

    /// Create a compensating commit undoing `hash`.
    ///
    /// A conflicting revert is aborted so the tree is left as it was.
    #[instrument(skip_all, fields(hash))]
    pub fn revert(&self, hash: &str) -> Result<()> {
        let out = self.run(&["revert", "--no-edit", hash])?;
        if out.status.success() {
            debug!(hash, "reverted commit");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        warn!(hash, stderr = %stderr, "revert failed, aborting");
        if let Err(e) = self.run_checked(&["revert", "--abort"]) {
            warn!(err = %e, "revert --abort failed");
        }
        Err(anyhow!("git revert {hash} failed: {stderr}"))
    }

    /// Move HEAD to `rev` keeping the index and working tree.
    pub fn reset_soft(&self, rev: &str) -> Result<()> {
        self.run_checked(&["reset", "--soft", rev])?;
        Ok(())
    }

    /// True if `path` exists in the tree of `rev`.
    pub fn path_exists_at(&self, rev: &str, path: &str) -> Result<bool> {
        let spec = format!("{rev}:{path}");
        Ok(self.run(&["cat-file", "-e", &spec])?.status.success())
    }

    /// Restore `path` in both index and working tree to its content at `rev`.
    pub fn restore_path(&self, rev: &str, path: &str) -> Result<()> {
        self.run_checked(&["checkout", rev, "--", path])?;
        Ok(())
    }

    /// Drop `path` from the index; a path that is not tracked is ignored.
    pub fn rm_cached(&self, path: &str) -> Result<()> {
        self.run_checked(&["rm", "--cached", "--quiet", "--ignore-unmatch", "--", path])?;
        Ok(())
    }

    /// Untracked, non-ignored files.
    pub fn untracked_files(&self) -> Result<BTreeSet<String>> {
        let out = self.run_capture(&["ls-files", "--others", "--exclude-standard"])?;
        Ok(non_empty_lines(&out))
    }

    /// Files that differ from `base` (committed, staged or not) plus untracked files.
    pub fn changed_files_since(&self, base: &str) -> Result<BTreeSet<String>> {
        let out = self.run_capture(&["diff", "--name-only", base])?;
        let mut files = non_empty_lines(&out);
        files.extend(self.untracked_files()?);
        Ok(files)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn non_empty_lines(text: &str) -> BTreeSet<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Split `git log` output where every record starts with [`RECORD_SEP`].
fn split_messages(out: &str) -> Vec<String> {
    out.split(RECORD_SEP)
        .skip(1)
        .map(|message| message.trim().to_string())
        .collect()
}

/// Parse `git log --name-only` output framed by record/field separators.
fn parse_commit_log(out: &str) -> Result<Vec<CommitRecord>> {
    let mut commits = Vec::new();
    for record in out.split(RECORD_SEP) {
        if record.trim().is_empty() {
            continue;
        }
        let mut fields = record.splitn(3, FIELD_SEP);
        let hash = fields.next().unwrap_or_default().trim();
        let message = fields
            .next()
            .ok_or_else(|| anyhow!("malformed log record for '{hash}'"))?
            .trim();
        let files = fields.next().map(non_empty_lines).unwrap_or_default();
        commits.push(CommitRecord {
            hash: hash.to_string(),
            message: message.to_string(),
            files: files.into_iter().collect(),
        });
    }
    Ok(commits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn parses_commit_log_records() {
        let raw = concat!(
            "\x1eaaa\x1f[RED] US-1 tests\n\nbody\x1f\n\ntests/a.rs\n",
            "\x1ebbb\x1f[GREEN] US-1\x1f\n\nsrc/a.rs\nsrc/b.rs\n",
        );
        let commits = parse_commit_log(raw).expect("parse");
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].hash, "aaa");
        assert_eq!(commits[0].message, "[RED] US-1 tests\n\nbody");
        assert_eq!(commits[0].files, vec!["tests/a.rs".to_string()]);
        assert_eq!(commits[1].files, vec!["src/a.rs".to_string(), "src/b.rs".to_string()]);
    }

    #[test]
    fn commit_without_files_parses() {
        let commits = parse_commit_log("\x1eccc\x1fempty\x1f\n").expect("parse");
        assert_eq!(commits[0].message, "empty");
        assert!(commits[0].files.is_empty());
    }

    #[test]
    fn empty_messages_keep_their_slot() {
        let raw = "\x1e[GREEN] US-1: implement\n\n\x1e\n\x1e[RED] US-1: test\n";
        let messages = split_messages(raw);
        assert_eq!(
            messages,
            vec![
                "[GREEN] US-1: implement".to_string(),
                String::new(),
                "[RED] US-1: test".to_string(),
            ]
        );
    }

    #[test]
    fn recent_messages_counts_commits_without_a_message() {
        let repo = TestRepo::new().expect("repo");
        repo.commit_file("tests/a.txt", "t", "[RED] US-1: test").expect("commit");
        repo.write("src/a.txt", "a").expect("write");
        for args in [
            &["add", "src/a.txt"][..],
            &["commit", "--quiet", "--allow-empty-message", "-m", ""][..],
        ] {
            let status = std::process::Command::new("git")
                .args(args)
                .current_dir(repo.root())
                .status()
                .expect("spawn git");
            assert!(status.success());
        }

        let messages = repo.git().recent_messages(2).expect("log");
        assert_eq!(messages, vec![String::new(), "[RED] US-1: test".to_string()]);
    }
}
