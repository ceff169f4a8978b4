//! Append-only progress log (`.storyloop/progress.log`).
//!
//! One entry per iteration, plain text so it reads well in a diff.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};

/// One iteration's outcome as recorded in the progress log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEntry {
    pub at: DateTime<Utc>,
    pub iter: u32,
    pub story_id: String,
    pub outcome: String,
    pub note: String,
}

impl ProgressEntry {
    pub fn render(&self) -> String {
        let mut out = format!(
            "[{}] iter={} story={} outcome={}\n",
            self.at.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.iter,
            self.story_id,
            self.outcome
        );
        for line in self.note.lines().filter(|line| !line.trim().is_empty()) {
            out.push_str("  ");
            out.push_str(line.trim_end());
            out.push('\n');
        }
        out
    }
}

/// Append a run header so entries from different runs stay distinguishable.
pub fn append_run_header(path: &Path, run_id: &str, at: DateTime<Utc>) -> Result<()> {
    append(
        path,
        &format!(
            "=== run {run_id} started {} ===\n",
            at.to_rfc3339_opts(SecondsFormat::Secs, true)
        ),
    )
}

pub fn append_entry(path: &Path, entry: &ProgressEntry) -> Result<()> {
    append(path, &entry.render())
}

fn append(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open progress log {}", path.display()))?;
    file.write_all(text.as_bytes())
        .with_context(|| format!("append progress log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(iter: u32, outcome: &str, note: &str) -> ProgressEntry {
        ProgressEntry {
            at: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).single().expect("valid time"),
            iter,
            story_id: "US-1".to_string(),
            outcome: outcome.to_string(),
            note: note.to_string(),
        }
    }

    #[test]
    fn entries_render_as_indented_blocks() {
        let rendered = entry(3, "failed", "new failures:\n\ntest_y\n").render();
        assert_eq!(
            rendered,
            "[2026-01-02T03:04:05Z] iter=3 story=US-1 outcome=failed\n  new failures:\n  test_y\n"
        );
    }

    #[test]
    fn appends_never_truncate() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("progress.log");
        append_run_header(&path, "run-1", Utc::now()).expect("header");
        append_entry(&path, &entry(1, "failed", "missing red")).expect("first");
        append_entry(&path, &entry(2, "passed", "")).expect("second");

        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.starts_with("=== run run-1 started "));
        assert!(text.contains("iter=1 story=US-1 outcome=failed\n  missing red\n"));
        assert!(text.ends_with("iter=2 story=US-1 outcome=passed\n"));
    }
}
