//! Progress bar and ETA arithmetic for loop reporting.

use std::time::Duration;

const BAR_WIDTH: usize = 30;

/// Whole-number completion percentage; an empty backlog reports 0.
pub fn percent(passed: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    ((passed.min(total) * 100) / total) as u32
}

/// Fixed-width bar such as `[#########.....................] 3/10 (30%)`.
pub fn progress_bar(passed: usize, total: usize) -> String {
    let filled = if total == 0 {
        0
    } else {
        (passed.min(total) * BAR_WIDTH) / total
    };
    format!(
        "[{}{}] {}/{} ({}%)",
        "#".repeat(filled),
        ".".repeat(BAR_WIDTH - filled),
        passed,
        total,
        percent(passed, total)
    )
}

/// Remaining time from the mean duration of stories completed in this run.
///
/// Returns `None` until at least one story has completed.
pub fn estimate_remaining(completed: &[Duration], remaining: usize) -> Option<Duration> {
    if completed.is_empty() {
        return None;
    }
    let total: Duration = completed.iter().sum();
    let mean = total / completed.len() as u32;
    Some(mean * remaining as u32)
}

/// Compact human duration: `45s`, `3m 05s`, `2h 10m`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60)
    }
}
