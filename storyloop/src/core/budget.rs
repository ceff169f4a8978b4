//! Shared time budget helpers for gate and delegation deadlines.

use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};

/// Return the remaining time budget until the provided deadline.
pub fn remaining_budget(deadline: Instant) -> Result<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(anyhow!("time budget exhausted"));
    }
    Ok(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn past_deadline_has_no_budget() {
        assert!(remaining_budget(Instant::now()).is_err());
        let left = remaining_budget(Instant::now() + Duration::from_secs(60)).expect("budget");
        assert!(left > Duration::from_secs(50));
    }
}
