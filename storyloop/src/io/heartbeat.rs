//! Heartbeat monitor for long delegations.
//!
//! A background thread wakes every `interval`, reports elapsed time, and flags a
//! stall when the watched log has not grown for `stall`. The monitor is stopped
//! and joined as soon as delegation returns.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// Observations made while the agent was running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Agent still running and its log grew since the last tick.
    Alive { elapsed: Duration },
    /// Log unchanged for at least the stall threshold.
    Stalled { elapsed: Duration, idle: Duration },
}

#[derive(Debug, Clone)]
pub struct HeartbeatOptions {
    pub label: String,
    pub watch_path: PathBuf,
    pub interval: Duration,
    pub stall: Duration,
}

pub struct Heartbeat {
    stop: Sender<()>,
    handle: JoinHandle<Vec<HeartbeatEvent>>,
}

impl Heartbeat {
    pub fn start(options: HeartbeatOptions) -> Self {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            let started = Instant::now();
            let mut last_len = file_len(&options.watch_path);
            let mut last_growth = started;
            let mut events = Vec::new();
            loop {
                match stopped.recv_timeout(options.interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                let now = Instant::now();
                let elapsed = now.duration_since(started);
                let len = file_len(&options.watch_path);
                if len != last_len {
                    last_len = len;
                    last_growth = now;
                }
                let idle = now.duration_since(last_growth);
                let event = if idle >= options.stall {
                    warn!(
                        label = %options.label,
                        elapsed_secs = elapsed.as_secs(),
                        idle_secs = idle.as_secs(),
                        "agent output stalled"
                    );
                    HeartbeatEvent::Stalled { elapsed, idle }
                } else {
                    info!(
                        label = %options.label,
                        elapsed_secs = elapsed.as_secs(),
                        "agent running"
                    );
                    HeartbeatEvent::Alive { elapsed }
                };
                events.push(event);
            }
            events
        });
        Self { stop, handle }
    }

    /// Stop the monitor and return what it observed.
    pub fn stop(self) -> Vec<HeartbeatEvent> {
        // The thread may already have exited; a send error is harmless.
        let _ = self.stop.send(());
        self.handle.join().unwrap_or_default()
    }
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}
