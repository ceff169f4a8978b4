//! I/O helpers for loop commands: files under `.storyloop/`, git, and child processes.

pub mod agent;
pub mod atomic;
pub mod baseline_store;
pub mod config;
pub mod environment;
pub mod gates;
pub mod git;
pub mod heartbeat;
pub mod init;
pub mod iteration_log;
pub mod manifest_store;
pub mod process;
pub mod progress_log;
pub mod prompt;
pub mod run_state;
