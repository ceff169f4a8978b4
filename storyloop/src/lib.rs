//! Autonomous story loop: drive a backlog of user stories to completion by
//! repeatedly delegating one story (or a wave of stories) to a coding agent.
//!
//! Every attempt is held to a test-first commit protocol and to a
//! baseline-aware regression gate before a story is marked passed. The crate
//! keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (scheduling, protocol checks,
//!   baseline comparison, attribution). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, git, process execution).
//!   Isolated behind traits so tests can script the agent and the gates.
//!
//! Orchestration modules ([`looping`], [`orchestrator`], [`regression`],
//! [`select`], [`validate`], [`control`]) coordinate core logic with I/O to
//! implement CLI commands.

pub mod control;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod manifest;
pub mod orchestrator;
pub mod regression;
pub mod select;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
pub mod verify;
