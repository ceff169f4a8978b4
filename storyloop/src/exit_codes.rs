//! Stable exit codes for storyloop CLI commands.

/// Command succeeded; `run` stopped idle or at its iteration limit.
pub const OK: i32 = 0;
/// Invalid layout, config or manifest, or an unusable environment.
pub const INVALID: i32 = 1;
/// `storyloop next` found no eligible story.
pub const COMPLETE: i32 = 2;
/// A story exhausted its attempts, or a teams-mode checkpoint regressed.
pub const EXHAUSTED: i32 = 3;
