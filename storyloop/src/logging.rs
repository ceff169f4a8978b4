//! Development-time tracing for debugging the loop.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of storyloop's product output.
//!
//! - **Loop records (`io/iteration_log`, `io/progress_log`)**: Product artifacts in
//!   `.storyloop/`. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, falling back to `warn`. `--verbose` on the CLI raises the
/// fallback to `storyloop=info`. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=storyloop=debug storyloop run --max-iterations 1
/// ```
pub fn init(verbose: bool) {
    let fallback = if verbose { "storyloop=info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
