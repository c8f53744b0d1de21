//! # Logging
//!
//! Structured diagnostic logging for the engine, separate from the
//! human-facing summaries the CLI prints directly via `colored`/`eprintln!`.
//! Per-file failures and race retries are logged here at `warn!` so they
//! can be filtered, counted, or redirected independently of the
//! user-facing progress output.

use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber.
///
/// `level` is the `--log-level` CLI flag (e.g. `"warn"`, `"info"`, `"debug"`)
/// and is used as the default filter directive; it is overridden by the
/// `RUST_LOG` environment variable when set, matching `EnvFilter`'s usual
/// precedence.
pub fn init(level: &str) {
    let filter = EnvFilter::builder()
        .with_default_directive(level.parse().unwrap_or_else(|_| "warn".parse().unwrap()))
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}
