//! Tracing setup for the `scriptjob` binary.
//!
//! Script output is routed through the same subscriber (see
//! [`crate::io::log_sink`]), so `RUST_LOG` controls both pipeline diagnostics
//! and the lines a script writes.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG` env var. Defaults to `warn` if unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=scriptjob=info scriptjob run --props job.toml --step load
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
