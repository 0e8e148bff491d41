//! Process-wide tracing setup for the `tablerun` binary.
//!
//! Agent attempts outside debug mode additionally run under a scoped
//! subscriber from [`crate::capture`]; events inside that scope go to the
//! capture buffer instead of stderr.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `info` with `debug`, `warn` otherwise.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=tablerun=debug tablerun dispatch --dry-run
/// ```
pub fn init(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

fn default_directive(debug: bool) -> &'static str {
    if debug { "info" } else { "warn" }
}
