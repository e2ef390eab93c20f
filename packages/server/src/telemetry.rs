//! Process-wide `tracing` setup, initialized once from `main`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a `tracing_subscriber::fmt` layer filtered by `RUST_LOG`
/// (default `info`), the same `EnvFilter`-driven shape the rest of the
/// retrieved corpus initializes logging with.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry().with(fmt::layer()).with(filter).try_init();
}
