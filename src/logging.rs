//! Subscriber setup.
//!
//! Pipeline events are emitted through `tracing`; the `log` records written
//! by the store and the collaborators are forwarded into the same
//! subscriber. `RUST_LOG` overrides the default level.

use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

pub const DEFAULT_FILTER: &str = "info";

pub fn build_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init_logging(verbose: bool) {
    let filter = build_filter(if verbose { "debug" } else { DEFAULT_FILTER });
    let result = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(verbose))
        .try_init();
    if result.is_err() {
        tracing::debug!("Logging already initialised");
    }
}
