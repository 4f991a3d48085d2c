//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured level. Initialization is
//! idempotent: only the first call installs a subscriber.

use tracing_subscriber::EnvFilter;

/// Installs a fmt subscriber filtered at `level` for this crate.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,rust_tsp={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}

/// Installs a JSON subscriber, for log collection by other tools.
pub fn init_json(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,rust_tsp={level}")));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}
