//! Logging setup
//!
//! The runtime only emits `tracing` events; embedding processes install a
//! subscriber. [`init`] is the stock one: a fmt subscriber filtered by
//! `RUST_LOG`, falling back to the given directive.

use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber.
///
/// Returns `false` if a global subscriber was already set, which is harmless
/// when several tests race to initialize logging.
pub fn init(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Install a subscriber that writes through the test harness capture.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
