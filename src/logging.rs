//! Structured logging bootstrap, shared by the gateway binary and by tests.

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Initializes the global `tracing` subscriber. Idempotent: safe to call from
/// every test and from `gateway_main`; only the first call takes effect.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("syndicate_ug=info,syndicate_ug::replication=debug")
        });
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}
