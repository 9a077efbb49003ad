//! Tracing subscriber bootstrap.
//!
//! The engine never installs a subscriber implicitly (no static
//! constructors per the spec's "no global state with initialization
//! races" design note); the embedding process calls [`init`] exactly once
//! during its own bootstrap, deterministically, alongside [`crate::hlc::Hlc::init`].

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Installs a `tracing-subscriber` filtered by `VOS_LOG` (falling back to
/// `RUST_LOG`, then `info`). Idempotent: later calls are no-ops.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env("VOS_LOG")
            .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}
