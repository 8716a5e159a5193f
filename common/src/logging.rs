//! Logging setup shared by every binary and test harness in the workspace.
//! The core itself only calls `log::{error,warn,info,debug}`; this is the
//! one place that wires a concrete logger to those calls, matching the
//! teacher's `env_logger::init()` at the binary edge rather than each
//! crate picking its own logging backend.

use std::sync::Once;

static INIT: Once = Once::new();

/// Initializes `env_logger` exactly once per process. Safe to call from
/// every binary's `main` and from test setup; repeat calls are no-ops.
pub fn init_logging() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    });
}
