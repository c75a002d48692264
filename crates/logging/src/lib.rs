//! Logging bootstrap
//!
//! Thin wrapper over tracing-subscriber with env-filter support. Binaries
//! call `init` once at startup; tests use `init_for_tests` which tolerates
//! repeated initialization.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global subscriber from `RUST_LOG`, defaulting to `info`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();
}

/// Like [`init`] but safe to call from every test.
pub fn init_for_tests() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt().with_env_filter(filter).with_test_writer().try_init();
}
