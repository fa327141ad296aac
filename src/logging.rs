//! Tracing subscriber setup.
//!
//! `RUST_LOG` controls the filter (default `info`). Setting
//! `NETSUP_LOG_FORMAT=json` switches to JSON lines for log shippers. Logs go
//! to stderr; stdout belongs to command output.

use tracing_subscriber::EnvFilter;

pub const LOG_FORMAT_ENV: &str = "NETSUP_LOG_FORMAT";

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Uses `try_init` so every test may call it.
pub fn init_for_tests() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
