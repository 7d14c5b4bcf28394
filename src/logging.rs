//! Structured logging setup via `tracing`. Verbosity is controlled with
//! the standard `RUST_LOG` environment variable; `info` is the default.

use tracing_subscriber::EnvFilter;

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
