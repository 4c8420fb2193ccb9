//! Tracing initialization.
//!
//! The daemon logs to stderr; file management belongs to whatever
//! supervises the process. `SPACEDOCK_LOG` (or the config level) feeds the
//! env filter; `-v`/`-vv` raise the floor.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

pub fn init(verbosity: u8, logging: &LoggingConfig) {
    let default_directive = match verbosity {
        0 => logging.level.clone().unwrap_or_else(|| "info".to_string()),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let filter = EnvFilter::try_from_env("SPACEDOCK_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
    if result.is_err() {
        // Re-initialization in tests is harmless.
        tracing::debug!("tracing already initialized");
    }
}
