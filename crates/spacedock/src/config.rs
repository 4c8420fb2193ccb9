//! Daemon configuration: TOML file plus environment overrides.
//!
//! Every monitor timing is a tunable here, not a constant in the code;
//! `SPACEDOCK_TEST_FAST` clamps the intervals so scenario tests don't wait
//! out real backoff ladders.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use spacedock_daemon::{BackoffPolicy, RetryPolicy};

const TEST_FAST_INTERVAL_MS: u64 = 25;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Fixed interval between `is_connected` polls.
    pub health_check_interval_ms: u64,
    /// Wait after a connect attempt before re-checking the link.
    pub settle_ms: u64,
    /// Backoff ladder base.
    pub reconnect_base_ms: u64,
    /// Backoff ladder cap.
    pub reconnect_cap_ms: u64,
    pub max_reconnect_attempts: u32,
    /// True: reset the counter at the limit and keep retrying.
    /// False: broadcast `reconnectionFailed` and stop.
    pub continuous_retry: bool,
    /// Bounded wait for remote-origin traffic before trusting the path
    /// index (initial load and post-reconnect resync).
    pub pathindex_sync_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: 5_000,
            settle_ms: 500,
            reconnect_base_ms: 1_000,
            reconnect_cap_ms: 30_000,
            max_reconnect_attempts: 10,
            continuous_retry: true,
            pathindex_sync_timeout_ms: 1_000,
        }
    }
}

impl ConnectionConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.reconnect_base_ms),
            cap: Duration::from_millis(self.reconnect_cap_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        if self.continuous_retry {
            RetryPolicy::Continuous
        } else {
            RetryPolicy::Bounded
        }
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn pathindex_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.pathindex_sync_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    /// Registration scope served paths live under.
    pub scope: String,
    /// Path prefixes under the scope that bypass the daemon entirely.
    pub reserved_assets: Vec<String>,
    /// Bounded wait for an in-flight load/recovery before a fetch gives up.
    pub recovery_timeout_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            scope: "/space".to_string(),
            reserved_assets: vec!["runtime/".to_string(), "sw.js".to_string()],
            recovery_timeout_ms: 15_000,
        }
    }
}

impl FetchConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "info" or "spacedock=debug".
    pub level: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub data_dir: Option<PathBuf>,
    pub runtime_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Default sync server URL, lowest priority in endpoint derivation.
    pub server_url: Option<String>,
    pub connection: ConnectionConfig,
    pub fetch: FetchConfig,
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
}

pub fn config_path() -> PathBuf {
    crate::paths::config_dir().join("config.toml")
}

/// Load config from disk, falling back to defaults, then apply env
/// overrides. Never fails: a broken file logs and yields defaults.
pub fn load() -> Config {
    let path = config_path();
    let mut config = match fs::read_to_string(&path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(path = %path.display(), "config parse failed, using defaults: {err}");
                Config::default()
            }
        },
        Err(_) => Config::default(),
    };
    apply_env_overrides(&mut config);
    config
}

pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(url) = std::env::var("SPACEDOCK_SERVER_URL")
        && !url.is_empty()
    {
        config.server_url = Some(url);
    }
    if let Ok(raw) = std::env::var("SPACEDOCK_CONTINUOUS_RETRY") {
        config.connection.continuous_retry = env_truthy(&raw);
    }
    if let Ok(dir) = std::env::var("SPACEDOCK_DATA_DIR") {
        config.paths.data_dir = Some(PathBuf::from(dir));
    }
    if env_flag("SPACEDOCK_TEST_FAST") {
        apply_test_fast(config);
    }
}

/// Clamp every interval so tests never wait out real ladders.
fn apply_test_fast(config: &mut Config) {
    let c = &mut config.connection;
    c.health_check_interval_ms = c.health_check_interval_ms.min(TEST_FAST_INTERVAL_MS);
    c.settle_ms = c.settle_ms.min(TEST_FAST_INTERVAL_MS);
    c.reconnect_base_ms = c.reconnect_base_ms.min(TEST_FAST_INTERVAL_MS);
    c.reconnect_cap_ms = c.reconnect_cap_ms.min(10 * TEST_FAST_INTERVAL_MS);
    if c.reconnect_cap_ms < c.reconnect_base_ms {
        c.reconnect_cap_ms = c.reconnect_base_ms;
    }
    c.pathindex_sync_timeout_ms = c.pathindex_sync_timeout_ms.min(TEST_FAST_INTERVAL_MS);
    config.fetch.recovery_timeout_ms = config
        .fetch
        .recovery_timeout_ms
        .min(20 * TEST_FAST_INTERVAL_MS);
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|raw| env_truthy(&raw))
}

fn env_truthy(raw: &str) -> bool {
    !matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "n" | "off"
    )
}
