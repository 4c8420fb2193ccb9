//! XDG directory helpers for config/data/runtime locations.

use std::path::PathBuf;

use crate::config::PathsConfig;

pub const APP_DIR: &str = "spacedock";

/// Base directory for persistent data (resume cache).
///
/// Priority: `SPACEDOCK_DATA_DIR`, config override, then
/// `$XDG_DATA_HOME/spacedock` or `~/.local/share/spacedock`.
pub fn data_dir(config: &PathsConfig) -> PathBuf {
    if let Ok(dir) = std::env::var("SPACEDOCK_DATA_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(dir) = &config.data_dir {
        return dir.clone();
    }
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join(APP_DIR);
    }
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".local/share").join(APP_DIR),
        Err(_) => std::env::temp_dir().join(APP_DIR),
    }
}

pub fn cache_dir(config: &PathsConfig) -> PathBuf {
    data_dir(config).join("resume")
}

/// Base directory for user configuration.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join(APP_DIR);
    }
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".config").join(APP_DIR),
        Err(_) => std::env::temp_dir().join(APP_DIR),
    }
}

/// Socket directory: config override, then the surface crate's default
/// (`SPACEDOCK_RUNTIME_DIR` / `XDG_RUNTIME_DIR`).
pub fn runtime_dir(config: &PathsConfig) -> PathBuf {
    if std::env::var("SPACEDOCK_RUNTIME_DIR").is_err()
        && let Some(dir) = &config.runtime_dir
    {
        return dir.clone();
    }
    spacedock_surface::ipc::runtime_dir()
}

pub fn socket_path(config: &PathsConfig) -> PathBuf {
    runtime_dir(config).join(spacedock_surface::ipc::SOCKET_FILE)
}
