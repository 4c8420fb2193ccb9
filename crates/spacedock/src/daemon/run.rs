//! Daemon bootstrap: socket hygiene, thread wiring, auto-resume.

use std::fs;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use super::cache::{CacheError, DurableCache};
use super::core::Daemon;
use super::server::{self, ServerEvent};
use crate::config::Config;
use crate::paths;
use crate::store::{MemoryEngine, StoreFactory};

/// A running daemon; join to wait for shutdown.
pub struct DaemonHandle {
    pub socket_path: PathBuf,
    shutdown: Arc<AtomicBool>,
    state_join: Option<JoinHandle<()>>,
    accept_join: Option<JoinHandle<()>>,
}

impl DaemonHandle {
    /// Block until the daemon stops (shutdown request or fatal error).
    pub fn join(mut self) {
        if let Some(join) = self.state_join.take() {
            let _ = join.join();
        }
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(join) = self.accept_join.take() {
            let _ = join.join();
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("socket setup failed at {path}: {source}")]
    Socket {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Run with the default config and the in-memory engine.
pub fn run_daemon() -> Result<DaemonHandle, RunError> {
    run_daemon_with(crate::config::load(), Arc::new(MemoryEngine::new()))
}

/// Run with an explicit config and engine.
pub fn run_daemon_with(
    config: Config,
    engine: Arc<dyn StoreFactory>,
) -> Result<DaemonHandle, RunError> {
    let socket_path = paths::socket_path(&config.paths);
    prepare_socket_dir(&socket_path)?;

    let cache = DurableCache::open(paths::cache_dir(&config.paths))?;

    let listener = UnixListener::bind(&socket_path).map_err(|source| RunError::Socket {
        path: socket_path.clone(),
        source,
    })?;
    tracing::info!(socket = %socket_path.display(), "daemon listening");

    let (event_tx, event_rx) = crossbeam::channel::unbounded::<ServerEvent>();
    let mut daemon = Daemon::new(config, engine, cache, event_tx.clone());

    // Reconstruct the last active bundle before serving clients, so an
    // early fetch parks on the in-flight recovery instead of failing.
    daemon.auto_resume();

    let shutdown = Arc::new(AtomicBool::new(false));
    let accept_shutdown = Arc::clone(&shutdown);
    let accept_join = thread::Builder::new()
        .name("spacedock-accept".to_string())
        .spawn(move || server::accept_loop(listener, event_tx, accept_shutdown))
        .expect("spawn acceptor thread");

    let state_join = thread::Builder::new()
        .name("spacedock-state".to_string())
        .spawn(move || server::run_state_loop(daemon, event_rx))
        .expect("spawn state thread");

    Ok(DaemonHandle {
        socket_path,
        shutdown,
        state_join: Some(state_join),
        accept_join: Some(accept_join),
    })
}

/// Create the runtime dir and clear a stale socket left by a dead daemon.
fn prepare_socket_dir(socket_path: &PathBuf) -> Result<(), RunError> {
    let err_at = |source| RunError::Socket {
        path: socket_path.clone(),
        source,
    };
    if let Some(dir) = socket_path.parent() {
        fs::create_dir_all(dir).map_err(err_at)?;
    }

    if socket_path.exists() {
        // A connectable socket means another daemon is live; refuse to
        // steal it. Anything else is stale and removed.
        match UnixStream::connect(socket_path) {
            Ok(_) => {
                return Err(err_at(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    "another daemon is already listening",
                )));
            }
            Err(_) => {
                tracing::warn!(socket = %socket_path.display(), "removing stale socket");
                fs::remove_file(socket_path).map_err(err_at)?;
            }
        }
    }
    Ok(())
}

