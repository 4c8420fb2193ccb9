//! Daemon module - the spacedock service.
//!
//! Provides:
//! - Bundle registry and lifecycle (load, unload, resume)
//! - Per-bundle connection monitoring with backoff
//! - Watcher routing back to the registering client
//! - Fetch serving for `/<scope>/<bundle>/<app>/...` paths
//! - IPC over Unix socket
//! - Durable resume cache

pub mod cache;
pub mod core;
pub mod fetch;
pub mod monitor;
pub mod ops;
pub mod registry;
pub mod run;
pub mod server;
pub mod watchers;

use std::fmt;

use uuid::Uuid;

use crate::store::ChangeEvent;

pub use self::core::Daemon;
pub use ops::OpError;
pub use registry::{BundleRegistry, BundleState};
pub use run::{DaemonHandle, run_daemon, run_daemon_with};

/// Stable identifier namespacing a bundle's storage and registry entry.
/// Distinct from the content-addressed manifest root id.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LauncherBundleId(String);

impl LauncherBundleId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for LauncherBundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LauncherBundleId({:?})", self.0)
    }
}

impl fmt::Display for LauncherBundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One connected page client.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one live watch subscription.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(String);

impl WatchId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WatchId({:?})", self.0)
    }
}

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timer identities multiplexed through the state loop's deadline queue.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKey {
    /// Periodic `is_connected` poll for an Active bundle.
    HealthTick(LauncherBundleId),
    /// Next reconnect attempt after backoff.
    ReconnectProbe(LauncherBundleId),
    /// Re-check the link after the post-connect settle delay.
    SettleCheck(LauncherBundleId),
    /// Give up waiting for remote traffic after a reconnect.
    ResyncDeadline(LauncherBundleId),
    /// Give up waiting for the initial path-index sync during load.
    LoadSyncDeadline(LauncherBundleId),
}

impl TimerKey {
    pub fn bundle(&self) -> &LauncherBundleId {
        match self {
            TimerKey::HealthTick(id)
            | TimerKey::ReconnectProbe(id)
            | TimerKey::SettleCheck(id)
            | TimerKey::ResyncDeadline(id)
            | TimerKey::LoadSyncDeadline(id) => id,
        }
    }
}

/// Which consumer a store change callback feeds.
#[derive(Clone, Debug)]
pub enum WatchSink {
    /// A client-registered watcher.
    Client { watch_id: WatchId },
    /// The root-directory probe waiting for remote-origin traffic
    /// (initial load sync or post-reconnect resync).
    SyncProbe,
}

/// A store change callback, rehomed onto the state thread.
#[derive(Clone, Debug)]
pub struct WatchSignal {
    pub bundle: LauncherBundleId,
    pub sink: WatchSink,
    pub event: ChangeEvent,
}
