//! Bundle registry - the state-machine core.
//!
//! One entry per launcher bundle id; `Idle` is the absence of an entry.
//! Every transition replaces the whole entry in one step, so interleaved
//! handlers on the state thread never observe a half-updated bundle.
//! Leaving `Active` (or an in-flight `Loading`) stops every engine-side
//! handle synchronously; stop errors are logged and swallowed.

use std::collections::HashMap;

use spacedock_daemon::HealthTracker;

use super::watchers::WatcherEntry;
use super::{ClientId, LauncherBundleId, OpError, WatchId};
use crate::store::{DocumentStore, Manifest, WatchHandle};

/// A caller parked on an in-flight load; resolved at activation.
#[derive(Debug)]
pub struct LoadWaiter {
    pub client: ClientId,
    pub request_id: Option<String>,
    /// False for the caller that started the load; later callers are told
    /// the load was skipped.
    pub piggybacked: bool,
}

/// Link supervision phase of an Active bundle.
#[derive(Debug, Default)]
pub enum LinkPhase {
    #[default]
    Healthy,
    /// Between a connect attempt and its settle re-check.
    Reconnecting,
    /// Link is back; waiting for remote-origin traffic on the root before
    /// trusting directory listings again.
    Resync { probe: Option<WatchHandle> },
    /// Bounded retry exhausted; monitor parked until the next load.
    Failed,
}

pub struct LoadingState {
    pub store: Box<dyn DocumentStore>,
    pub manifest: Manifest,
    pub app_slug: String,
    pub ws_url: String,
    pub namespace: String,
    /// Raw bundle bytes, persisted to the durable cache at activation.
    pub bundle_bytes: Vec<u8>,
    /// Root-directory watcher waiting for the initial path-index sync.
    pub sync_probe: Option<WatchHandle>,
    pub waiters: Vec<LoadWaiter>,
    /// True when this load is the startup auto-resume.
    pub resumed: bool,
}

pub struct ActiveState {
    /// Content-addressed manifest root id.
    pub bundle_id: String,
    pub manifest: Manifest,
    pub app_slug: String,
    pub ws_url: String,
    pub namespace: String,
    pub store: Box<dyn DocumentStore>,
    pub watchers: HashMap<WatchId, WatcherEntry>,
    pub health: HealthTracker,
    pub link: LinkPhase,
}

pub enum BundleState {
    Loading(LoadingState),
    Active(ActiveState),
    Error {
        launcher_bundle_id: LauncherBundleId,
        error: String,
    },
}

impl BundleState {
    pub fn name(&self) -> &'static str {
        match self {
            BundleState::Loading(_) => "loading",
            BundleState::Active(_) => "active",
            BundleState::Error { .. } => "error",
        }
    }
}

/// What was torn down when an entry was replaced or removed.
pub struct RemovedState {
    pub was_active: bool,
    /// Load waiters that must receive a response from the caller.
    pub orphaned_waiters: Vec<LoadWaiter>,
}

#[derive(Default)]
pub struct BundleRegistry {
    entries: HashMap<LauncherBundleId, BundleState>,
}

impl BundleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &LauncherBundleId) -> Option<&BundleState> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &LauncherBundleId) -> Option<&mut BundleState> {
        self.entries.get_mut(id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &LauncherBundleId> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LauncherBundleId, &BundleState)> {
        self.entries.iter()
    }

    /// Install a new state, tearing down whatever it replaces.
    pub fn set(&mut self, id: LauncherBundleId, state: BundleState) -> Option<RemovedState> {
        let removed = self.entries.remove(&id).map(|old| cleanup(&id, old));
        self.entries.insert(id, state);
        removed
    }

    /// Remove an entry, tearing it down. `None` means nothing was there.
    pub fn remove(&mut self, id: &LauncherBundleId) -> Option<RemovedState> {
        self.entries.remove(id).map(|old| cleanup(id, old))
    }

    /// Pull an entry out without teardown; the caller re-inserts a successor
    /// state in the same handler (used for the Loading -> Active hop).
    pub fn take(&mut self, id: &LauncherBundleId) -> Option<BundleState> {
        self.entries.remove(id)
    }

    // === Active-only accessors ===
    //
    // All store access goes through these so a concurrent unload can never
    // leave a caller holding a freed instance.

    pub fn active(&self, id: &LauncherBundleId) -> Result<&ActiveState, OpError> {
        match self.entries.get(id) {
            Some(BundleState::Active(active)) => Ok(active),
            _ => Err(OpError::NotInitialized(id.clone())),
        }
    }

    pub fn active_mut(&mut self, id: &LauncherBundleId) -> Result<&mut ActiveState, OpError> {
        match self.entries.get_mut(id) {
            Some(BundleState::Active(active)) => Ok(active),
            _ => Err(OpError::NotInitialized(id.clone())),
        }
    }

    pub fn store(&self, id: &LauncherBundleId) -> Result<&dyn DocumentStore, OpError> {
        Ok(self.active(id)?.store.as_ref())
    }

    pub fn manifest(&self, id: &LauncherBundleId) -> Result<&Manifest, OpError> {
        Ok(&self.active(id)?.manifest)
    }

    pub fn watcher_count(&self, id: &LauncherBundleId) -> usize {
        self.active(id).map(|a| a.watchers.len()).unwrap_or(0)
    }
}

/// Stop every engine-side handle owned by a discarded state.
fn cleanup(id: &LauncherBundleId, state: BundleState) -> RemovedState {
    match state {
        BundleState::Active(mut active) => {
            for (watch_id, entry) in active.watchers.drain() {
                if let Err(err) = entry.handle.stop() {
                    tracing::warn!(bundle = %id, watch = %watch_id, "watcher stop failed: {err}");
                }
            }
            if let LinkPhase::Resync { probe: Some(probe) } = active.link
                && let Err(err) = probe.stop()
            {
                tracing::warn!(bundle = %id, "resync probe stop failed: {err}");
            }
            RemovedState {
                was_active: true,
                orphaned_waiters: Vec::new(),
            }
        }
        BundleState::Loading(loading) => {
            if let Some(probe) = loading.sync_probe
                && let Err(err) = probe.stop()
            {
                tracing::warn!(bundle = %id, "load sync probe stop failed: {err}");
            }
            RemovedState {
                was_active: false,
                orphaned_waiters: loading.waiters,
            }
        }
        BundleState::Error { .. } => RemovedState {
            was_active: false,
            orphaned_waiters: Vec::new(),
        },
    }
}
