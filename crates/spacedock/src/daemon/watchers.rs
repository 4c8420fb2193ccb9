//! Watcher entries and per-bundle routing.
//!
//! A watcher belongs to the client that created it; only that client
//! receives its notifications. Entries die on explicit unwatch, when the
//! bundle leaves Active, or when delivery discovers the owner is gone - in
//! which case every watcher that client owned goes with it.

use super::registry::ActiveState;
use super::{ClientId, WatchId};
use crate::store::WatchHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchTargetKind {
    File,
    Directory,
}

pub struct WatcherEntry {
    pub watch_id: WatchId,
    pub kind: WatchTargetKind,
    pub path: String,
    pub handle: WatchHandle,
    pub owner: ClientId,
}

impl ActiveState {
    /// Register a watcher. The bundle is already Active by construction;
    /// callers go through the registry's Active-only accessor.
    pub fn add_watcher(&mut self, entry: WatcherEntry) {
        self.watchers.insert(entry.watch_id.clone(), entry);
    }

    /// Stop and drop one watcher. Returns false if the id was unknown.
    pub fn remove_watcher(&mut self, watch_id: &WatchId) -> bool {
        match self.watchers.remove(watch_id) {
            Some(entry) => {
                if let Err(err) = entry.handle.stop() {
                    tracing::warn!(watch = %watch_id, "watcher stop failed: {err}");
                }
                true
            }
            None => false,
        }
    }

    /// Purge every watcher owned by a vanished client. A dead client will
    /// never receive another notification, and leaving engine-side watchers
    /// running wastes resources indefinitely.
    pub fn remove_watchers_by_client(&mut self, client: ClientId) -> usize {
        let doomed: Vec<WatchId> = self
            .watchers
            .values()
            .filter(|entry| entry.owner == client)
            .map(|entry| entry.watch_id.clone())
            .collect();
        for watch_id in &doomed {
            self.remove_watcher(watch_id);
        }
        doomed.len()
    }
}
