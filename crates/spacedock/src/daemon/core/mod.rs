//! Daemon core - the central coordinator.
//!
//! Owns the bundle registry, client table, timers, and the durable cache.
//! The serialization point for all state transitions - runs on a single
//! thread; everything else shuttles events in.

mod handlers;
mod load;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;

use spacedock_daemon::DeadlineQueue;
use spacedock_surface::ipc::{Notification, Response};

use super::cache::DurableCache;
use super::fetch::ResolvedPath;
use super::registry::BundleRegistry;
use super::server::{Outbound, ServerEvent};
use super::{ClientId, LauncherBundleId, TimerKey, WatchSignal, WatchSink};
use crate::config::Config;
use crate::daemon::watchers::WatchTargetKind;
use crate::store::StoreFactory;

/// A fetch parked on an in-flight load or restart recovery.
pub(crate) struct FetchWaiter {
    pub client: ClientId,
    pub request_id: Option<String>,
    pub bundle: LauncherBundleId,
    pub resolved: ResolvedPath,
    pub deadline: Instant,
}

pub struct Daemon {
    pub(crate) config: Config,
    pub(crate) engine: Arc<dyn StoreFactory>,
    pub(crate) registry: BundleRegistry,
    pub(crate) cache: DurableCache,
    pub(crate) timers: DeadlineQueue<TimerKey>,
    pub(crate) clients: HashMap<ClientId, Sender<Outbound>>,
    pub(crate) fetch_waiters: Vec<FetchWaiter>,
    /// Feeds store watch callbacks back onto the state thread.
    pub(crate) event_tx: Sender<ServerEvent>,
    pub(crate) needs_reinit: bool,
    pub(crate) resumed_bundle: Option<String>,
    shutdown: bool,
}

impl Daemon {
    pub fn new(
        config: Config,
        engine: Arc<dyn StoreFactory>,
        cache: DurableCache,
        event_tx: Sender<ServerEvent>,
    ) -> Self {
        Self {
            config,
            engine,
            registry: BundleRegistry::new(),
            cache,
            timers: DeadlineQueue::new(),
            clients: HashMap::new(),
            fetch_waiters: Vec::new(),
            event_tx,
            needs_reinit: false,
            resumed_bundle: None,
            shutdown: false,
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown
    }

    pub(crate) fn request_shutdown(&mut self) {
        self.shutdown = true;
    }

    // =========================================================================
    // Event loop surface
    // =========================================================================

    pub fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Connected { client, tx } => {
                tracing::debug!(client = %client, "client connected");
                self.clients.insert(client, tx);
                // First frame on every connection: the daemon is up.
                self.send_to(client, Outbound::Notification(Notification::Ready {}));
            }
            ServerEvent::Request { client, request } => {
                let info = request.info();
                let span = tracing::info_span!(
                    "request",
                    op = info.op,
                    bundle = info.launcher_bundle_id.unwrap_or("-")
                );
                let _guard = span.enter();
                self.handle_request(client, request);
            }
            ServerEvent::Disconnected { client } => {
                tracing::debug!(client = %client, "client disconnected");
                self.purge_client(client);
            }
            ServerEvent::Watch(signal) => self.deliver_watch(signal),
        }
    }

    /// Earliest pending deadline across timers and parked fetches.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        let timer = self.timers.next_deadline();
        let fetch = self.fetch_waiters.iter().map(|w| w.deadline).min();
        match (timer, fetch) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fire everything due at `now`.
    pub fn handle_due(&mut self, now: Instant) {
        for key in self.timers.drain_due(now) {
            self.handle_timer(key);
        }
        self.expire_fetch_waiters(now);
    }

    pub(crate) fn schedule_in(&mut self, key: TimerKey, delay: Duration) {
        self.timers.schedule(key, Instant::now() + delay);
    }

    // =========================================================================
    // Client table
    // =========================================================================

    pub(crate) fn respond(&mut self, client: ClientId, response: Response) {
        self.send_to(client, Outbound::Response(response));
    }

    pub(crate) fn send_to(&mut self, client: ClientId, message: Outbound) {
        let delivered = match self.clients.get(&client) {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        };
        if !delivered {
            self.purge_client(client);
        }
    }

    /// Broadcast a lifecycle notice to every connected client.
    pub(crate) fn broadcast(&mut self, notification: Notification) {
        let dead: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, tx)| {
                tx.send(Outbound::Notification(notification.clone())).is_err()
            })
            .map(|(id, _)| *id)
            .collect();
        for client in dead {
            self.purge_client(client);
        }
    }

    /// Forget a client and stop every watcher it owned, in every bundle.
    pub(crate) fn purge_client(&mut self, client: ClientId) {
        self.clients.remove(&client);
        let bundles: Vec<LauncherBundleId> = self.registry.ids().cloned().collect();
        for bundle in bundles {
            if let Ok(active) = self.registry.active_mut(&bundle) {
                let purged = active.remove_watchers_by_client(client);
                if purged > 0 {
                    tracing::debug!(
                        client = %client,
                        bundle = %bundle,
                        purged,
                        "purged watchers of vanished client"
                    );
                }
            }
        }
        self.fetch_waiters.retain(|w| w.client != client);
    }

    // =========================================================================
    // Watch delivery
    // =========================================================================

    /// Route a store change callback. Signals for bundles or watchers that
    /// are gone are discarded silently: stops race in-flight callbacks by
    /// design of the engine interface.
    fn deliver_watch(&mut self, signal: WatchSignal) {
        match signal.sink {
            WatchSink::SyncProbe => self.handle_sync_probe(signal.bundle, signal.event),
            WatchSink::Client { watch_id } => {
                let Ok(active) = self.registry.active(&signal.bundle) else {
                    return;
                };
                let Some(entry) = active.watchers.get(&watch_id) else {
                    return;
                };
                let owner = entry.owner;
                let origin = crate::daemon::core::handlers::origin_wire(signal.event.origin);
                let notification = match entry.kind {
                    WatchTargetKind::File => Notification::FileChanged {
                        launcher_bundle_id: signal.bundle.to_string(),
                        watch_id: watch_id.to_string(),
                        path: signal.event.path.clone(),
                        origin,
                    },
                    WatchTargetKind::Directory => Notification::DirectoryChanged {
                        launcher_bundle_id: signal.bundle.to_string(),
                        watch_id: watch_id.to_string(),
                        path: signal.event.path.clone(),
                        origin,
                    },
                };

                // Resolve the owner against the live client table at
                // delivery time; registration-time liveness proves nothing.
                let delivered = match self.clients.get(&owner) {
                    Some(tx) => tx.send(Outbound::Notification(notification)).is_ok(),
                    None => false,
                };
                if !delivered {
                    tracing::debug!(
                        client = %owner,
                        bundle = %signal.bundle,
                        "watch delivery found dead client"
                    );
                    self.purge_client(owner);
                }
            }
        }
    }
}
