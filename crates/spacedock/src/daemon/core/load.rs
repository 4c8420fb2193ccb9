//! Bundle lifecycle: load, activate, unload, auto-resume.

use std::time::Instant;

use spacedock_daemon::HealthTracker;
use spacedock_surface::ipc::{Notification, Response, ResponseData};
use uuid::Uuid;

use super::Daemon;
use crate::daemon::cache::ResumeRecord;
use crate::daemon::ops::OpError;
use crate::daemon::registry::{
    ActiveState, BundleState, LinkPhase, LoadWaiter, LoadingState, RemovedState,
};
use crate::daemon::server::ServerEvent;
use crate::daemon::{ClientId, LauncherBundleId, TimerKey, WatchSignal, WatchSink};
use crate::store::{Manifest, StoreConfig};

const LOAD_OP: &str = "loadBundle";

/// Inputs for one load attempt. Resume reuses the persisted namespace and
/// app slug; fresh loads generate an isolated namespace.
pub(crate) struct LoadPlan {
    pub bundle_bytes: Vec<u8>,
    pub server_url_override: Option<String>,
    pub cached_manifest: Option<Manifest>,
    pub namespace: Option<String>,
    pub app_slug: Option<String>,
    pub resumed: bool,
}

impl Daemon {
    /// Entry point for a `loadBundle` request.
    pub(crate) fn handle_load_bundle(
        &mut self,
        client: ClientId,
        request_id: Option<String>,
        launcher: LauncherBundleId,
        plan: LoadPlan,
    ) {
        match self.registry.get_mut(&launcher) {
            // Already operational: short-circuit as a skipped success.
            Some(BundleState::Active(_)) => {
                self.respond(
                    client,
                    Response::ok(LOAD_OP, request_id, ResponseData::Loaded { skipped: true }),
                );
            }
            // A load is in flight: park on it rather than starting a second.
            Some(BundleState::Loading(loading)) => {
                loading.waiters.push(LoadWaiter {
                    client,
                    request_id,
                    piggybacked: true,
                });
            }
            // Idle or a previous failure: a fresh attempt.
            Some(BundleState::Error { .. }) | None => {
                let waiter = LoadWaiter {
                    client,
                    request_id,
                    piggybacked: false,
                };
                self.start_load(launcher, plan, Some(waiter));
            }
        }
    }

    /// Begin a load: instantiate the store, connect, and wait (bounded) for
    /// the initial path-index sync before activation.
    pub(crate) fn start_load(
        &mut self,
        launcher: LauncherBundleId,
        plan: LoadPlan,
        waiter: Option<LoadWaiter>,
    ) {
        let resumed = plan.resumed;
        match self.try_begin_load(&launcher, plan) {
            Ok(mut loading) => {
                loading.waiters.extend(waiter);
                let timeout = self.config.connection.pathindex_sync_timeout();
                self.registry
                    .set(launcher.clone(), BundleState::Loading(loading));
                self.schedule_in(TimerKey::LoadSyncDeadline(launcher), timeout);
            }
            Err(err) => self.fail_load(launcher, err, waiter, resumed),
        }
    }

    fn try_begin_load(
        &mut self,
        launcher: &LauncherBundleId,
        plan: LoadPlan,
    ) -> Result<LoadingState, OpError> {
        let LoadPlan {
            bundle_bytes,
            server_url_override,
            cached_manifest,
            namespace,
            app_slug,
            resumed,
        } = plan;

        let load_failed = |reason: String| OpError::LoadFailed {
            bundle: launcher.clone(),
            reason,
        };

        let namespace = namespace
            .unwrap_or_else(|| format!("{launcher}-{}", Uuid::new_v4().simple()));
        let store = self
            .engine
            .from_bytes(&bundle_bytes, &StoreConfig {
                namespace: namespace.clone(),
            })
            .map_err(|e| load_failed(e.to_string()))?;

        let manifest = match cached_manifest {
            Some(manifest) => manifest,
            None => store
                .manifest()
                .map_err(|e| load_failed(format!("manifest unavailable: {e}")))?,
        };

        let app_slug = app_slug
            .or_else(|| manifest.default_app_slug().map(str::to_string))
            .ok_or_else(|| load_failed("manifest declares no entrypoints".to_string()))?;

        // Endpoint priority: explicit override > manifest > configured default.
        let ws_url = server_url_override
            .or_else(|| manifest.sync_endpoints.first().cloned())
            .or_else(|| self.config.server_url.clone())
            .ok_or_else(|| load_failed("no sync endpoint available".to_string()))?;

        store
            .connect_websocket(&ws_url)
            .map_err(|e| OpError::Connection {
                bundle: launcher.clone(),
                reason: e.to_string(),
            })?;

        // Root-directory probe: the first remote-origin change marks the
        // path index synchronized. Absence of one within the window is
        // indistinguishable from "nothing to send"; the deadline resolves it.
        let probe_tx = self.event_tx.clone();
        let probe_bundle = launcher.clone();
        let sync_probe = store
            .watch_directory(
                "/",
                Box::new(move |event| {
                    let _ = probe_tx.send(ServerEvent::Watch(WatchSignal {
                        bundle: probe_bundle.clone(),
                        sink: WatchSink::SyncProbe,
                        event,
                    }));
                }),
            )
            .map_err(|e| OpError::store("watchDirectory", "/", e))?;

        tracing::info!(bundle = %launcher, namespace = %namespace, ws = %ws_url, "bundle loading");
        Ok(LoadingState {
            store,
            manifest,
            app_slug,
            ws_url,
            namespace,
            bundle_bytes,
            sync_probe: Some(sync_probe),
            waiters: Vec::new(),
            resumed,
        })
    }

    /// Loading -> Active. Fired by the sync probe's first remote-origin
    /// change, or by the bounded deadline.
    pub(crate) fn activate_bundle(&mut self, launcher: LauncherBundleId) {
        let Some(BundleState::Loading(loading)) = self.registry.take(&launcher) else {
            return;
        };
        self.timers
            .cancel(&TimerKey::LoadSyncDeadline(launcher.clone()));

        if let Some(probe) = loading.sync_probe
            && let Err(err) = probe.stop()
        {
            tracing::warn!(bundle = %launcher, "load sync probe stop failed: {err}");
        }

        let connection = &self.config.connection;
        let active = ActiveState {
            bundle_id: loading.manifest.root_id.clone(),
            manifest: loading.manifest,
            app_slug: loading.app_slug.clone(),
            ws_url: loading.ws_url.clone(),
            namespace: loading.namespace.clone(),
            store: loading.store,
            watchers: Default::default(),
            health: HealthTracker::new(
                connection.backoff(),
                connection.retry_policy(),
                connection.max_reconnect_attempts,
            ),
            link: LinkPhase::Healthy,
        };

        let record = ResumeRecord {
            launcher_bundle_id: launcher.to_string(),
            app_slug: loading.app_slug,
            ws_url: loading.ws_url,
            namespace: loading.namespace,
            bundle_bytes: loading.bundle_bytes,
        };

        self.registry
            .set(launcher.clone(), BundleState::Active(active));
        self.schedule_in(
            TimerKey::HealthTick(launcher.clone()),
            self.config.connection.health_check_interval(),
        );

        // Durable record is written only after the in-memory transition.
        if let Err(err) = self.cache.store_record(&record) {
            tracing::warn!(bundle = %launcher, "resume record write failed: {err}");
        }

        if loading.resumed {
            self.resumed_bundle = Some(launcher.to_string());
            self.needs_reinit = false;
        }
        tracing::info!(bundle = %launcher, "bundle active");

        for waiter in loading.waiters {
            self.respond(
                waiter.client,
                Response::ok(LOAD_OP, waiter.request_id, ResponseData::Loaded {
                    skipped: waiter.piggybacked,
                }),
            );
        }
        self.serve_parked_fetches(&launcher);
    }

    /// Loading -> Error.
    pub(crate) fn fail_load(
        &mut self,
        launcher: LauncherBundleId,
        err: OpError,
        waiter: Option<LoadWaiter>,
        resumed: bool,
    ) {
        tracing::warn!(bundle = %launcher, "bundle load failed: {err}");
        self.timers
            .cancel_where(|key| key.bundle() == &launcher);

        let payload = err.into_error_payload();
        let removed = self.registry.set(launcher.clone(), BundleState::Error {
            launcher_bundle_id: launcher.clone(),
            error: payload.message.clone(),
        });

        let mut waiters = waiter.into_iter().collect::<Vec<_>>();
        if let Some(RemovedState {
            orphaned_waiters, ..
        }) = removed
        {
            waiters.extend(orphaned_waiters);
        }
        for waiter in waiters {
            self.respond(
                waiter.client,
                Response::err(LOAD_OP, waiter.request_id, payload.clone()),
            );
        }
        self.fail_parked_fetches(&launcher, &payload.message);

        if resumed {
            self.cache.clear();
            self.needs_reinit = true;
            self.broadcast(Notification::NeedsReinit {
                reason: Some(payload.message),
            });
        }
    }

    /// Unload: cascades monitor/watcher teardown through the registry, and
    /// clears the durable record once nothing remains loaded.
    pub(crate) fn handle_unload(&mut self, launcher: &LauncherBundleId) {
        let removed = self.registry.remove(launcher);
        self.timers.cancel_where(|key| key.bundle() == launcher);

        if let Some(RemovedState {
            orphaned_waiters, ..
        }) = removed
        {
            let payload = OpError::LoadFailed {
                bundle: launcher.clone(),
                reason: "bundle unloaded while loading".to_string(),
            }
            .into_error_payload();
            for waiter in orphaned_waiters {
                self.respond(
                    waiter.client,
                    Response::err(LOAD_OP, waiter.request_id, payload.clone()),
                );
            }
            tracing::info!(bundle = %launcher, "bundle unloaded");
        }
        self.fail_parked_fetches(launcher, "bundle unloaded");

        if self.registry.is_empty() {
            self.cache.clear();
        }
    }

    /// Runs once at startup: reconstruct the last active bundle from the
    /// durable cache. Any failure resets to clean idle and tells clients to
    /// re-initiate, rather than silently serving nothing.
    pub(crate) fn auto_resume(&mut self) {
        match self.cache.load_record() {
            Ok(None) => {}
            Ok(Some(record)) => {
                tracing::info!(
                    bundle = %record.launcher_bundle_id,
                    "resuming last active bundle from cache"
                );
                let launcher = LauncherBundleId::new(record.launcher_bundle_id.clone());
                self.start_load(
                    launcher,
                    LoadPlan {
                        bundle_bytes: record.bundle_bytes,
                        server_url_override: Some(record.ws_url),
                        cached_manifest: None,
                        namespace: Some(record.namespace),
                        app_slug: Some(record.app_slug),
                        resumed: true,
                    },
                    None,
                );
            }
            Err(err) => {
                tracing::warn!("resume cache unreadable, resetting: {err}");
                self.cache.clear();
                self.needs_reinit = true;
                self.broadcast(Notification::NeedsReinit {
                    reason: Some(err.to_string()),
                });
            }
        }
    }

    // =========================================================================
    // Parked fetches
    // =========================================================================

    pub(crate) fn serve_parked_fetches(&mut self, launcher: &LauncherBundleId) {
        let (ready, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.fetch_waiters)
            .into_iter()
            .partition(|w| &w.bundle == launcher);
        self.fetch_waiters = rest;
        for waiter in ready {
            let payload = self.serve_fetch(&waiter.bundle, &waiter.resolved);
            self.respond(
                waiter.client,
                Response::ok("fetch", waiter.request_id, ResponseData::Fetched(payload)),
            );
        }
    }

    pub(crate) fn fail_parked_fetches(&mut self, launcher: &LauncherBundleId, reason: &str) {
        let (doomed, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.fetch_waiters)
            .into_iter()
            .partition(|w| &w.bundle == launcher);
        self.fetch_waiters = rest;
        for waiter in doomed {
            let payload = self.fetch_error_payload(&waiter.resolved, 503, reason);
            self.respond(
                waiter.client,
                Response::ok("fetch", waiter.request_id, ResponseData::Fetched(payload)),
            );
        }
    }

    pub(crate) fn expire_fetch_waiters(&mut self, now: Instant) {
        let (expired, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.fetch_waiters)
            .into_iter()
            .partition(|w| w.deadline <= now);
        self.fetch_waiters = rest;
        for waiter in expired {
            let waited = self.config.fetch.recovery_timeout_ms;
            let payload = self.fetch_error_payload(
                &waiter.resolved,
                504,
                &format!("bundle not active after {waited}ms"),
            );
            self.respond(
                waiter.client,
                Response::ok("fetch", waiter.request_id, ResponseData::Fetched(payload)),
            );
        }
    }
}
