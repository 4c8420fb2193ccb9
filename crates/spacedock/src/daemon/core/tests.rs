//! Daemon-level scenario tests, driven through the event surface without
//! sockets. Timers are exercised by draining everything due at a far-future
//! instant: each `fire` advances exactly one monitor phase, because keys
//! scheduled while handling a batch wait for the next drain.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, unbounded};
use tempfile::TempDir;

use spacedock_surface::ipc::{
    BundleCtx, Ctx, Notification, Request, Response, ResponseData, WriteMode,
};

use super::Daemon;
use crate::config::Config;
use crate::daemon::cache::DurableCache;
use crate::daemon::registry::BundleState;
use crate::daemon::server::{Outbound, ServerEvent};
use crate::daemon::{ClientId, LauncherBundleId};
use crate::store::memory::{MemoryEngine, StoreControl, bundle_bytes};
use crate::{daemon::TimerKey, paths};

const BUNDLE: &str = "b1";

struct Harness {
    daemon: Daemon,
    event_rx: Receiver<ServerEvent>,
    engine: Arc<MemoryEngine>,
    _data_dir: TempDir,
}

fn fast_config(data_dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.paths.data_dir = Some(data_dir.path().to_path_buf());
    config.server_url = Some("wss://sync.example/default".to_string());
    let c = &mut config.connection;
    c.health_check_interval_ms = 5;
    c.settle_ms = 5;
    c.reconnect_base_ms = 5;
    c.reconnect_cap_ms = 20;
    c.pathindex_sync_timeout_ms = 5;
    config.fetch.recovery_timeout_ms = 100;
    config
}

impl Harness {
    fn new() -> Self {
        Self::with_config_mut(|_| {})
    }

    fn with_config_mut(tweak: impl FnOnce(&mut Config)) -> Self {
        let data_dir = TempDir::new().expect("tempdir");
        let mut config = fast_config(&data_dir);
        tweak(&mut config);
        let cache = DurableCache::open(paths::cache_dir(&config.paths)).expect("cache");
        let engine = Arc::new(MemoryEngine::new());
        let factory: Arc<dyn crate::store::StoreFactory> = engine.clone();
        let (event_tx, event_rx) = unbounded();
        let daemon = Daemon::new(config, factory, cache, event_tx);
        Self {
            daemon,
            event_rx,
            engine,
            _data_dir: data_dir,
        }
    }

    fn client(&mut self) -> (ClientId, Receiver<Outbound>) {
        let client = ClientId::new();
        let (tx, rx) = unbounded();
        self.daemon.handle_event(ServerEvent::Connected { client, tx });
        // First frame is always the ready notice.
        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(Outbound::Notification(Notification::Ready {})) => {}
            other => panic!("expected ready, got {other:?}"),
        }
        (client, rx)
    }

    fn request(&mut self, client: ClientId, request: Request) {
        self.daemon.handle_event(ServerEvent::Request { client, request });
    }

    /// Rehome queued watch callbacks (and any other events) onto the daemon.
    fn pump(&mut self) {
        while let Ok(event) = self.event_rx.try_recv() {
            self.daemon.handle_event(event);
        }
    }

    /// Fire everything currently due; one call per monitor phase.
    fn fire(&mut self) {
        self.daemon
            .handle_due(Instant::now() + Duration::from_secs(3600));
        self.pump();
    }

    fn load_request(&mut self, client: ClientId, id: &str) {
        let bytes = bundle_bytes(
            &["app1"],
            &["wss://sync.example/b1"],
            &[
                ("/app1/index.html", "<html>shell</html>"),
                ("/app1/notes.txt", "hello"),
            ],
        );
        self.request(client, Request::LoadBundle {
            ctx: bundle_ctx(id),
            bundle_bytes_hex: hex::encode(bytes),
            server_url: None,
            manifest: None,
        });
    }

    /// Load and activate a bundle via the sync deadline.
    fn load_active(&mut self, client: ClientId, id: &str) {
        self.load_request(client, id);
        self.fire();
        assert!(
            matches!(
                self.daemon.registry.get(&LauncherBundleId::new(id)),
                Some(BundleState::Active(_))
            ),
            "bundle should be active after sync deadline"
        );
    }

    fn control(&self) -> StoreControl {
        self.engine.last_control().expect("a store was created")
    }
}

fn bundle_ctx(id: &str) -> BundleCtx {
    BundleCtx {
        ctx: Ctx { id: Some("1".into()) },
        launcher_bundle_id: id.to_string(),
    }
}

fn next_response(rx: &Receiver<Outbound>) -> Response {
    loop {
        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(Outbound::Response(response)) => return response,
            Ok(Outbound::Notification(_)) => continue,
            Err(e) => panic!("no response: {e}"),
        }
    }
}

fn drain_notifications(rx: &Receiver<Outbound>) -> Vec<Notification> {
    let mut notifications = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if let Outbound::Notification(notification) = message {
            notifications.push(notification);
        }
    }
    notifications
}

// =============================================================================
// Load lifecycle
// =============================================================================

#[test]
fn load_activates_on_sync_deadline_and_persists() {
    let mut h = Harness::new();
    let (client, rx) = h.client();

    h.load_request(client, BUNDLE);
    assert!(matches!(
        h.daemon.registry.get(&LauncherBundleId::new(BUNDLE)),
        Some(BundleState::Loading(_))
    ));

    h.fire();
    let response = next_response(&rx);
    assert!(response.success);
    assert!(matches!(
        response.data,
        Some(ResponseData::Loaded { skipped: false })
    ));

    let record = h.daemon.cache.load_record().expect("cache").expect("record");
    assert_eq!(record.launcher_bundle_id, BUNDLE);
    assert_eq!(record.app_slug, "app1");
    assert_eq!(record.ws_url, "wss://sync.example/b1");
}

#[test]
fn load_activates_on_remote_traffic_before_deadline() {
    let mut h = Harness::new();
    let (client, rx) = h.client();

    h.load_request(client, BUNDLE);
    h.control().emit_remote_change("/app1/notes.txt");
    h.pump();

    assert!(matches!(
        h.daemon.registry.get(&LauncherBundleId::new(BUNDLE)),
        Some(BundleState::Active(_))
    ));
    assert!(next_response(&rx).success);
}

#[test]
fn concurrent_loads_share_one_store_instantiation() {
    let mut h = Harness::new();
    let (first, first_rx) = h.client();
    let (second, second_rx) = h.client();

    h.load_request(first, BUNDLE);
    h.load_request(second, BUNDLE);
    h.fire();

    assert!(matches!(
        next_response(&first_rx).data,
        Some(ResponseData::Loaded { skipped: false })
    ));
    assert!(matches!(
        next_response(&second_rx).data,
        Some(ResponseData::Loaded { skipped: true })
    ));
    // Exactly one engine-side instantiation.
    assert_eq!(h.engine.controls().len(), 1);
}

#[test]
fn load_when_active_is_a_skipped_success() {
    let mut h = Harness::new();
    let (client, rx) = h.client();
    h.load_active(client, BUNDLE);
    let _ = next_response(&rx);

    h.load_request(client, BUNDLE);
    assert!(matches!(
        next_response(&rx).data,
        Some(ResponseData::Loaded { skipped: true })
    ));
    assert_eq!(h.engine.controls().len(), 1);
}

#[test]
fn endpoint_priority_prefers_explicit_override() {
    let mut h = Harness::new();
    let (client, rx) = h.client();

    let bytes = bundle_bytes(&["app1"], &["wss://manifest.example"], &[(
        "/app1/index.html",
        "<html/>",
    )]);
    h.request(client, Request::LoadBundle {
        ctx: bundle_ctx(BUNDLE),
        bundle_bytes_hex: hex::encode(bytes),
        server_url: Some("wss://override.example".to_string()),
        manifest: None,
    });
    h.fire();
    assert!(next_response(&rx).success);
    assert_eq!(
        h.control().connected_url().as_deref(),
        Some("wss://override.example")
    );
}

#[test]
fn endpoint_priority_falls_back_to_manifest_then_default() {
    let mut h = Harness::new();
    let (client, rx) = h.client();

    // Manifest endpoint wins over the configured default.
    h.load_request(client, BUNDLE);
    h.fire();
    assert!(next_response(&rx).success);
    assert_eq!(
        h.control().connected_url().as_deref(),
        Some("wss://sync.example/b1")
    );

    // No manifest endpoint: the configured default applies.
    let bytes = bundle_bytes(&["app2"], &[], &[("/app2/index.html", "<html/>")]);
    h.request(client, Request::LoadBundle {
        ctx: bundle_ctx("b2"),
        bundle_bytes_hex: hex::encode(bytes),
        server_url: None,
        manifest: None,
    });
    h.fire();
    assert!(next_response(&rx).success);
    assert_eq!(
        h.control().connected_url().as_deref(),
        Some("wss://sync.example/default")
    );
}

#[test]
fn invalid_bundle_bytes_yield_typed_error() {
    let mut h = Harness::new();
    let (client, rx) = h.client();

    h.request(client, Request::LoadBundle {
        ctx: bundle_ctx(BUNDLE),
        bundle_bytes_hex: hex::encode(b"not json"),
        server_url: None,
        manifest: None,
    });
    let response = next_response(&rx);
    assert!(!response.success);
    let error = response.error.expect("error payload");
    assert_eq!(
        error.code,
        spacedock_surface::ipc::ErrorCode::BundleLoadFailed
    );

    // A later retry may succeed from the Error state.
    h.load_request(client, BUNDLE);
    h.fire();
    assert!(next_response(&rx).success);
}

#[test]
fn unload_stops_watchers_timers_and_clears_cache() {
    let mut h = Harness::new();
    let (client, rx) = h.client();
    h.load_active(client, BUNDLE);
    let _ = next_response(&rx);

    h.request(client, Request::WatchFile {
        ctx: bundle_ctx(BUNDLE),
        path: "/app1/notes.txt".to_string(),
    });
    assert!(next_response(&rx).success);
    let control = h.control();
    assert_eq!(control.watcher_count(), 1);

    h.request(client, Request::UnloadBundle {
        ctx: bundle_ctx(BUNDLE),
    });
    assert!(next_response(&rx).success);

    // No registry entry, no engine-side watcher, no pending timer, no record.
    assert!(h.daemon.registry.get(&LauncherBundleId::new(BUNDLE)).is_none());
    assert_eq!(control.watcher_count(), 0);
    let bundle = LauncherBundleId::new(BUNDLE);
    assert!(!h.daemon.timers.is_pending(&TimerKey::HealthTick(bundle.clone())));
    assert!(h.daemon.cache.load_record().expect("cache").is_none());

    // Further engine callbacks after teardown go nowhere.
    control.emit_remote_change("/app1/notes.txt");
    h.pump();
    assert!(drain_notifications(&rx).is_empty());
}

// =============================================================================
// Restart resume
// =============================================================================

#[test]
fn restart_resume_restores_same_bundle_root() {
    let data_dir = TempDir::new().expect("tempdir");

    let root_id = {
        let mut h = Harness::with_config_mut(|config| {
            config.paths.data_dir = Some(data_dir.path().to_path_buf());
        });
        let (client, rx) = h.client();
        h.load_active(client, BUNDLE);
        let _ = next_response(&rx);
        h.daemon
            .registry
            .manifest(&LauncherBundleId::new(BUNDLE))
            .expect("manifest")
            .root_id
            .clone()
    };

    // A fresh daemon over the same data dir simulates a worker restart.
    let mut h = Harness::with_config_mut(|config| {
        config.paths.data_dir = Some(data_dir.path().to_path_buf());
    });
    h.daemon.auto_resume();
    h.fire();

    let manifest = h
        .daemon
        .registry
        .manifest(&LauncherBundleId::new(BUNDLE))
        .expect("resumed bundle active");
    assert_eq!(manifest.root_id, root_id);
    assert!(!h.daemon.needs_reinit);
}

#[test]
fn corrupt_resume_cache_resets_and_requests_reinit() {
    let data_dir = TempDir::new().expect("tempdir");

    {
        let mut h = Harness::with_config_mut(|config| {
            config.paths.data_dir = Some(data_dir.path().to_path_buf());
        });
        let (client, rx) = h.client();
        h.load_active(client, BUNDLE);
        let _ = next_response(&rx);
    }

    // Tamper with the persisted bundle bytes.
    let cache_file = paths::cache_dir(&crate::config::PathsConfig {
        data_dir: Some(data_dir.path().to_path_buf()),
        runtime_dir: None,
    })
    .join(crate::daemon::cache::KEY_BUNDLE_BYTES);
    std::fs::write(&cache_file, b"garbage").expect("tamper");

    let mut h = Harness::with_config_mut(|config| {
        config.paths.data_dir = Some(data_dir.path().to_path_buf());
    });
    let (_client, rx) = h.client();
    h.daemon.auto_resume();

    assert!(h.daemon.needs_reinit);
    assert!(h.daemon.cache.load_record().expect("cache").is_none());
    assert!(
        drain_notifications(&rx)
            .iter()
            .any(|n| matches!(n, Notification::NeedsReinit { .. }))
    );
}

// =============================================================================
// Fetch
// =============================================================================

fn fetch(h: &mut Harness, client: ClientId, url: &str) {
    h.request(client, Request::Fetch {
        ctx: Ctx { id: Some("9".into()) },
        url: url.to_string(),
        upgrade: None,
    });
}

fn fetched(response: &Response) -> &spacedock_surface::ipc::FetchPayload {
    match &response.data {
        Some(ResponseData::Fetched(payload)) => payload,
        other => panic!("expected fetch payload, got {other:?}"),
    }
}

#[test]
fn fetch_serves_existing_file_with_content_type() {
    let mut h = Harness::new();
    let (client, rx) = h.client();
    h.load_active(client, BUNDLE);
    let _ = next_response(&rx);

    fetch(&mut h, client, "/space/b1/app1/notes.txt");
    let response = next_response(&rx);
    let payload = fetched(&response);
    assert_eq!(payload.status, 200);
    assert_eq!(
        payload.content_type.as_deref(),
        Some("text/plain; charset=utf-8")
    );
    let body = hex::decode(payload.body_hex.as_ref().expect("body")).expect("hex");
    assert_eq!(body, b"hello");
}

#[test]
fn fetch_missing_file_falls_back_to_index_html() {
    let mut h = Harness::new();
    let (client, rx) = h.client();
    h.load_active(client, BUNDLE);
    let _ = next_response(&rx);

    fetch(&mut h, client, "/space/b1/app1/deep/route/view");
    let response = next_response(&rx);
    let payload = fetched(&response);
    assert_eq!(payload.status, 200);
    assert_eq!(
        payload.content_type.as_deref(),
        Some("text/html; charset=utf-8")
    );
    let body = hex::decode(payload.body_hex.as_ref().expect("body")).expect("hex");
    assert_eq!(body, b"<html>shell</html>");
}

#[test]
fn fetch_outside_scope_bypasses() {
    let mut h = Harness::new();
    let (client, rx) = h.client();

    fetch(&mut h, client, "/elsewhere/file.txt");
    let response = next_response(&rx);
    assert!(fetched(&response).bypass);
}

#[test]
fn fetch_parks_on_loading_bundle_until_activation() {
    let mut h = Harness::new();
    let (client, rx) = h.client();

    h.load_request(client, BUNDLE);
    fetch(&mut h, client, "/space/b1/app1/notes.txt");
    // Nothing yet: the fetch is parked on the in-flight load.
    assert!(rx.try_recv().is_err());

    h.fire();
    let load_response = next_response(&rx);
    assert!(load_response.success);
    let fetch_response = next_response(&rx);
    assert_eq!(fetched(&fetch_response).status, 200);
}

#[test]
fn parked_fetch_times_out_with_diagnostic_page() {
    let mut h = Harness::new();
    let (client, rx) = h.client();

    h.load_request(client, BUNDLE);
    fetch(&mut h, client, "/space/b1/app1/notes.txt");

    // Expire only the fetch waiter: drop the load's sync deadline first by
    // unloading is not what we want - instead drain waiters directly.
    h.daemon
        .expire_fetch_waiters(Instant::now() + Duration::from_secs(3600));
    let response = next_response(&rx);
    let payload = fetched(&response);
    assert_eq!(payload.status, 504);
    let body = hex::decode(payload.body_hex.as_ref().expect("body")).expect("hex");
    let page = String::from_utf8(body).expect("utf8");
    assert!(page.contains("b1"));
    assert!(page.contains("notes.txt"));
}

#[test]
fn fetch_for_unloaded_bundle_renders_diagnostic_page() {
    let mut h = Harness::new();
    let (client, rx) = h.client();

    fetch(&mut h, client, "/space/nope/app1/file.txt");
    let response = next_response(&rx);
    let payload = fetched(&response);
    assert_eq!(payload.status, 503);
    assert_eq!(
        payload.content_type.as_deref(),
        Some("text/html; charset=utf-8")
    );
}

// =============================================================================
// Watchers
// =============================================================================

#[test]
fn watch_notifications_reach_only_the_owner() {
    let mut h = Harness::new();
    let (owner, owner_rx) = h.client();
    let (other, other_rx) = h.client();
    h.load_active(owner, BUNDLE);
    let _ = next_response(&owner_rx);

    h.request(owner, Request::WatchFile {
        ctx: bundle_ctx(BUNDLE),
        path: "/app1/notes.txt".to_string(),
    });
    let watch_response = next_response(&owner_rx);
    let watch_id = match watch_response.data {
        Some(ResponseData::WatchStarted { watch_id }) => watch_id,
        other => panic!("expected watch id, got {other:?}"),
    };

    // A write from the other client changes the file.
    h.request(other, Request::WriteFile {
        ctx: bundle_ctx(BUNDLE),
        path: "/app1/notes.txt".to_string(),
        content: Some("changed".to_string()),
        bytes_hex: None,
        mode: WriteMode::Set,
    });
    assert!(next_response(&other_rx).success);
    h.pump();

    let owner_notes = drain_notifications(&owner_rx);
    assert!(owner_notes.iter().any(|n| matches!(
        n,
        Notification::FileChanged { watch_id: w, path, .. }
            if *w == watch_id && path == "/app1/notes.txt"
    )));
    assert!(drain_notifications(&other_rx).is_empty());
}

#[test]
fn unwatch_stops_engine_side_watcher() {
    let mut h = Harness::new();
    let (client, rx) = h.client();
    h.load_active(client, BUNDLE);
    let _ = next_response(&rx);

    h.request(client, Request::WatchDirectory {
        ctx: bundle_ctx(BUNDLE),
        path: "/app1".to_string(),
    });
    let watch_id = match next_response(&rx).data {
        Some(ResponseData::WatchStarted { watch_id }) => watch_id,
        other => panic!("expected watch id, got {other:?}"),
    };
    assert_eq!(h.control().watcher_count(), 1);

    h.request(client, Request::UnwatchDirectory {
        ctx: bundle_ctx(BUNDLE),
        watch_id,
    });
    assert!(next_response(&rx).success);
    assert_eq!(h.control().watcher_count(), 0);
}

#[test]
fn client_disconnect_purges_its_watchers() {
    let mut h = Harness::new();
    let (owner, owner_rx) = h.client();
    h.load_active(owner, BUNDLE);
    let _ = next_response(&owner_rx);

    h.request(owner, Request::WatchFile {
        ctx: bundle_ctx(BUNDLE),
        path: "/app1/notes.txt".to_string(),
    });
    assert!(next_response(&owner_rx).success);
    assert_eq!(h.control().watcher_count(), 1);

    h.daemon
        .handle_event(ServerEvent::Disconnected { client: owner });
    assert_eq!(h.control().watcher_count(), 0);
}

#[test]
fn failed_delivery_purges_every_watcher_of_that_client() {
    let mut h = Harness::new();
    let (owner, owner_rx) = h.client();
    h.load_active(owner, BUNDLE);
    let _ = next_response(&owner_rx);

    h.request(owner, Request::WatchFile {
        ctx: bundle_ctx(BUNDLE),
        path: "/app1/notes.txt".to_string(),
    });
    assert!(next_response(&owner_rx).success);
    h.request(owner, Request::WatchFile {
        ctx: bundle_ctx(BUNDLE),
        path: "/app1/index.html".to_string(),
    });
    assert!(next_response(&owner_rx).success);
    assert_eq!(h.control().watcher_count(), 2);

    // The client vanishes without a disconnect event (receiver dropped).
    drop(owner_rx);

    // Next delivery attempt discovers the dead client and purges both
    // watchers, not just the firing one.
    h.control().remote_set_file("/app1/notes.txt", "remote");
    h.pump();
    assert_eq!(h.control().watcher_count(), 0);
}

// =============================================================================
// Connection monitor
// =============================================================================

fn reconnect_attempts(notes: &[Notification]) -> Vec<u32> {
    notes
        .iter()
        .filter_map(|n| match n {
            Notification::Reconnecting { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect()
}

#[test]
fn outage_and_recovery_cycle_broadcasts_in_order() {
    let mut h = Harness::new();
    let (client, rx) = h.client();
    h.load_active(client, BUNDLE);
    let _ = next_response(&rx);
    let control = h.control();

    // Two failed attempts, then success.
    control.set_connected(false);
    control.fail_next_connects(2);

    h.fire(); // health tick -> lost, attempt 1 (fails), settle scheduled
    h.fire(); // settle -> still down, backoff
    h.fire(); // probe -> attempt 2 (fails), settle
    h.fire(); // settle -> still down, backoff
    h.fire(); // probe -> attempt 3 (succeeds), settle
    h.fire(); // settle -> connected, resync probe armed
    h.fire(); // resync deadline -> recovered

    let notes = drain_notifications(&rx);
    assert!(matches!(notes.first(), Some(Notification::Disconnected { .. })));
    assert_eq!(reconnect_attempts(&notes), vec![1, 2, 3]);
    assert!(matches!(notes.last(), Some(Notification::Reconnected { .. })));

    let active = h
        .daemon
        .registry
        .active(&LauncherBundleId::new(BUNDLE))
        .expect("active");
    assert!(active.health.is_healthy());
    assert_eq!(active.health.attempts(), 0);
}

#[test]
fn resync_completes_early_on_remote_traffic() {
    let mut h = Harness::new();
    let (client, rx) = h.client();
    h.load_active(client, BUNDLE);
    let _ = next_response(&rx);
    let control = h.control();

    control.set_connected(false);
    control.fail_next_connects(0);

    h.fire(); // health tick -> attempt 1 connects immediately
    h.fire(); // settle -> connected, resync probe armed

    control.emit_remote_change("/app1/notes.txt");
    h.pump();

    let notes = drain_notifications(&rx);
    assert!(matches!(notes.last(), Some(Notification::Reconnected { .. })));
}

#[test]
fn bounded_retry_gives_up_with_reconnection_failed() {
    let mut h = Harness::with_config_mut(|config| {
        config.connection.continuous_retry = false;
        config.connection.max_reconnect_attempts = 2;
    });
    let (client, rx) = h.client();
    h.load_active(client, BUNDLE);
    let _ = next_response(&rx);
    let control = h.control();

    control.set_connected(false);
    control.fail_next_connects(10);

    h.fire(); // health tick -> attempt 1
    h.fire(); // settle -> backoff
    h.fire(); // probe -> attempt 2
    h.fire(); // settle -> limit reached, give up

    let notes = drain_notifications(&rx);
    assert_eq!(reconnect_attempts(&notes), vec![1, 2]);
    assert!(notes.iter().any(|n| matches!(
        n,
        Notification::ReconnectionFailed { attempts: 2, .. }
    )));

    // Monitor parked: nothing further fires.
    h.fire();
    assert!(drain_notifications(&rx).is_empty());
}

#[test]
fn continuous_retry_keeps_going_past_the_limit() {
    let mut h = Harness::with_config_mut(|config| {
        config.connection.continuous_retry = true;
        config.connection.max_reconnect_attempts = 2;
    });
    let (client, rx) = h.client();
    h.load_active(client, BUNDLE);
    let _ = next_response(&rx);
    let control = h.control();

    control.set_connected(false);
    control.fail_next_connects(10);

    // Walk well past the limit: the counter resets instead of giving up.
    for _ in 0..8 {
        h.fire();
    }
    let notes = drain_notifications(&rx);
    assert!(
        !notes
            .iter()
            .any(|n| matches!(n, Notification::ReconnectionFailed { .. }))
    );
    assert_eq!(reconnect_attempts(&notes), vec![1, 2, 1, 2]);
}

#[test]
fn monitor_tolerates_unload_mid_cycle() {
    let mut h = Harness::new();
    let (client, rx) = h.client();
    h.load_active(client, BUNDLE);
    let _ = next_response(&rx);
    let control = h.control();

    control.set_connected(false);
    h.fire(); // begins reconnect, settle scheduled

    h.request(client, Request::UnloadBundle {
        ctx: bundle_ctx(BUNDLE),
    });
    assert!(next_response(&rx).success);

    // Any stale timer fires exit quietly.
    h.fire();
    h.fire();
    let notes = drain_notifications(&rx);
    assert!(
        !notes
            .iter()
            .any(|n| matches!(n, Notification::Reconnected { .. }))
    );
}

// =============================================================================
// Dispatcher contract
// =============================================================================

#[test]
fn bundle_ops_fail_fast_when_not_active() {
    let mut h = Harness::new();
    let (client, rx) = h.client();

    h.request(client, Request::ReadFile {
        ctx: bundle_ctx(BUNDLE),
        path: "/app1/notes.txt".to_string(),
    });
    let response = next_response(&rx);
    assert!(!response.success);
    assert_eq!(
        response.error.expect("error").code,
        spacedock_surface::ipc::ErrorCode::NotInitialized
    );
}

#[test]
fn pre_activation_allow_list_works_without_bundles() {
    let mut h = Harness::new();
    let (client, rx) = h.client();

    h.request(client, Request::Ping { ctx: Ctx::default() });
    assert!(next_response(&rx).success);

    h.request(client, Request::GetServerUrl { ctx: Ctx::default() });
    let response = next_response(&rx);
    assert!(matches!(
        response.data,
        Some(ResponseData::ServerUrl { server_url: Some(_) })
    ));

    h.request(client, Request::SetAppSlug {
        ctx: bundle_ctx(BUNDLE),
        app_slug: "app1".to_string(),
    });
    assert!(next_response(&rx).success);

    h.request(client, Request::Init { ctx: Ctx::default() });
    let response = next_response(&rx);
    assert!(matches!(
        response.data,
        Some(ResponseData::Initialized { needs_reinit: false, .. })
    ));
}

#[test]
fn responses_echo_correlation_ids() {
    let mut h = Harness::new();
    let (client, rx) = h.client();

    h.request(client, Request::Ping {
        ctx: Ctx { id: Some("corr-7".into()) },
    });
    let response = next_response(&rx);
    assert_eq!(response.id.as_deref(), Some("corr-7"));
    assert_eq!(response.op, "ping");
}

#[test]
fn file_crud_round_trip_through_dispatcher() {
    let mut h = Harness::new();
    let (client, rx) = h.client();
    h.load_active(client, BUNDLE);
    let _ = next_response(&rx);

    h.request(client, Request::WriteFile {
        ctx: bundle_ctx(BUNDLE),
        path: "/app1/new.json".to_string(),
        content: Some(r#"{"count":1}"#.to_string()),
        bytes_hex: None,
        mode: WriteMode::Create,
    });
    assert!(next_response(&rx).success);

    h.request(client, Request::PatchFile {
        ctx: bundle_ctx(BUNDLE),
        path: "/app1/new.json".to_string(),
        pointer: vec!["count".to_string()],
        value: serde_json::json!(2),
    });
    assert!(next_response(&rx).success);

    h.request(client, Request::ReadFile {
        ctx: bundle_ctx(BUNDLE),
        path: "/app1/new.json".to_string(),
    });
    let response = next_response(&rx);
    match response.data {
        Some(ResponseData::File { content, .. }) => {
            assert_eq!(content, r#"{"count":2}"#);
        }
        other => panic!("expected file, got {other:?}"),
    }

    h.request(client, Request::Rename {
        ctx: bundle_ctx(BUNDLE),
        old_path: "/app1/new.json".to_string(),
        new_path: "/app1/renamed.json".to_string(),
    });
    assert!(next_response(&rx).success);

    h.request(client, Request::Exists {
        ctx: bundle_ctx(BUNDLE),
        path: "/app1/renamed.json".to_string(),
    });
    assert!(matches!(
        next_response(&rx).data,
        Some(ResponseData::Exists { exists: true })
    ));

    h.request(client, Request::ListDirectory {
        ctx: bundle_ctx(BUNDLE),
        path: "/app1".to_string(),
    });
    match next_response(&rx).data {
        Some(ResponseData::Listing { entries }) => {
            assert!(entries.iter().any(|e| e.name == "renamed.json"));
        }
        other => panic!("expected listing, got {other:?}"),
    }

    h.request(client, Request::DeleteFile {
        ctx: bundle_ctx(BUNDLE),
        path: "/app1/renamed.json".to_string(),
    });
    assert!(next_response(&rx).success);
}

#[test]
fn to_bytes_round_trips_into_a_new_load() {
    let mut h = Harness::new();
    let (client, rx) = h.client();
    h.load_active(client, BUNDLE);
    let _ = next_response(&rx);

    h.request(client, Request::ToBytes {
        ctx: bundle_ctx(BUNDLE),
    });
    let bytes_hex = match next_response(&rx).data {
        Some(ResponseData::BundleBytes { bytes_hex }) => bytes_hex,
        other => panic!("expected bytes, got {other:?}"),
    };

    h.request(client, Request::LoadBundle {
        ctx: bundle_ctx("b2"),
        bundle_bytes_hex: bytes_hex,
        server_url: None,
        manifest: None,
    });
    h.fire();
    assert!(next_response(&rx).success);

    let original = h
        .daemon
        .registry
        .manifest(&LauncherBundleId::new(BUNDLE))
        .expect("b1")
        .root_id
        .clone();
    let copied = h
        .daemon
        .registry
        .manifest(&LauncherBundleId::new("b2"))
        .expect("b2")
        .root_id
        .clone();
    assert_eq!(original, copied);
}
