//! Per-operation request handlers.
//!
//! One contract throughout: resolve the explicit target bundle, fail fast
//! with a typed error when it is not Active (except the pre-activation
//! allow-list), perform the store operation, and post exactly one response
//! carrying the request's correlation id back to the originating client.

use std::time::Instant;

use spacedock_surface::ipc::{
    ChangeOriginWire, DirEntryInfo, EntryKindWire, FetchPayload, ManifestInfo,
    Request, Response, ResponseData, WriteMode, PROTOCOL_VERSION,
};

use super::load::LoadPlan;
use super::{Daemon, FetchWaiter};
use crate::daemon::fetch::{
    self, FetchDecision, ResolvedPath, body_bytes, content_type_for, error_page,
};
use crate::daemon::ops::OpError;
use crate::daemon::registry::BundleState;
use crate::daemon::server::ServerEvent;
use crate::daemon::watchers::{WatchTargetKind, WatcherEntry};
use crate::daemon::{ClientId, LauncherBundleId, WatchId, WatchSignal, WatchSink};
use crate::store::{ChangeOrigin, DirEntry, EntryKind, Manifest};

pub(crate) fn origin_wire(origin: ChangeOrigin) -> ChangeOriginWire {
    match origin {
        ChangeOrigin::Local => ChangeOriginWire::Local,
        ChangeOrigin::Remote => ChangeOriginWire::Remote,
    }
}

fn entry_info(entry: DirEntry) -> DirEntryInfo {
    DirEntryInfo {
        name: entry.name,
        kind: match entry.kind {
            EntryKind::File => EntryKindWire::File,
            EntryKind::Directory => EntryKindWire::Directory,
        },
        size: entry.size,
    }
}

fn manifest_info(manifest: &Manifest) -> ManifestInfo {
    ManifestInfo {
        root_id: manifest.root_id.clone(),
        entrypoints: manifest.entrypoints.clone(),
        sync_endpoints: manifest.sync_endpoints.clone(),
    }
}

fn manifest_from_info(info: ManifestInfo) -> Manifest {
    Manifest {
        root_id: info.root_id,
        entrypoints: info.entrypoints,
        sync_endpoints: info.sync_endpoints,
    }
}

impl Daemon {
    pub(crate) fn handle_request(&mut self, client: ClientId, request: Request) {
        let info = request.info();
        let op = info.op;
        let request_id = info.id.map(str::to_string);

        match request {
            // === Pre-activation surface ===
            Request::Init { .. } => {
                let data = ResponseData::Initialized {
                    protocol_version: PROTOCOL_VERSION,
                    needs_reinit: self.needs_reinit,
                    resumed_bundle: self.resumed_bundle.clone(),
                };
                self.respond(client, Response::ok(op, request_id, data));
            }
            Request::Ping { .. } => {
                let data = ResponseData::Pong {
                    version: env!("CARGO_PKG_VERSION").to_string(),
                };
                self.respond(client, Response::ok(op, request_id, data));
            }
            Request::GetServerUrl { .. } => {
                let data = ResponseData::ServerUrl {
                    server_url: self.config.server_url.clone(),
                };
                self.respond(client, Response::ok(op, request_id, data));
            }
            Request::Status { .. } => {
                let data = ResponseData::Status {
                    bundles: self.status_bundles(),
                };
                self.respond(client, Response::ok(op, request_id, data));
            }
            Request::Shutdown { .. } => {
                tracing::info!("shutdown requested");
                self.respond(client, Response::ack(op, request_id));
                self.request_shutdown();
            }

            Request::LoadBundle {
                ctx,
                bundle_bytes_hex,
                server_url,
                manifest,
            } => {
                let launcher = LauncherBundleId::new(ctx.launcher_bundle_id);
                match hex::decode(&bundle_bytes_hex) {
                    Ok(bundle_bytes) => {
                        let plan = LoadPlan {
                            bundle_bytes,
                            server_url_override: server_url,
                            cached_manifest: manifest.map(manifest_from_info),
                            namespace: None,
                            app_slug: None,
                            resumed: false,
                        };
                        self.handle_load_bundle(client, request_id, launcher, plan);
                    }
                    Err(e) => {
                        let err = OpError::InvalidRequest {
                            field: Some("bundleBytesHex".to_string()),
                            reason: e.to_string(),
                        };
                        self.respond(
                            client,
                            Response::err(op, request_id, err.into_error_payload()),
                        );
                    }
                }
            }
            Request::UnloadBundle { ctx } => {
                let launcher = LauncherBundleId::new(ctx.launcher_bundle_id);
                self.handle_unload(&launcher);
                self.respond(client, Response::ack(op, request_id));
            }
            Request::SetAppSlug { ctx, app_slug } => {
                let launcher = LauncherBundleId::new(ctx.launcher_bundle_id);
                match self.registry.get_mut(&launcher) {
                    Some(BundleState::Active(active)) => active.app_slug = app_slug.clone(),
                    Some(BundleState::Loading(loading)) => loading.app_slug = app_slug.clone(),
                    _ => {}
                }
                // Legal before activation: the slug also rides the durable
                // record so a resumed bundle serves the right app.
                if let Err(err) = self
                    .cache
                    .set_text(crate::daemon::cache::KEY_APP_SLUG, &app_slug)
                {
                    tracing::warn!(bundle = %launcher, "app slug persist failed: {err}");
                }
                self.respond(client, Response::ack(op, request_id));
            }

            // === Bundle-scoped operations ===
            Request::GetManifest { ctx } => {
                let launcher = LauncherBundleId::new(ctx.launcher_bundle_id);
                let result = self.registry.manifest(&launcher).map(manifest_info);
                self.respond_result(client, op, request_id, result.map(|m| {
                    ResponseData::Manifest { manifest: m }
                }));
            }
            Request::ReadFile { ctx, path } => {
                let launcher = LauncherBundleId::new(ctx.launcher_bundle_id);
                let result = self.registry.store(&launcher).and_then(|store| {
                    store
                        .read_file(&path)
                        .map_err(|e| OpError::store("readFile", &path, e))
                });
                self.respond_result(client, op, request_id, result.map(|file| {
                    ResponseData::File {
                        bytes_hex: file.bytes.as_deref().map(hex::encode),
                        content: file.content,
                    }
                }));
            }
            Request::WriteFile {
                ctx,
                path,
                content,
                bytes_hex,
                mode,
            } => {
                let launcher = LauncherBundleId::new(ctx.launcher_bundle_id);
                let result = self.write_file(&launcher, &path, content, bytes_hex, mode);
                self.respond_result(client, op, request_id, result.map(|()| None::<ResponseData>));
            }
            Request::UpdateFile { ctx, path, content } => {
                let launcher = LauncherBundleId::new(ctx.launcher_bundle_id);
                let result = self.registry.store(&launcher).and_then(|store| {
                    store
                        .update_file(&path, &content)
                        .map_err(|e| OpError::store("updateFile", &path, e))
                });
                self.respond_result(client, op, request_id, result.map(|changed| {
                    ResponseData::Changed { changed }
                }));
            }
            Request::PatchFile {
                ctx,
                path,
                pointer,
                value,
            } => {
                let launcher = LauncherBundleId::new(ctx.launcher_bundle_id);
                let result = self.registry.store(&launcher).and_then(|store| {
                    store
                        .patch_file(&path, &pointer, &value)
                        .map_err(|e| OpError::store("patchFile", &path, e))
                });
                self.respond_result(client, op, request_id, result.map(|()| None::<ResponseData>));
            }
            Request::DeleteFile { ctx, path } => {
                let launcher = LauncherBundleId::new(ctx.launcher_bundle_id);
                let result = self.registry.store(&launcher).and_then(|store| {
                    store
                        .delete_file(&path)
                        .map_err(|e| OpError::store("deleteFile", &path, e))
                });
                self.respond_result(client, op, request_id, result.map(|()| None::<ResponseData>));
            }
            Request::Rename {
                ctx,
                old_path,
                new_path,
            } => {
                let launcher = LauncherBundleId::new(ctx.launcher_bundle_id);
                let result = self.registry.store(&launcher).and_then(|store| {
                    store
                        .rename(&old_path, &new_path)
                        .map_err(|e| OpError::store("rename", &old_path, e))
                });
                self.respond_result(client, op, request_id, result.map(|()| None::<ResponseData>));
            }
            Request::Exists { ctx, path } => {
                let launcher = LauncherBundleId::new(ctx.launcher_bundle_id);
                let result = self.registry.store(&launcher).and_then(|store| {
                    store
                        .exists(&path)
                        .map_err(|e| OpError::store("exists", &path, e))
                });
                self.respond_result(client, op, request_id, result.map(|exists| {
                    ResponseData::Exists { exists }
                }));
            }
            Request::ListDirectory { ctx, path } => {
                let launcher = LauncherBundleId::new(ctx.launcher_bundle_id);
                let result = self.registry.store(&launcher).and_then(|store| {
                    store
                        .list_directory(&path)
                        .map_err(|e| OpError::store("listDirectory", &path, e))
                });
                self.respond_result(client, op, request_id, result.map(|entries| {
                    ResponseData::Listing {
                        entries: entries.into_iter().map(entry_info).collect(),
                    }
                }));
            }

            Request::WatchFile { ctx, path } => {
                let launcher = LauncherBundleId::new(ctx.launcher_bundle_id);
                let result = self.add_watch(client, &launcher, &path, WatchTargetKind::File);
                self.respond_result(client, op, request_id, result.map(|watch_id| {
                    ResponseData::WatchStarted {
                        watch_id: watch_id.to_string(),
                    }
                }));
            }
            Request::WatchDirectory { ctx, path } => {
                let launcher = LauncherBundleId::new(ctx.launcher_bundle_id);
                let result = self.add_watch(client, &launcher, &path, WatchTargetKind::Directory);
                self.respond_result(client, op, request_id, result.map(|watch_id| {
                    ResponseData::WatchStarted {
                        watch_id: watch_id.to_string(),
                    }
                }));
            }
            Request::UnwatchFile { ctx, watch_id } | Request::UnwatchDirectory { ctx, watch_id } => {
                let launcher = LauncherBundleId::new(ctx.launcher_bundle_id);
                let result = self
                    .registry
                    .active_mut(&launcher)
                    .map(|active| active.remove_watcher(&WatchId::new(watch_id)));
                // Unwatching an unknown id is a no-op, not an error.
                self.respond_result(client, op, request_id, result.map(|_| None::<ResponseData>));
            }

            Request::ToBytes { ctx } => {
                let launcher = LauncherBundleId::new(ctx.launcher_bundle_id);
                let result = self.registry.store(&launcher).and_then(|store| {
                    store
                        .to_bytes()
                        .map_err(|e| OpError::store("toBytes", "/", e))
                });
                self.respond_result(client, op, request_id, result.map(|bytes| {
                    ResponseData::BundleBytes {
                        bytes_hex: hex::encode(bytes),
                    }
                }));
            }
            Request::ForkToBytes { ctx } => {
                let launcher = LauncherBundleId::new(ctx.launcher_bundle_id);
                let result = self.registry.store(&launcher).and_then(|store| {
                    store
                        .fork_to_bytes()
                        .map_err(|e| OpError::store("forkToBytes", "/", e))
                });
                self.respond_result(client, op, request_id, result.map(|bytes| {
                    ResponseData::BundleBytes {
                        bytes_hex: hex::encode(bytes),
                    }
                }));
            }

            Request::Fetch { url, upgrade, .. } => {
                self.handle_fetch(client, request_id, &url, upgrade.as_deref());
            }
        }
    }

    /// Post the single response for an operation, success or typed failure.
    fn respond_result(
        &mut self,
        client: ClientId,
        op: &str,
        request_id: Option<String>,
        result: Result<impl Into<Option<ResponseData>>, OpError>,
    ) {
        let response = match result {
            Ok(data) => match data.into() {
                Some(data) => Response::ok(op, request_id, data),
                None => Response::ack(op, request_id),
            },
            Err(err) => {
                tracing::debug!("operation failed: {err}");
                Response::err(op, request_id, err.into_error_payload())
            }
        };
        self.respond(client, response);
    }

    fn write_file(
        &mut self,
        launcher: &LauncherBundleId,
        path: &str,
        content: Option<String>,
        bytes_hex: Option<String>,
        mode: WriteMode,
    ) -> Result<(), OpError> {
        let store = self.registry.store(launcher)?;
        match (content, bytes_hex) {
            (Some(content), None) => match mode {
                WriteMode::Create => store
                    .create_file(path, &content)
                    .map_err(|e| OpError::store("createFile", path, e)),
                WriteMode::Set => store
                    .set_file(path, &content)
                    .map_err(|e| OpError::store("setFile", path, e)),
            },
            (None, Some(bytes_hex)) => {
                let bytes = hex::decode(&bytes_hex).map_err(|e| OpError::InvalidRequest {
                    field: Some("bytesHex".to_string()),
                    reason: e.to_string(),
                })?;
                match mode {
                    WriteMode::Create => store
                        .create_file_with_bytes(path, &bytes)
                        .map_err(|e| OpError::store("createFileWithBytes", path, e)),
                    WriteMode::Set => store
                        .set_file_with_bytes(path, &bytes)
                        .map_err(|e| OpError::store("setFileWithBytes", path, e)),
                }
            }
            _ => Err(OpError::InvalidRequest {
                field: Some("content".to_string()),
                reason: "exactly one of content or bytesHex is required".to_string(),
            }),
        }
    }

    fn add_watch(
        &mut self,
        client: ClientId,
        launcher: &LauncherBundleId,
        path: &str,
        kind: WatchTargetKind,
    ) -> Result<WatchId, OpError> {
        let watch_id = WatchId::generate();
        let tx = self.event_tx.clone();
        let bundle = launcher.clone();
        let signal_id = watch_id.clone();

        let active = self.registry.active_mut(launcher)?;
        let callback: crate::store::WatchCallback = Box::new(move |event| {
            let _ = tx.send(ServerEvent::Watch(WatchSignal {
                bundle: bundle.clone(),
                sink: WatchSink::Client {
                    watch_id: signal_id.clone(),
                },
                event,
            }));
        });
        let handle = match kind {
            WatchTargetKind::File => active
                .store
                .watch_file(path, callback)
                .map_err(|e| OpError::store("watchFile", path, e))?,
            WatchTargetKind::Directory => active
                .store
                .watch_directory(path, callback)
                .map_err(|e| OpError::store("watchDirectory", path, e))?,
        };
        active.add_watcher(WatcherEntry {
            watch_id: watch_id.clone(),
            kind,
            path: path.to_string(),
            handle,
            owner: client,
        });
        Ok(watch_id)
    }

    // =========================================================================
    // Fetch serving
    // =========================================================================

    fn handle_fetch(
        &mut self,
        client: ClientId,
        request_id: Option<String>,
        url: &str,
        upgrade: Option<&str>,
    ) {
        let decision = fetch::classify(
            url,
            &self.config.fetch.scope,
            &self.config.fetch.reserved_assets,
            upgrade,
        );
        let payload = match decision {
            FetchDecision::Bypass => FetchPayload {
                status: 0,
                content_type: None,
                body_hex: None,
                bypass: true,
            },
            FetchDecision::Reset => {
                // Root-scope request: the reset signal. The cached
                // bundle/app-slug record goes back to idle.
                tracing::debug!("root-scope fetch, clearing resume record");
                self.cache.clear();
                FetchPayload {
                    status: 0,
                    content_type: None,
                    body_hex: None,
                    bypass: true,
                }
            }
            FetchDecision::Serve(resolved) => {
                let launcher = LauncherBundleId::new(resolved.bundle_id.clone());
                match self.registry.get(&launcher) {
                    Some(BundleState::Active(_)) => self.serve_fetch(&launcher, &resolved),
                    // Not yet Active: park on the in-flight load/recovery
                    // with a bounded deadline instead of failing eagerly.
                    Some(BundleState::Loading(_)) => {
                        let deadline =
                            Instant::now() + self.config.fetch.recovery_timeout();
                        self.fetch_waiters.push(FetchWaiter {
                            client,
                            request_id,
                            bundle: launcher,
                            resolved,
                            deadline,
                        });
                        return;
                    }
                    _ => self.fetch_error_payload(&resolved, 503, "bundle not loaded"),
                }
            }
        };
        self.respond(
            client,
            Response::ok("fetch", request_id, ResponseData::Fetched(payload)),
        );
    }

    /// Serve one resolved path from an Active bundle. Failures never leave
    /// this function: they become the diagnostic page.
    pub(crate) fn serve_fetch(
        &self,
        launcher: &LauncherBundleId,
        resolved: &ResolvedPath,
    ) -> FetchPayload {
        match self.try_serve(launcher, resolved) {
            Ok(payload) => payload,
            Err(err) => self.fetch_error_payload(resolved, 500, &err.to_string()),
        }
    }

    fn try_serve(
        &self,
        launcher: &LauncherBundleId,
        resolved: &ResolvedPath,
    ) -> Result<FetchPayload, OpError> {
        let active = self.registry.active(launcher)?;
        let store = active.store.as_ref();

        let requested = format!("/{}/{}", resolved.app_slug, resolved.relative_path);
        let exists = store
            .exists(&requested)
            .map_err(|e| OpError::store("exists", &requested, e))?;

        // Single-page-app convention: absent paths serve the app shell, not
        // a hard 404.
        let served = if exists {
            requested
        } else {
            format!("/{}/index.html", resolved.app_slug)
        };

        let file = store
            .read_file(&served)
            .map_err(|e| OpError::store("readFile", &served, e))?;
        let body = body_bytes(file)?;

        Ok(FetchPayload {
            status: 200,
            content_type: Some(content_type_for(&served).to_string()),
            body_hex: Some(hex::encode(body)),
            bypass: false,
        })
    }

    pub(crate) fn fetch_error_payload(
        &self,
        resolved: &ResolvedPath,
        status: u16,
        message: &str,
    ) -> FetchPayload {
        let page = error_page(&resolved.bundle_id, &resolved.relative_path, message);
        FetchPayload {
            status,
            content_type: Some("text/html; charset=utf-8".to_string()),
            body_hex: Some(hex::encode(page.as_bytes())),
            bypass: false,
        }
    }

    fn status_bundles(&self) -> Vec<spacedock_surface::ipc::BundleStatusInfo> {
        self.registry
            .iter()
            .map(|(id, state)| {
                let (healthy, attempts, watchers) = match state {
                    BundleState::Active(active) => (
                        active.health.is_healthy(),
                        active.health.attempts(),
                        active.watchers.len(),
                    ),
                    _ => (false, 0, 0),
                };
                spacedock_surface::ipc::BundleStatusInfo {
                    launcher_bundle_id: id.to_string(),
                    state: state.name().to_string(),
                    connection_healthy: healthy,
                    reconnect_attempts: attempts,
                    watcher_count: watchers,
                }
            })
            .collect()
    }
}
