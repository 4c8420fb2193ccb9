//! In-memory document store engine.
//!
//! Default engine for the dev profile and the test suite. Bundle bytes are
//! canonical JSON (manifest plus files, binary payloads base64-encoded);
//! the "remote peer" is simulated through the control handle, which can
//! drop the link, fail connect attempts, and emit remote-origin changes.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{
    ChangeEvent, ChangeOrigin, DirEntry, DocumentStore, EntryKind, FileContent, Manifest,
    StoreConfig, StoreError, StoreFactory, WatchCallback, WatchHandle,
};

// =============================================================================
// Bundle wire format
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BundleManifestWire {
    #[serde(default)]
    root_id: Option<String>,
    entrypoints: Vec<String>,
    #[serde(default)]
    sync_endpoints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum BundleFileWire {
    Text { text: String },
    Binary { base64: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BundleWire {
    manifest: BundleManifestWire,
    files: BTreeMap<String, BundleFileWire>,
}

/// Build bundle bytes from a manifest and plain-text files.
pub fn bundle_bytes(
    entrypoints: &[&str],
    sync_endpoints: &[&str],
    files: &[(&str, &str)],
) -> Vec<u8> {
    let wire = BundleWire {
        manifest: BundleManifestWire {
            root_id: None,
            entrypoints: entrypoints.iter().map(|s| s.to_string()).collect(),
            sync_endpoints: sync_endpoints.iter().map(|s| s.to_string()).collect(),
        },
        files: files
            .iter()
            .map(|(path, text)| {
                (
                    path.to_string(),
                    BundleFileWire::Text {
                        text: text.to_string(),
                    },
                )
            })
            .collect(),
    };
    serde_json::to_vec(&wire).expect("bundle serialization is infallible")
}

// =============================================================================
// Store internals
// =============================================================================

#[derive(Clone, Debug)]
struct StoredFile {
    content: String,
    bytes: Option<Vec<u8>>,
    base64: bool,
}

impl StoredFile {
    fn text(content: String) -> Self {
        Self {
            content,
            bytes: None,
            base64: false,
        }
    }

    fn binary(bytes: Vec<u8>) -> Self {
        Self {
            content: BASE64.encode(&bytes),
            bytes: Some(bytes),
            base64: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WatchKind {
    File,
    Directory,
}

struct WatcherRec {
    path: String,
    kind: WatchKind,
    callback: Arc<dyn Fn(ChangeEvent) + Send + Sync>,
}

struct Inner {
    namespace: String,
    manifest: Manifest,
    files: Mutex<BTreeMap<String, StoredFile>>,
    watchers: Mutex<HashMap<u64, WatcherRec>>,
    next_watch: AtomicU64,
    connected: AtomicBool,
    connected_url: Mutex<Option<String>>,
    /// Remaining connect attempts to reject, for failure injection.
    fail_connects: AtomicU32,
}

impl Inner {
    fn notify(&self, path: &str, origin: ChangeOrigin) {
        // Snapshot matching callbacks so delivery happens outside the lock;
        // a callback may legally re-enter the store.
        let matching: Vec<_> = {
            let watchers = self.watchers.lock().expect("watchers lock");
            watchers
                .values()
                .filter(|rec| match rec.kind {
                    WatchKind::File => rec.path == path,
                    WatchKind::Directory => dir_contains(&rec.path, path),
                })
                .map(|rec| Arc::clone(&rec.callback))
                .collect()
        };
        for callback in matching {
            callback(ChangeEvent {
                path: path.to_string(),
                origin,
            });
        }
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim();
    let mut normalized = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    };
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

fn dir_contains(dir: &str, path: &str) -> bool {
    if dir == "/" {
        return true;
    }
    path.strip_prefix(dir)
        .is_some_and(|rest| rest.starts_with('/'))
}

pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    fn stored(&self, path: &str) -> Result<StoredFile, StoreError> {
        let files = self.inner.files.lock().expect("files lock");
        files
            .get(&normalize(path))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    fn put(&self, path: &str, file: StoredFile, must_create: bool) -> Result<(), StoreError> {
        let path = normalize(path);
        {
            let mut files = self.inner.files.lock().expect("files lock");
            if must_create && files.contains_key(&path) {
                return Err(StoreError::AlreadyExists(path));
            }
            files.insert(path.clone(), file);
        }
        self.inner.notify(&path, ChangeOrigin::Local);
        Ok(())
    }
}

impl DocumentStore for MemoryStore {
    fn connect_websocket(&self, url: &str) -> Result<(), StoreError> {
        let remaining = self.inner.fail_connects.load(Ordering::Acquire);
        if remaining > 0 {
            self.inner
                .fail_connects
                .store(remaining - 1, Ordering::Release);
            return Err(StoreError::ConnectFailed(format!(
                "injected failure connecting to {url}"
            )));
        }
        *self.inner.connected_url.lock().expect("url lock") = Some(url.to_string());
        self.inner.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    fn exists(&self, path: &str) -> Result<bool, StoreError> {
        let files = self.inner.files.lock().expect("files lock");
        Ok(files.contains_key(&normalize(path)))
    }

    fn read_file(&self, path: &str) -> Result<FileContent, StoreError> {
        let stored = self.stored(path)?;
        Ok(FileContent {
            content: stored.content,
            bytes: stored.bytes,
            base64: stored.base64,
        })
    }

    fn create_file(&self, path: &str, content: &str) -> Result<(), StoreError> {
        self.put(path, StoredFile::text(content.to_string()), true)
    }

    fn set_file(&self, path: &str, content: &str) -> Result<(), StoreError> {
        self.put(path, StoredFile::text(content.to_string()), false)
    }

    fn create_file_with_bytes(&self, path: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.put(path, StoredFile::binary(bytes.to_vec()), true)
    }

    fn set_file_with_bytes(&self, path: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.put(path, StoredFile::binary(bytes.to_vec()), false)
    }

    fn update_file(&self, path: &str, content: &str) -> Result<bool, StoreError> {
        let path = normalize(path);
        let changed = {
            let mut files = self.inner.files.lock().expect("files lock");
            let unchanged = files
                .get(&path)
                .is_some_and(|existing| existing.content == content && !existing.base64);
            if unchanged {
                false
            } else {
                files.insert(path.clone(), StoredFile::text(content.to_string()));
                true
            }
        };
        if changed {
            self.inner.notify(&path, ChangeOrigin::Local);
        }
        Ok(changed)
    }

    fn patch_file(
        &self,
        path: &str,
        pointer: &[String],
        value: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let stored = self.stored(path)?;
        let mut doc: serde_json::Value =
            serde_json::from_str(&stored.content).map_err(|e| StoreError::InvalidPatch {
                path: path.to_string(),
                reason: format!("not a JSON document: {e}"),
            })?;

        let mut target = &mut doc;
        for segment in pointer {
            target = match target {
                serde_json::Value::Object(map) => map
                    .entry(segment.clone())
                    .or_insert(serde_json::Value::Null),
                serde_json::Value::Array(items) => {
                    let index: usize =
                        segment.parse().map_err(|_| StoreError::InvalidPatch {
                            path: path.to_string(),
                            reason: format!("bad array index {segment:?}"),
                        })?;
                    items.get_mut(index).ok_or_else(|| StoreError::InvalidPatch {
                        path: path.to_string(),
                        reason: format!("array index {index} out of bounds"),
                    })?
                }
                _ => {
                    return Err(StoreError::InvalidPatch {
                        path: path.to_string(),
                        reason: format!("cannot descend into scalar at {segment:?}"),
                    });
                }
            };
        }
        *target = value.clone();

        let serialized = serde_json::to_string(&doc).map_err(|e| StoreError::Engine(e.to_string()))?;
        self.put(path, StoredFile::text(serialized), false)
    }

    fn delete_file(&self, path: &str) -> Result<(), StoreError> {
        let path = normalize(path);
        {
            let mut files = self.inner.files.lock().expect("files lock");
            if files.remove(&path).is_none() {
                return Err(StoreError::NotFound(path));
            }
        }
        self.inner.notify(&path, ChangeOrigin::Local);
        Ok(())
    }

    fn rename(&self, old_path: &str, new_path: &str) -> Result<(), StoreError> {
        let old_path = normalize(old_path);
        let new_path = normalize(new_path);
        {
            let mut files = self.inner.files.lock().expect("files lock");
            let Some(file) = files.remove(&old_path) else {
                return Err(StoreError::NotFound(old_path));
            };
            files.insert(new_path.clone(), file);
        }
        self.inner.notify(&old_path, ChangeOrigin::Local);
        self.inner.notify(&new_path, ChangeOrigin::Local);
        Ok(())
    }

    fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>, StoreError> {
        let dir = normalize(path);
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{dir}/")
        };

        let files = self.inner.files.lock().expect("files lock");
        let mut seen: BTreeMap<String, DirEntry> = BTreeMap::new();
        for (file_path, stored) in files.iter() {
            let Some(rest) = file_path.strip_prefix(&prefix) else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            match rest.split_once('/') {
                None => {
                    let size = stored
                        .bytes
                        .as_ref()
                        .map(|b| b.len() as u64)
                        .unwrap_or(stored.content.len() as u64);
                    seen.insert(
                        rest.to_string(),
                        DirEntry {
                            name: rest.to_string(),
                            kind: EntryKind::File,
                            size: Some(size),
                        },
                    );
                }
                Some((child_dir, _)) => {
                    seen.entry(child_dir.to_string()).or_insert(DirEntry {
                        name: child_dir.to_string(),
                        kind: EntryKind::Directory,
                        size: None,
                    });
                }
            }
        }
        Ok(seen.into_values().collect())
    }

    fn watch_file(&self, path: &str, callback: WatchCallback) -> Result<WatchHandle, StoreError> {
        self.watch(path, WatchKind::File, callback)
    }

    fn watch_directory(
        &self,
        path: &str,
        callback: WatchCallback,
    ) -> Result<WatchHandle, StoreError> {
        self.watch(path, WatchKind::Directory, callback)
    }

    fn manifest(&self) -> Result<Manifest, StoreError> {
        Ok(self.inner.manifest.clone())
    }

    fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        self.serialize(&self.inner.manifest.root_id)
    }

    fn fork_to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        // A fork gets fresh content-addressed identity.
        let files = self.inner.files.lock().expect("files lock");
        let digest = digest_files(&files);
        drop(files);
        self.serialize(&digest)
    }
}

impl MemoryStore {
    fn watch(
        &self,
        path: &str,
        kind: WatchKind,
        callback: WatchCallback,
    ) -> Result<WatchHandle, StoreError> {
        let id = self.inner.next_watch.fetch_add(1, Ordering::Relaxed);
        let rec = WatcherRec {
            path: normalize(path),
            kind,
            callback: Arc::from(callback),
        };
        self.inner
            .watchers
            .lock()
            .expect("watchers lock")
            .insert(id, rec);

        let inner = Arc::clone(&self.inner);
        Ok(WatchHandle::new(move || {
            inner.watchers.lock().expect("watchers lock").remove(&id);
            Ok(())
        }))
    }

    fn serialize(&self, root_id: &str) -> Result<Vec<u8>, StoreError> {
        let files = self.inner.files.lock().expect("files lock");
        let wire = BundleWire {
            manifest: BundleManifestWire {
                root_id: Some(root_id.to_string()),
                entrypoints: self.inner.manifest.entrypoints.clone(),
                sync_endpoints: self.inner.manifest.sync_endpoints.clone(),
            },
            files: files
                .iter()
                .map(|(path, stored)| {
                    let wire = match &stored.bytes {
                        Some(bytes) => BundleFileWire::Binary {
                            base64: BASE64.encode(bytes),
                        },
                        None if stored.base64 => BundleFileWire::Binary {
                            base64: stored.content.clone(),
                        },
                        None => BundleFileWire::Text {
                            text: stored.content.clone(),
                        },
                    };
                    (path.clone(), wire)
                })
                .collect(),
        };
        serde_json::to_vec(&wire).map_err(|e| StoreError::Engine(e.to_string()))
    }
}

fn digest_files(files: &BTreeMap<String, StoredFile>) -> String {
    let mut hasher = Sha256::new();
    for (path, stored) in files {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(stored.content.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

// =============================================================================
// Engine (factory + test control)
// =============================================================================

/// Control handle over a live store, for the dev profile and tests.
#[derive(Clone)]
pub struct StoreControl {
    inner: Arc<Inner>,
}

impl StoreControl {
    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn connected_url(&self) -> Option<String> {
        self.inner.connected_url.lock().expect("url lock").clone()
    }

    /// Drop or restore the simulated link.
    pub fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::Release);
    }

    /// Reject the next `n` connect attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.inner.fail_connects.store(n, Ordering::Release);
    }

    /// Simulate a change arriving from the remote peer.
    pub fn remote_set_file(&self, path: &str, content: &str) {
        let path = normalize(path);
        self.inner
            .files
            .lock()
            .expect("files lock")
            .insert(path.clone(), StoredFile::text(content.to_string()));
        self.inner.notify(&path, ChangeOrigin::Remote);
    }

    /// Signal remote traffic without touching file contents.
    pub fn emit_remote_change(&self, path: &str) {
        self.inner.notify(&normalize(path), ChangeOrigin::Remote);
    }

    pub fn watcher_count(&self) -> usize {
        self.inner.watchers.lock().expect("watchers lock").len()
    }
}

/// Factory for in-memory stores; retains a control handle per instance.
#[derive(Default)]
pub struct MemoryEngine {
    controls: Mutex<Vec<StoreControl>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Control handles for every store created so far, oldest first.
    pub fn controls(&self) -> Vec<StoreControl> {
        self.controls.lock().expect("controls lock").clone()
    }

    pub fn last_control(&self) -> Option<StoreControl> {
        self.controls.lock().expect("controls lock").last().cloned()
    }
}

impl StoreFactory for MemoryEngine {
    fn from_bytes(
        &self,
        bytes: &[u8],
        config: &StoreConfig,
    ) -> Result<Box<dyn DocumentStore>, StoreError> {
        let wire: BundleWire = serde_json::from_slice(bytes)
            .map_err(|e| StoreError::InvalidBundle(e.to_string()))?;
        if wire.manifest.entrypoints.is_empty() {
            return Err(StoreError::InvalidBundle(
                "manifest has no entrypoints".to_string(),
            ));
        }

        let mut files = BTreeMap::new();
        for (path, file) in wire.files {
            let stored = match file {
                BundleFileWire::Text { text } => StoredFile::text(text),
                BundleFileWire::Binary { base64 } => {
                    let bytes = BASE64
                        .decode(base64.as_bytes())
                        .map_err(|e| StoreError::InvalidBundle(format!("{path}: {e}")))?;
                    StoredFile::binary(bytes)
                }
            };
            files.insert(normalize(&path), stored);
        }

        let root_id = match wire.manifest.root_id {
            Some(id) => id,
            None => digest_files(&files),
        };

        let inner = Arc::new(Inner {
            namespace: config.namespace.clone(),
            manifest: Manifest {
                root_id,
                entrypoints: wire.manifest.entrypoints,
                sync_endpoints: wire.manifest.sync_endpoints,
            },
            files: Mutex::new(files),
            watchers: Mutex::new(HashMap::new()),
            next_watch: AtomicU64::new(1),
            connected: AtomicBool::new(false),
            connected_url: Mutex::new(None),
            fail_connects: AtomicU32::new(0),
        });

        self.controls
            .lock()
            .expect("controls lock")
            .push(StoreControl {
                inner: Arc::clone(&inner),
            });

        Ok(Box::new(MemoryStore { inner }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn store() -> (Box<dyn DocumentStore>, StoreControl) {
        let engine = MemoryEngine::new();
        let bytes = bundle_bytes(
            &["app1"],
            &["wss://sync.example/b1"],
            &[
                ("/app1/index.html", "<html>home</html>"),
                ("/app1/notes.txt", "hello"),
                ("/app1/data/config.json", r#"{"theme":"dark"}"#),
            ],
        );
        let store = engine
            .from_bytes(
                &bytes,
                &StoreConfig {
                    namespace: "test-ns".to_string(),
                },
            )
            .expect("load bundle");
        let control = engine.last_control().expect("control");
        (store, control)
    }

    #[test]
    fn bundle_round_trip_preserves_root_id() {
        let (store, _) = store();
        let manifest = store.manifest().expect("manifest");
        let bytes = store.to_bytes().expect("to_bytes");

        let engine = MemoryEngine::new();
        let reopened = engine
            .from_bytes(
                &bytes,
                &StoreConfig {
                    namespace: "other-ns".to_string(),
                },
            )
            .expect("reopen");
        assert_eq!(reopened.manifest().expect("manifest").root_id, manifest.root_id);
    }

    #[test]
    fn read_write_exists_delete() {
        let (store, _) = store();
        assert!(store.exists("/app1/notes.txt").expect("exists"));
        assert_eq!(
            store.read_file("/app1/notes.txt").expect("read").content,
            "hello"
        );

        store.set_file("/app1/notes.txt", "updated").expect("set");
        assert_eq!(
            store.read_file("/app1/notes.txt").expect("read").content,
            "updated"
        );

        assert!(matches!(
            store.create_file("/app1/notes.txt", "dup"),
            Err(StoreError::AlreadyExists(_))
        ));

        store.delete_file("/app1/notes.txt").expect("delete");
        assert!(!store.exists("/app1/notes.txt").expect("exists"));
        assert!(matches!(
            store.read_file("/app1/notes.txt"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn update_file_reports_changed() {
        let (store, _) = store();
        assert!(!store.update_file("/app1/notes.txt", "hello").expect("update"));
        assert!(store.update_file("/app1/notes.txt", "new").expect("update"));
    }

    #[test]
    fn patch_file_descends_json_pointer() {
        let (store, _) = store();
        store
            .patch_file(
                "/app1/data/config.json",
                &["theme".to_string()],
                &serde_json::json!("light"),
            )
            .expect("patch");
        let content = store.read_file("/app1/data/config.json").expect("read").content;
        let doc: serde_json::Value = serde_json::from_str(&content).expect("json");
        assert_eq!(doc["theme"], "light");
    }

    #[test]
    fn list_directory_groups_children() {
        let (store, _) = store();
        let entries = store.list_directory("/app1").expect("list");
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["data", "index.html", "notes.txt"]);
        let data = entries.iter().find(|e| e.name == "data").expect("data");
        assert_eq!(data.kind, EntryKind::Directory);
    }

    #[test]
    fn watchers_fire_with_origin_and_stop() {
        let (store, control) = store();
        let (tx, rx) = mpsc::channel();
        let handle = store
            .watch_directory(
                "/app1",
                Box::new(move |event| {
                    let _ = tx.send((event.path, event.origin));
                }),
            )
            .expect("watch");

        store.set_file("/app1/notes.txt", "local edit").expect("set");
        assert_eq!(
            rx.recv().expect("local event"),
            ("/app1/notes.txt".to_string(), ChangeOrigin::Local)
        );

        control.remote_set_file("/app1/notes.txt", "remote edit");
        assert_eq!(
            rx.recv().expect("remote event"),
            ("/app1/notes.txt".to_string(), ChangeOrigin::Remote)
        );

        handle.stop().expect("stop");
        assert_eq!(control.watcher_count(), 0);
        store.set_file("/app1/notes.txt", "silent").expect("set");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn connect_failure_injection() {
        let (store, control) = store();
        control.fail_next_connects(1);
        assert!(store.connect_websocket("wss://sync.example/b1").is_err());
        assert!(!store.is_connected());
        store
            .connect_websocket("wss://sync.example/b1")
            .expect("second attempt succeeds");
        assert!(store.is_connected());
        assert_eq!(
            control.connected_url().as_deref(),
            Some("wss://sync.example/b1")
        );
    }
}
