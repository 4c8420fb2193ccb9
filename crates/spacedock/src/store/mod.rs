//! Document store adapter.
//!
//! The synchronization engine (CRDT merge, operation log, wire protocol) is
//! external; this module is the typed seam the daemon consumes it through.
//! A store instance is created only by a `StoreFactory` and owned
//! exclusively by its bundle's `Active` registry entry.

pub mod memory;

use std::fmt;

use thiserror::Error;

pub use memory::MemoryEngine;

/// Storage isolation settings for a new store instance.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Namespace the engine keys its persistence under. Two stores with
    /// different namespaces never observe each other's data.
    pub namespace: String,
}

/// Bundle metadata, immutable once obtained.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    /// Content-addressed root identifier.
    pub root_id: String,
    /// Entrypoint application slugs; the first is the default.
    pub entrypoints: Vec<String>,
    /// Network URIs a sync endpoint may be derived from.
    pub sync_endpoints: Vec<String>,
}

impl Manifest {
    pub fn default_app_slug(&self) -> Option<&str> {
        self.entrypoints.first().map(String::as_str)
    }
}

/// Payload of a read. `content` is always present; binary files carry raw
/// bytes, or base64-encode them into `content` with the flag set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileContent {
    pub content: String,
    pub bytes: Option<Vec<u8>>,
    /// True when `content` is a base64 encoding of binary data.
    pub base64: bool,
}

impl FileContent {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            bytes: None,
            base64: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: Option<u64>,
}

/// Where a change originated. Remote-origin changes are the signal that the
/// path index has synchronized from a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

#[derive(Clone, Debug)]
pub struct ChangeEvent {
    pub path: String,
    pub origin: ChangeOrigin,
}

pub type WatchCallback = Box<dyn Fn(ChangeEvent) + Send + Sync>;

/// Live subscription handle. Dropping without `stop` leaks the engine-side
/// watcher, so owners stop explicitly during teardown.
pub struct WatchHandle {
    stop: Option<Box<dyn FnOnce() -> Result<(), StoreError> + Send>>,
}

impl WatchHandle {
    pub fn new(stop: impl FnOnce() -> Result<(), StoreError> + Send + 'static) -> Self {
        Self {
            stop: Some(Box::new(stop)),
        }
    }

    pub fn stop(mut self) -> Result<(), StoreError> {
        match self.stop.take() {
            Some(stop) => stop(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("stopped", &self.stop.is_none())
            .finish()
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("file already exists: {0}")]
    AlreadyExists(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("invalid bundle bytes: {0}")]
    InvalidBundle(String),

    #[error("invalid patch at {path}: {reason}")]
    InvalidPatch { path: String, reason: String },

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("engine failure: {0}")]
    Engine(String),
}

/// The file-like surface of one synchronized document store.
pub trait DocumentStore: Send {
    fn connect_websocket(&self, url: &str) -> Result<(), StoreError>;
    fn is_connected(&self) -> bool;

    fn exists(&self, path: &str) -> Result<bool, StoreError>;
    fn read_file(&self, path: &str) -> Result<FileContent, StoreError>;
    fn create_file(&self, path: &str, content: &str) -> Result<(), StoreError>;
    fn set_file(&self, path: &str, content: &str) -> Result<(), StoreError>;
    fn create_file_with_bytes(&self, path: &str, bytes: &[u8]) -> Result<(), StoreError>;
    fn set_file_with_bytes(&self, path: &str, bytes: &[u8]) -> Result<(), StoreError>;
    /// Write only if different; reports whether anything changed.
    fn update_file(&self, path: &str, content: &str) -> Result<bool, StoreError>;
    /// Patch a JSON document at the given pointer segments.
    fn patch_file(
        &self,
        path: &str,
        pointer: &[String],
        value: &serde_json::Value,
    ) -> Result<(), StoreError>;
    fn delete_file(&self, path: &str) -> Result<(), StoreError>;
    fn rename(&self, old_path: &str, new_path: &str) -> Result<(), StoreError>;
    fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>, StoreError>;

    fn watch_file(&self, path: &str, callback: WatchCallback) -> Result<WatchHandle, StoreError>;
    fn watch_directory(
        &self,
        path: &str,
        callback: WatchCallback,
    ) -> Result<WatchHandle, StoreError>;

    fn manifest(&self) -> Result<Manifest, StoreError>;
    fn to_bytes(&self) -> Result<Vec<u8>, StoreError>;
    /// Serialize a detached copy with fresh identity.
    fn fork_to_bytes(&self) -> Result<Vec<u8>, StoreError>;
}

/// The only component allowed to create store instances.
pub trait StoreFactory: Send + Sync {
    fn from_bytes(
        &self,
        bytes: &[u8],
        config: &StoreConfig,
    ) -> Result<Box<dyn DocumentStore>, StoreError>;
}
