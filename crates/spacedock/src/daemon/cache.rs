//! Durable resume cache.
//!
//! A small set of independently-keyed values surviving daemon restarts:
//! enough to reconstruct the last active bundle without a client reload.
//! Each key is one file under the cache dir, written atomically
//! (tmp + rename) only after the corresponding in-memory transition
//! succeeded, and cleared as a unit when the daemon goes idle.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

pub const KEY_LAST_BUNDLE_ID: &str = "last-bundle-id";
pub const KEY_APP_SLUG: &str = "app-slug";
pub const KEY_WS_URL: &str = "ws-url";
pub const KEY_NAMESPACE: &str = "namespace";
pub const KEY_BUNDLE_BYTES: &str = "bundle.bin";
pub const KEY_BUNDLE_SHA256: &str = "bundle.sha256";

const ALL_KEYS: [&str; 6] = [
    KEY_LAST_BUNDLE_ID,
    KEY_APP_SLUG,
    KEY_WS_URL,
    KEY_NAMESPACE,
    KEY_BUNDLE_BYTES,
    KEY_BUNDLE_SHA256,
];

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cache corrupt: {reason}")]
    Corrupt { reason: String },
}

/// Everything needed to resume the last active bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeRecord {
    pub launcher_bundle_id: String,
    pub app_slug: String,
    pub ws_url: String,
    pub namespace: String,
    pub bundle_bytes: Vec<u8>,
}

pub struct DurableCache {
    dir: PathBuf,
}

impl DurableCache {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| CacheError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn set_text(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.write_atomic(key, value.as_bytes())
    }

    pub fn get_text(&self, key: &str) -> Result<Option<String>, CacheError> {
        match fs::read_to_string(self.key_path(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CacheError::Io {
                path: self.key_path(key),
                source,
            }),
        }
    }

    /// Store the raw bundle bytes with an integrity checksum alongside.
    pub fn set_bundle_bytes(&self, bytes: &[u8]) -> Result<(), CacheError> {
        self.write_atomic(KEY_BUNDLE_BYTES, bytes)?;
        let digest = hex::encode(Sha256::digest(bytes));
        self.write_atomic(KEY_BUNDLE_SHA256, digest.as_bytes())
    }

    pub fn get_bundle_bytes(&self) -> Result<Option<Vec<u8>>, CacheError> {
        let bytes = match fs::read(self.key_path(KEY_BUNDLE_BYTES)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CacheError::Io {
                    path: self.key_path(KEY_BUNDLE_BYTES),
                    source,
                });
            }
        };
        let Some(expected) = self.get_text(KEY_BUNDLE_SHA256)? else {
            return Err(CacheError::Corrupt {
                reason: "bundle bytes present without checksum".to_string(),
            });
        };
        let actual = hex::encode(Sha256::digest(&bytes));
        if actual != expected.trim() {
            return Err(CacheError::Corrupt {
                reason: "bundle bytes checksum mismatch".to_string(),
            });
        }
        Ok(Some(bytes))
    }

    pub fn remove(&self, key: &str) -> Result<(), CacheError> {
        match fs::remove_file(self.key_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CacheError::Io {
                path: self.key_path(key),
                source,
            }),
        }
    }

    /// Drop the whole record. Removal failures are logged, not propagated:
    /// a clear runs on teardown paths that must not themselves fail.
    pub fn clear(&self) {
        for key in ALL_KEYS {
            if let Err(err) = self.remove(key) {
                tracing::warn!(key, "cache clear failed: {err}");
            }
        }
    }

    /// Persist the full record for a freshly activated bundle.
    pub fn store_record(&self, record: &ResumeRecord) -> Result<(), CacheError> {
        self.set_bundle_bytes(&record.bundle_bytes)?;
        self.set_text(KEY_WS_URL, &record.ws_url)?;
        self.set_text(KEY_NAMESPACE, &record.namespace)?;
        self.set_text(KEY_APP_SLUG, &record.app_slug)?;
        // Written last: its presence marks the record complete.
        self.set_text(KEY_LAST_BUNDLE_ID, &record.launcher_bundle_id)
    }

    /// Load the record if present and whole.
    pub fn load_record(&self) -> Result<Option<ResumeRecord>, CacheError> {
        let Some(launcher_bundle_id) = self.get_text(KEY_LAST_BUNDLE_ID)? else {
            return Ok(None);
        };
        let missing = |key: &str| CacheError::Corrupt {
            reason: format!("resume record missing {key}"),
        };
        let app_slug = self.get_text(KEY_APP_SLUG)?.ok_or_else(|| missing(KEY_APP_SLUG))?;
        let ws_url = self.get_text(KEY_WS_URL)?.ok_or_else(|| missing(KEY_WS_URL))?;
        let namespace = self
            .get_text(KEY_NAMESPACE)?
            .ok_or_else(|| missing(KEY_NAMESPACE))?;
        let bundle_bytes = self
            .get_bundle_bytes()?
            .ok_or_else(|| missing(KEY_BUNDLE_BYTES))?;
        Ok(Some(ResumeRecord {
            launcher_bundle_id,
            app_slug,
            ws_url,
            namespace,
            bundle_bytes,
        }))
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    fn write_atomic(&self, key: &str, bytes: &[u8]) -> Result<(), CacheError> {
        let path = self.key_path(key);
        let tmp = self.dir.join(format!(".{key}.tmp"));
        fs::write(&tmp, bytes).map_err(|source| CacheError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| CacheError::Io { path, source })
    }
}
