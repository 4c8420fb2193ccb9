//! IPC protocol types and codec.
//!
//! Protocol: newline-delimited JSON (ndjson) over a Unix socket, camelCase
//! on the wire. Request format: `{"type": "readFile", "id": "...", ...}\n`.
//! Responses echo the request type and correlation id with
//! `success`/`data`/`error`; notifications carry no id.

pub mod client;
pub mod codec;
pub mod types;

use std::path::PathBuf;

use thiserror::Error;

pub use client::IpcClient;
pub use codec::{MAX_FRAME_BYTES, decode, decode_request, encode, send_message};
pub use types::{
    BundleCtx, BundleStatusInfo, ChangeOriginWire, Ctx, DirEntryInfo, EntryKindWire, ErrorCode,
    ErrorPayload, FetchPayload, ManifestInfo, Notification, Request, RequestInfo, Response,
    ResponseData, ServerMessage, WriteMode, PROTOCOL_VERSION,
};

pub const SOCKET_FILE: &str = "spacedockd.sock";

/// Runtime directory for the daemon socket.
///
/// Priority: `SPACEDOCK_RUNTIME_DIR`, then `XDG_RUNTIME_DIR/spacedock`,
/// then a uid-scoped tmp dir.
pub fn runtime_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SPACEDOCK_RUNTIME_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(xdg) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(xdg).join("spacedock");
    }
    let uid = std::env::var("UID").unwrap_or_else(|_| "0".to_string());
    std::env::temp_dir().join(format!("spacedock-{uid}"))
}

pub fn socket_path() -> PathBuf {
    runtime_dir().join(SOCKET_FILE)
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IpcError {
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid request: {reason}")]
    InvalidRequest {
        field: Option<String>,
        reason: String,
    },

    #[error("client disconnected")]
    Disconnected,

    #[error("daemon unavailable: {0}")]
    DaemonUnavailable(String),

    #[error("frame too large: max {max_bytes} bytes, got {got_bytes} bytes")]
    FrameTooLarge { max_bytes: usize, got_bytes: usize },
}

impl IpcError {
    pub fn code(&self) -> ErrorCode {
        match self {
            IpcError::Parse(_) => ErrorCode::MalformedPayload,
            IpcError::Io(_) => ErrorCode::IoError,
            IpcError::InvalidRequest { .. } => ErrorCode::InvalidRequest,
            IpcError::Disconnected => ErrorCode::Disconnected,
            IpcError::DaemonUnavailable(_) => ErrorCode::DaemonUnavailable,
            IpcError::FrameTooLarge { .. } => ErrorCode::FrameTooLarge,
        }
    }

    /// Whether retrying the IPC operation may succeed.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            IpcError::Io(_) | IpcError::Disconnected | IpcError::DaemonUnavailable(_)
        )
    }

    pub fn into_error_payload(self) -> ErrorPayload {
        ErrorPayload {
            code: self.code(),
            message: self.to_string(),
            retryable: self.retryable(),
        }
    }
}
