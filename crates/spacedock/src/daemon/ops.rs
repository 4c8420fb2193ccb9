//! Operation errors and their wire mapping.

use thiserror::Error;

use spacedock_surface::ipc::{ErrorCode, ErrorPayload};

use super::LauncherBundleId;
use crate::store::StoreError;

/// Errors surfaced by daemon operations.
///
/// Handlers never let a store failure escape unhandled: everything a client
/// can trigger lands here and maps onto a typed wire payload.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum OpError {
    /// Operation attempted against a bundle that is not Active.
    #[error("bundle not active: {0}")]
    NotInitialized(LauncherBundleId),

    /// Store failure, wrapped with the attempted operation and path.
    #[error("{op} failed at {path}: {source}")]
    Store {
        op: &'static str,
        path: String,
        #[source]
        source: StoreError,
    },

    /// Websocket connect or health failure.
    #[error("connection failure for {bundle}: {reason}")]
    Connection {
        bundle: LauncherBundleId,
        reason: String,
    },

    /// A bounded wait expired.
    #[error("timed out after {waited_ms}ms waiting for {what}")]
    Timeout { what: &'static str, waited_ms: u64 },

    /// A load attempt failed; a later `loadBundle` may retry.
    #[error("bundle load failed for {bundle}: {reason}")]
    LoadFailed {
        bundle: LauncherBundleId,
        reason: String,
    },

    #[error("invalid request: {reason}")]
    InvalidRequest {
        field: Option<String>,
        reason: String,
    },
}

impl OpError {
    pub fn store(op: &'static str, path: impl Into<String>, source: StoreError) -> Self {
        OpError::Store {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            OpError::NotInitialized(_) => ErrorCode::NotInitialized,
            OpError::Store { .. } => ErrorCode::StoreError,
            OpError::Connection { .. } => ErrorCode::ConnectionError,
            OpError::Timeout { .. } => ErrorCode::Timeout,
            OpError::LoadFailed { .. } => ErrorCode::BundleLoadFailed,
            OpError::InvalidRequest { .. } => ErrorCode::InvalidRequest,
        }
    }

    /// Whether retrying the operation may succeed without intervention.
    pub fn retryable(&self) -> bool {
        match self {
            OpError::NotInitialized(_)
            | OpError::Connection { .. }
            | OpError::Timeout { .. }
            | OpError::LoadFailed { .. } => true,
            OpError::InvalidRequest { .. } => false,
            OpError::Store { source, .. } => matches!(
                source,
                StoreError::ConnectFailed(_) | StoreError::Engine(_)
            ),
        }
    }

    pub fn into_error_payload(self) -> ErrorPayload {
        ErrorPayload::new(self.code(), self.to_string(), self.retryable())
    }
}
