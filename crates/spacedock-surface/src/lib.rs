#![forbid(unsafe_code)]

//! Wire surface shared by the spacedock daemon, its client library, and the
//! CLI. Nothing here touches daemon internals; it is types plus codec.

pub mod ipc;

pub use ipc::{
    ErrorCode, ErrorPayload, IpcError, Notification, Request, Response, ServerMessage,
};
