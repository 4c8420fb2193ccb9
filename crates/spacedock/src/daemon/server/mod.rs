//! Server thread loops.
//!
//! Three kinds of threads:
//! - Socket acceptor - accepts connections, spawns per-client handlers
//! - Client handlers - a reader shuttling requests in, a writer draining
//!   the client's outbound channel (responses and notifications share it)
//! - State thread - owns the Daemon, processes events sequentially

mod socket;
mod state_loop;

use crossbeam::channel::Sender;

use spacedock_surface::ipc::{Notification, Request, Response};

use super::{ClientId, WatchSignal};

pub(in crate::daemon) use socket::accept_loop;
pub(in crate::daemon) use state_loop::run_state_loop;

/// Message sent from the state thread to one client's writer.
#[derive(Debug)]
pub enum Outbound {
    Response(Response),
    Notification(Notification),
}

/// Everything the state thread reacts to.
pub enum ServerEvent {
    /// A client connection opened; `tx` feeds its writer thread.
    Connected {
        client: ClientId,
        tx: Sender<Outbound>,
    },
    Request {
        client: ClientId,
        request: Request,
    },
    /// The client's socket closed; its watchers must be purged.
    Disconnected { client: ClientId },
    /// A store change callback, rehomed from the engine.
    Watch(WatchSignal),
}
