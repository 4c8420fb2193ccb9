//! The state thread loop.
//!
//! THE serialization point: all registry transitions, watch routing, and
//! timer handling happen here, one event at a time. The loop parks in
//! `select!` until the next event or the earliest pending deadline.

use std::time::Instant;

use crossbeam::channel::Receiver;

use super::ServerEvent;
use crate::daemon::core::Daemon;

pub(in crate::daemon) fn run_state_loop(mut daemon: Daemon, event_rx: Receiver<ServerEvent>) {
    loop {
        let tick = match daemon.next_deadline() {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                crossbeam::channel::after(wait)
            }
            None => crossbeam::channel::never(),
        };

        crossbeam::select! {
            recv(event_rx) -> event => {
                match event {
                    Ok(event) => daemon.handle_event(event),
                    // All senders gone: acceptor and clients are down.
                    Err(_) => break,
                }
            }
            recv(tick) -> _ => {
                daemon.handle_due(Instant::now());
            }
        }

        if daemon.shutdown_requested() {
            tracing::info!("state loop stopping");
            break;
        }
    }
}
