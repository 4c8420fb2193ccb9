//! Socket acceptor and per-client handler threads.

use std::io::{BufRead, BufReader};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam::channel::Sender;

use spacedock_surface::ipc::{Response, decode_request, send_message};

use super::{Outbound, ServerEvent};
use crate::daemon::ClientId;

/// Accept connections until the shutdown flag flips.
///
/// The listener runs non-blocking with a short poll so shutdown does not
/// hang on a final `accept`.
pub(in crate::daemon) fn accept_loop(
    listener: UnixListener,
    event_tx: Sender<ServerEvent>,
    shutdown: Arc<AtomicBool>,
) {
    if let Err(err) = listener.set_nonblocking(true) {
        tracing::error!("listener nonblocking failed: {err}");
        return;
    }

    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                let event_tx = event_tx.clone();
                thread::spawn(move || handle_client(stream, event_tx));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                tracing::error!("accept failed: {e}");
                break;
            }
        }
    }
}

/// Handle a single client connection.
///
/// A writer thread drains the client's outbound channel (responses and
/// notifications share it); this thread reads request lines and rehomes
/// them onto the state thread.
pub(in crate::daemon) fn handle_client(stream: UnixStream, event_tx: Sender<ServerEvent>) {
    let client = ClientId::new();

    let reader = match stream.try_clone() {
        Ok(r) => BufReader::new(r),
        Err(e) => {
            tracing::error!(client = %client, "failed to clone stream: {e}");
            return;
        }
    };

    let (out_tx, out_rx) = crossbeam::channel::unbounded::<Outbound>();
    let mut writer = stream;
    let writer_join = thread::spawn(move || {
        while let Ok(message) = out_rx.recv() {
            let result = match &message {
                Outbound::Response(response) => send_message(&mut writer, response),
                Outbound::Notification(notification) => send_message(&mut writer, notification),
            };
            if result.is_err() {
                // Client went away; the reader will notice EOF and tell the
                // state thread.
                break;
            }
        }
    });

    if event_tx
        .send(ServerEvent::Connected {
            client,
            tx: out_tx.clone(),
        })
        .is_err()
    {
        return; // State thread died.
    }

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break, // Client disconnected.
        };
        if line.trim().is_empty() {
            continue;
        }

        let request = match decode_request(line.trim()) {
            Ok(request) => request,
            Err(err) => {
                // Undecodable frames are answered here; the state thread
                // never sees them.
                let response =
                    Response::err("unknown", None, err.into_error_payload());
                if out_tx.send(Outbound::Response(response)).is_err() {
                    break;
                }
                continue;
            }
        };

        if event_tx
            .send(ServerEvent::Request { client, request })
            .is_err()
        {
            break; // State thread died.
        }
    }

    let _ = event_tx.send(ServerEvent::Disconnected { client });
    // Dropping our sender ends the writer once the state thread drops its
    // clone from the client table.
    drop(out_tx);
    let _ = writer_join.join();
}
