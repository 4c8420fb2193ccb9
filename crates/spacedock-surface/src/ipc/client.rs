//! Blocking IPC client used by the CLI and by integration tests.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, ErrorKind};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use super::codec::send_message;
use super::types::{Notification, Request, Response, ServerMessage};
use super::IpcError;

pub struct IpcClient {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
    /// Notifications that arrived while waiting on a response.
    pending: VecDeque<Notification>,
}

impl IpcClient {
    pub fn connect(path: &Path) -> Result<Self, IpcError> {
        let stream = UnixStream::connect(path)
            .map_err(|e| IpcError::DaemonUnavailable(format!("{}: {e}", path.display())))?;
        let reader = stream.try_clone().map(BufReader::new)?;
        Ok(Self {
            reader,
            writer: stream,
            pending: VecDeque::new(),
        })
    }

    /// Send a request and block until its response arrives. Notifications
    /// received in the meantime are queued for `next_notification`.
    pub fn request(&mut self, request: &Request) -> Result<Response, IpcError> {
        self.writer.set_read_timeout(None).ok();
        send_message(&mut self.writer, request)?;
        loop {
            match self.read_message()? {
                ServerMessage::Response(response) => return Ok(response),
                ServerMessage::Notification(notification) => {
                    self.pending.push_back(notification);
                }
            }
        }
    }

    /// Next queued or incoming notification, or `None` once `timeout`
    /// passes without one.
    pub fn next_notification(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Notification>, IpcError> {
        if let Some(notification) = self.pending.pop_front() {
            return Ok(Some(notification));
        }
        self.reader.get_ref().set_read_timeout(Some(timeout))?;
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => Err(IpcError::Disconnected),
            Ok(_) => match serde_json::from_str(line.trim())? {
                ServerMessage::Notification(notification) => Ok(Some(notification)),
                // A response with no in-flight request is a protocol slip on
                // the daemon's side; surface it rather than hide it.
                ServerMessage::Response(_) => Err(IpcError::InvalidRequest {
                    field: None,
                    reason: "unexpected response while idle".to_string(),
                }),
            },
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_message(&mut self) -> Result<ServerMessage, IpcError> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self.reader.read_line(&mut line)?;
            if n == 0 {
                return Err(IpcError::Disconnected);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(serde_json::from_str(trimmed)?);
        }
    }
}
