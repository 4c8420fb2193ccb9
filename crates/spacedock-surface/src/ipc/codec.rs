use std::io::Write;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::IpcError;
use super::types::Request;

/// Upper bound on a single ndjson frame. Bundle bytes travel inline as hex,
/// so this is sized for bundles, not chat.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Decode one request line, enforcing the frame limit.
pub fn decode_request(line: &str) -> Result<Request, IpcError> {
    if line.len() > MAX_FRAME_BYTES {
        return Err(IpcError::FrameTooLarge {
            max_bytes: MAX_FRAME_BYTES,
            got_bytes: line.len(),
        });
    }
    Ok(serde_json::from_str(line)?)
}

/// Write one frame followed by a newline and flush.
pub fn send_message<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<(), IpcError> {
    let mut bytes = encode(value)?;
    bytes.push(b'\n');
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::types::{Ctx, Request};

    #[test]
    fn decode_request_rejects_garbage() {
        assert!(matches!(
            decode_request("not json"),
            Err(IpcError::Parse(_))
        ));
    }

    #[test]
    fn send_message_appends_newline() {
        let mut out = Vec::new();
        let request = Request::Ping { ctx: Ctx::default() };
        send_message(&mut out, &request).expect("send");
        assert_eq!(out.last(), Some(&b'\n'));
        let decoded = decode_request(std::str::from_utf8(&out).unwrap().trim()).expect("decode");
        assert_eq!(decoded.info().op, "ping");
    }
}
