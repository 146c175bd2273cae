//! Newline-framed JSON over a reliable byte stream.
//!
//! Every message is one UTF-8 JSON object followed by a single LF. A
//! per-connection `FrameBuffer` accumulates bytes and yields complete frames;
//! the buffer is capped so a peer cannot grow it without bound. The cap comes
//! from `Config::max_frame_bytes`; [`MAX_FRAME_BYTES`] is its default.

use memchr::memchr;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Default cap on a single frame and on the undelimited tail of the buffer.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

pub fn encode_frame<T: Serialize>(message: &T, max_bytes: usize) -> Result<Vec<u8>> {
    let mut encoded = serde_json::to_vec(message)?;
    if encoded.len() > max_bytes {
        return Err(Error::Transport(format!(
            "frame exceeds {max_bytes} bytes (got {})",
            encoded.len()
        )));
    }
    encoded.push(b'\n');
    Ok(encoded)
}

/// Decode one frame from `input`. Returns the message and the number of bytes
/// consumed, or `None` when no terminator has arrived yet.
pub fn decode_frame<T: DeserializeOwned>(
    input: &[u8],
    max_bytes: usize,
) -> Result<Option<(T, usize)>> {
    match memchr(b'\n', input) {
        Some(newline_idx) => {
            if newline_idx > max_bytes {
                return Err(Error::Transport(format!(
                    "frame exceeds {max_bytes} bytes (got {newline_idx})"
                )));
            }
            let decoded = serde_json::from_slice::<T>(&input[..newline_idx])?;
            Ok(Some((decoded, newline_idx + 1)))
        }
        None => {
            if input.len() > max_bytes {
                return Err(Error::Transport(format!(
                    "frame exceeds {max_bytes} bytes without terminator"
                )));
            }
            Ok(None)
        }
    }
}

/// Per-connection receive buffer.
///
/// `Error::Json` from `next_frame` means one malformed line was consumed; the
/// connection stays usable and the caller should log and poll again.
/// `Error::Transport` means the cap was blown and the connection must drop.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_bytes: usize,
}

impl FrameBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_bytes,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match memchr(b'\n', &self.buf) {
            Some(newline_idx) => {
                if newline_idx > self.max_bytes {
                    return Err(Error::Transport(format!(
                        "frame exceeds {} bytes (got {newline_idx})",
                        self.max_bytes
                    )));
                }
                let parsed = serde_json::from_slice::<T>(&self.buf[..newline_idx]);
                self.buf.drain(..=newline_idx);
                match parsed {
                    Ok(message) => Ok(Some(message)),
                    Err(e) => Err(Error::Json(e)),
                }
            }
            None => {
                if self.buf.len() > self.max_bytes {
                    return Err(Error::Transport(format!(
                        "receive buffer exceeds {} bytes without terminator",
                        self.max_bytes
                    )));
                }
                Ok(None)
            }
        }
    }

    /// Bytes of an unterminated trailing frame, discarded on connection close.
    pub fn take_partial(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(MAX_FRAME_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_encode_decode_roundtrip() {
        let message = json!({"kind": "PING"});
        let encoded = encode_frame(&message, MAX_FRAME_BYTES).unwrap();
        assert_eq!(*encoded.last().unwrap(), b'\n');

        let (decoded, consumed) = decode_frame::<Value>(&encoded, MAX_FRAME_BYTES)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, message);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_decode_partial_returns_none() {
        let partial = br#"{"kind":"PING""#;
        assert!(decode_frame::<Value>(partial, MAX_FRAME_BYTES)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_decode_rejects_oversize_before_parse() {
        let mut oversized = vec![b'x'; MAX_FRAME_BYTES + 1];
        oversized.push(b'\n');
        let err = decode_frame::<Value>(&oversized, MAX_FRAME_BYTES).unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn test_encode_honors_configured_cap() {
        let message = json!({"payload": "x".repeat(64)});
        assert!(encode_frame(&message, MAX_FRAME_BYTES).is_ok());
        let err = encode_frame(&message, 16).unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn test_buffer_accepts_frame_at_exactly_max_bytes() {
        // A JSON string whose serialized form is exactly MAX_FRAME_BYTES.
        let payload = "a".repeat(MAX_FRAME_BYTES - 2);
        let mut frame = serde_json::to_vec(&payload).unwrap();
        assert_eq!(frame.len(), MAX_FRAME_BYTES);
        frame.push(b'\n');

        let mut buffer = FrameBuffer::new(MAX_FRAME_BYTES);
        buffer.extend(&frame);
        let decoded: String = buffer.next_frame().unwrap().unwrap();
        assert_eq!(decoded.len(), MAX_FRAME_BYTES - 2);
    }

    #[test]
    fn test_buffer_rejects_one_byte_over_cap() {
        let mut buffer = FrameBuffer::new(MAX_FRAME_BYTES);
        buffer.extend(&vec![b'x'; MAX_FRAME_BYTES + 1]);
        let err = buffer.next_frame::<Value>().unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn test_buffer_cap_is_configurable() {
        let mut buffer = FrameBuffer::new(32);
        buffer.extend(&vec![b'x'; 33]);
        let err = buffer.next_frame::<Value>().unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn test_buffer_survives_malformed_line() {
        let mut buffer = FrameBuffer::new(MAX_FRAME_BYTES);
        buffer.extend(b"{not json}\n");
        buffer.extend(&encode_frame(&json!({"kind": "PONG"}), MAX_FRAME_BYTES).unwrap());

        let err = buffer.next_frame::<Value>().unwrap_err();
        assert!(matches!(err, Error::Json(_)));

        // The bad line was consumed; the next frame decodes normally.
        let frame: Value = buffer.next_frame().unwrap().unwrap();
        assert_eq!(frame["kind"], "PONG");
    }

    #[test]
    fn test_buffer_yields_frames_across_split_reads() {
        let first = encode_frame(&json!({"n": 1}), MAX_FRAME_BYTES).unwrap();
        let second = encode_frame(&json!({"n": 2}), MAX_FRAME_BYTES).unwrap();
        let mut joined = first.clone();
        joined.extend_from_slice(&second);

        let mut buffer = FrameBuffer::default();
        // Feed in awkward chunk sizes to exercise reassembly.
        for chunk in joined.chunks(7) {
            buffer.extend(chunk);
        }

        let a: Value = buffer.next_frame().unwrap().unwrap();
        let b: Value = buffer.next_frame().unwrap().unwrap();
        assert_eq!(a["n"], 1);
        assert_eq!(b["n"], 2);
        assert!(buffer.next_frame::<Value>().unwrap().is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_take_partial_discards_tail() {
        let mut buffer = FrameBuffer::new(MAX_FRAME_BYTES);
        buffer.extend(b"{\"half\":");
        let partial = buffer.take_partial();
        assert_eq!(partial, b"{\"half\":");
        assert!(buffer.is_empty());
    }
}
