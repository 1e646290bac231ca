//! Framing & Codec (C1): the mixed text/binary wire format over the client channel.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TAG_CLIENT_INPUT: u8 = 0x01;
pub const TAG_HOST_DATA: u8 = 0x02;
pub const TAG_RESIZE: u8 = 0x03;
pub const TAG_PONG: u8 = 0x10;
pub const TAG_CONNECTED: u8 = 0x11;
pub const TAG_NETWORK_LATENCY: u8 = 0x12;
/// SFTP file chunk during download/download-folder; the `sessionId` slot of
/// the binary envelope carries the `operationId` instead, since chunks are
/// addressed per-operation rather than per-shell-session.
pub const TAG_SFTP_CHUNK: u8 = 0x13;

/// The decoded text frame envelope (`{type, data, version?, timestamp?, requestId?}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl TextFrame {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            version: None,
            timestamp: None,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }
}

/// The decoded binary frame: `[tag][sessionId_len][sessionId][payload]`.
#[derive(Debug, Clone)]
pub struct BinaryFrame {
    pub tag: u8,
    pub session_id: String,
    pub payload: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("session id is not valid utf-8")]
    InvalidSessionId,
}

impl BinaryFrame {
    pub fn new(tag: u8, session_id: impl Into<String>, payload: Bytes) -> Self {
        Self {
            tag,
            session_id: session_id.into(),
            payload,
        }
    }

    /// Decodes `[tag][len][sessionId][payload]`. Never panics on malformed
    /// input; short frames are rejected with `FrameError::TooShort`.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < 2 {
            return Err(FrameError::TooShort {
                expected: 2,
                actual: buf.len(),
            });
        }
        let tag = buf[0];
        let len = buf[1] as usize;
        let header = 2 + len;
        if buf.len() < header {
            return Err(FrameError::TooShort {
                expected: header,
                actual: buf.len(),
            });
        }
        let session_id = std::str::from_utf8(&buf[2..header])
            .map_err(|_| FrameError::InvalidSessionId)?
            .to_string();
        let payload = Bytes::copy_from_slice(&buf[header..]);
        Ok(Self {
            tag,
            session_id,
            payload,
        })
    }

    pub fn encode(&self) -> Bytes {
        let session_bytes = self.session_id.as_bytes();
        let len = session_bytes.len().min(u8::MAX as usize);
        let mut out = BytesMut::with_capacity(2 + len + self.payload.len());
        out.put_u8(self.tag);
        out.put_u8(len as u8);
        out.put_slice(&session_bytes[..len]);
        out.put_slice(&self.payload);
        out.freeze()
    }

    pub fn resize_payload(cols: u32, rows: u32) -> Bytes {
        let mut out = BytesMut::with_capacity(8);
        out.put_u32_le(cols);
        out.put_u32_le(rows);
        out.freeze()
    }

    pub fn decode_resize(payload: &[u8]) -> Option<(u32, u32)> {
        if payload.len() < 8 {
            return None;
        }
        let cols = u32::from_le_bytes(payload[0..4].try_into().ok()?);
        let rows = u32::from_le_bytes(payload[4..8].try_into().ok()?);
        Some((cols, rows))
    }
}

/// Either decoded channel message, returned by [`decode`].
pub enum ChannelFrame {
    Text(TextFrame),
    Binary(BinaryFrame),
}

pub fn decode_text(raw: &str) -> Result<TextFrame, serde_json::Error> {
    serde_json::from_str(raw)
}

pub fn encode_text(frame: &TextFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_frame_round_trips() {
        let frame = BinaryFrame::new(TAG_CLIENT_INPUT, "s1", Bytes::from_static(b"ls\n"));
        let encoded = frame.encode();
        let decoded = BinaryFrame::decode(&encoded).unwrap();
        assert_eq!(decoded.tag, TAG_CLIENT_INPUT);
        assert_eq!(decoded.session_id, "s1");
        assert_eq!(decoded.payload.as_ref(), b"ls\n");
    }

    #[test]
    fn short_frame_is_rejected_not_panicked() {
        assert!(BinaryFrame::decode(&[]).is_err());
        assert!(BinaryFrame::decode(&[0x01]).is_err());
        assert!(BinaryFrame::decode(&[0x01, 5, b's' as u8]).is_err());
    }

    #[test]
    fn resize_payload_round_trips() {
        let payload = BinaryFrame::resize_payload(120, 40);
        let (cols, rows) = BinaryFrame::decode_resize(&payload).unwrap();
        assert_eq!((cols, rows), (120, 40));
    }

    #[test]
    fn text_frame_round_trips_through_json() {
        let frame = TextFrame::new("ping", serde_json::json!({"webSocketLatency": 12}));
        let encoded = encode_text(&frame).unwrap();
        let decoded = decode_text(&encoded).unwrap();
        assert_eq!(decoded.kind, "ping");
    }
}
