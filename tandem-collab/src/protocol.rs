//! Binary wire protocol between replicas and the relay.
//!
//! Frame layout:
//! ```text
//! ┌──────────────┬─────────┬──────────────────────────┐
//! │ length (BE)  │ tag     │ payload (bincode)        │
//! │ 4 bytes      │ 1 byte  │ length - 1 bytes         │
//! └──────────────┴─────────┴──────────────────────────┘
//! ```
//!
//! `length` covers the tag and payload. Payloads are decoded field by field
//! with `decode_from_slice`, so a newer peer may append fields and older
//! peers simply ignore the trailing bytes.
//!
//! Handshake:
//! ```text
//! client                              relay
//!   │ ── HELLO{doc, token, id, sv} ──►  │
//!   │ ◄── UPDATE{relay delta} ───────   │  (omitted when empty)
//!   │ ◄── SYNC_STEP{relay sv} ───────   │
//!   │ ── UPDATE{client delta} ──────►   │  (omitted when empty)
//!   │ ── PRESENCE{id, entry} ───────►   │
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use tandem_core::{Op, ReplicaId, StateVector};
use thiserror::Error;

use crate::presence::PresenceEntry;

/// Size of the length prefix.
pub const LENGTH_PREFIX: usize = 4;

/// Largest accepted frame body (tag + payload).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Message type tag, the first byte of every frame body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 1,
    SyncStep = 2,
    Update = 3,
    Presence = 4,
    Ping = 5,
    Pong = 6,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Ok(match tag {
            1 => Self::Hello,
            2 => Self::SyncStep,
            3 => Self::Update,
            4 => Self::Presence,
            5 => Self::Ping,
            6 => Self::Pong,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// First message on a connection.
    Hello {
        doc_id: String,
        /// Opaque credential, validated by the relay only.
        auth_token: String,
        replica_id: ReplicaId,
        state_vector: StateVector,
    },
    /// Sender's state vector; completes the handshake.
    SyncStep { state_vector: StateVector },
    Update { ops: Vec<Op> },
    /// `entry: None` means the peer left.
    Presence {
        replica_id: ReplicaId,
        entry: Option<PresenceEntry>,
    },
    Ping,
    Pong,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello { .. } => MessageType::Hello,
            Message::SyncStep { .. } => MessageType::SyncStep,
            Message::Update { .. } => MessageType::Update,
            Message::Presence { .. } => MessageType::Presence,
            Message::Ping => MessageType::Ping,
            Message::Pong => MessageType::Pong,
        }
    }

    /// Serialize to a length-prefixed frame.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let payload = match self {
            Message::Hello {
                doc_id,
                auth_token,
                replica_id,
                state_vector,
            } => to_payload(&(doc_id, auth_token, replica_id, state_vector))?,
            Message::SyncStep { state_vector } => to_payload(state_vector)?,
            Message::Update { ops } => to_payload(ops)?,
            Message::Presence { replica_id, entry } => to_payload(&(replica_id, entry))?,
            Message::Ping | Message::Pong => Vec::new(),
        };

        let body_len = payload.len() + 1;
        if body_len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(body_len));
        }

        let mut frame = Vec::with_capacity(LENGTH_PREFIX + body_len);
        frame.extend_from_slice(&(body_len as u32).to_be_bytes());
        frame.push(self.message_type() as u8);
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Parse one frame. Bytes after the frame's declared length are ignored.
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let body_len = frame_len(frame)?.ok_or(ProtocolError::Truncated {
            needed: LENGTH_PREFIX,
            available: frame.len(),
        })?;
        let available = frame.len() - LENGTH_PREFIX;
        if available < body_len {
            return Err(ProtocolError::Truncated {
                needed: body_len,
                available,
            });
        }

        let body = &frame[LENGTH_PREFIX..LENGTH_PREFIX + body_len];
        let (&tag, payload) = body.split_first().ok_or(ProtocolError::EmptyFrame)?;

        Ok(match MessageType::try_from(tag)? {
            MessageType::Hello => {
                let (doc_id, auth_token, replica_id, state_vector) = from_payload(payload)?;
                Message::Hello {
                    doc_id,
                    auth_token,
                    replica_id,
                    state_vector,
                }
            }
            MessageType::SyncStep => Message::SyncStep {
                state_vector: from_payload(payload)?,
            },
            MessageType::Update => Message::Update {
                ops: from_payload(payload)?,
            },
            MessageType::Presence => {
                let (replica_id, entry) = from_payload(payload)?;
                Message::Presence { replica_id, entry }
            }
            MessageType::Ping => Message::Ping,
            MessageType::Pong => Message::Pong,
        })
    }
}

fn to_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Encode(e.to_string()))
}

fn from_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(payload, bincode::config::standard())
        .map_err(|e| ProtocolError::Decode(e.to_string()))?;
    Ok(value)
}

/// Read the length prefix; `None` if fewer than four bytes are present.
fn frame_len(bytes: &[u8]) -> Result<Option<usize>, ProtocolError> {
    let Some(prefix) = bytes.get(..LENGTH_PREFIX) else {
        return Ok(None);
    };
    let mut len = [0u8; LENGTH_PREFIX];
    len.copy_from_slice(prefix);
    let len = u32::from_be_bytes(len) as usize;
    if len == 0 {
        return Err(ProtocolError::EmptyFrame);
    }
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    Ok(Some(len))
}

/// Reassembles frames from a byte stream.
///
/// Both WebSocket readers run every binary message through one of these, so
/// a peer may pack several frames into a message or split one across many.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, prefix included.
    ///
    /// A bad length prefix cannot be resynchronized, so the buffer is
    /// cleared before the error is returned.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let len = match frame_len(&self.buf) {
            Ok(Some(len)) => len,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.buf.clear();
                return Err(e);
            }
        };
        let total = LENGTH_PREFIX + len;
        if self.buf.len() < total {
            return Ok(None);
        }
        let rest = self.buf.split_off(total);
        Ok(Some(std::mem::replace(&mut self.buf, rest)))
    }

    /// Bytes buffered but not yet returned.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("empty frame")]
    EmptyFrame,

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::Selection;
    use tandem_core::Replica;

    fn sample_ops() -> Vec<Op> {
        let mut r = Replica::random();
        let mut ops = r.insert(0, "héllo").unwrap();
        ops.extend(r.delete(1..2).unwrap());
        ops
    }

    fn roundtrip(msg: &Message) -> Message {
        Message::decode(&msg.encode().unwrap()).unwrap()
    }

    #[test]
    fn test_hello_roundtrip() {
        let replica = Replica::from_text(ReplicaId::random(), "seed");
        let msg = Message::Hello {
            doc_id: "notes/today".into(),
            auth_token: "secret".into(),
            replica_id: replica.id(),
            state_vector: replica.state_vector(),
        };
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_update_roundtrip() {
        let msg = Message::Update { ops: sample_ops() };
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_presence_roundtrip() {
        let id = ReplicaId::random();
        let mut entry = PresenceEntry::new(id, "Alice");
        entry.cursor = 12;
        entry.selection = Some(Selection::new(4, 12));
        let set = Message::Presence {
            replica_id: id,
            entry: Some(entry),
        };
        let left = Message::Presence {
            replica_id: id,
            entry: None,
        };
        assert_eq!(roundtrip(&set), set);
        assert_eq!(roundtrip(&left), left);
    }

    #[test]
    fn test_keepalive_frames_are_five_bytes() {
        let ping = Message::Ping.encode().unwrap();
        assert_eq!(ping, vec![0, 0, 0, 1, MessageType::Ping as u8]);
        assert_eq!(roundtrip(&Message::Pong), Message::Pong);
    }

    #[test]
    fn test_length_prefix_is_big_endian() {
        let frame = Message::Update { ops: sample_ops() }.encode().unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - LENGTH_PREFIX);
        assert_eq!(frame[4], 3);
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Hello as u8, 1);
        assert_eq!(MessageType::SyncStep as u8, 2);
        assert_eq!(MessageType::Update as u8, 3);
        assert_eq!(MessageType::Presence as u8, 4);
        assert_eq!(MessageType::Ping as u8, 5);
        assert_eq!(MessageType::Pong as u8, 6);
    }

    #[test]
    fn test_unknown_tag() {
        let frame = vec![0, 0, 0, 3, 42, 1, 2];
        assert_eq!(
            Message::decode(&frame),
            Err(ProtocolError::UnknownMessageType(42))
        );
    }

    #[test]
    fn test_truncated_frames() {
        assert!(matches!(
            Message::decode(&[0, 0]),
            Err(ProtocolError::Truncated { .. })
        ));

        let frame = Message::Update { ops: sample_ops() }.encode().unwrap();
        assert_eq!(
            Message::decode(&frame[..frame.len() - 1]),
            Err(ProtocolError::Truncated {
                needed: frame.len() - LENGTH_PREFIX,
                available: frame.len() - LENGTH_PREFIX - 1,
            })
        );
    }

    #[test]
    fn test_trailing_payload_bytes_ignored() {
        let sv: StateVector = [(ReplicaId::random(), 3)].into_iter().collect();
        let msg = Message::SyncStep { state_vector: sv };
        let mut frame = msg.encode().unwrap();

        // A newer peer appended a field to the payload
        frame.extend_from_slice(&[7, 7, 7]);
        let len = (frame.len() - LENGTH_PREFIX) as u32;
        frame[..LENGTH_PREFIX].copy_from_slice(&len.to_be_bytes());

        assert_eq!(Message::decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_bytes_after_frame_ignored() {
        let mut frame = Message::Ping.encode().unwrap();
        frame.extend_from_slice(&Message::Pong.encode().unwrap());
        assert_eq!(Message::decode(&frame).unwrap(), Message::Ping);
    }

    #[test]
    fn test_garbage_payload_is_decode_error() {
        let frame = vec![0, 0, 0, 4, MessageType::Update as u8, 0xff, 0xff, 0xff];
        assert!(matches!(
            Message::decode(&frame),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn test_empty_frame_rejected() {
        assert_eq!(
            Message::decode(&[0, 0, 0, 0]),
            Err(ProtocolError::EmptyFrame)
        );
    }

    #[test]
    fn test_frame_buffer_reassembles_split_stream() {
        let a = Message::Update { ops: sample_ops() }.encode().unwrap();
        let b = Message::Ping.encode().unwrap();
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        let mut buf = FrameBuffer::new();
        let (head, tail) = stream.split_at(3);
        buf.extend(head);
        assert_eq!(buf.next_frame().unwrap(), None);
        buf.extend(tail);

        assert_eq!(buf.next_frame().unwrap(), Some(a));
        assert_eq!(buf.next_frame().unwrap(), Some(b));
        assert_eq!(buf.next_frame().unwrap(), None);
        assert_eq!(buf.buffered(), 0);
    }

    #[test]
    fn test_frame_buffer_rejects_oversized() {
        let mut buf = FrameBuffer::new();
        buf.extend(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes());
        assert!(matches!(
            buf.next_frame(),
            Err(ProtocolError::FrameTooLarge(_))
        ));
        assert_eq!(buf.buffered(), 0);
    }

    #[test]
    fn test_update_size_is_compact() {
        let msg = Message::Update { ops: sample_ops() };
        let frame = msg.encode().unwrap();
        // Two 16-byte replica ids per op dominate; counters are varints
        assert!(frame.len() < 6 * 48, "frame is {} bytes", frame.len());
    }
}
