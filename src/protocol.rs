//! Binary protocol spoken over a workspace link.
//!
//! Messages are serialized with bincode and framed as
//! `[version u8][message type u8][payload length u24][payload]`.
//! A payload that does not fit one frame is split: every piece but the last
//! travels as a [`MessageType::Fragment`] frame and the last one carries the
//! real type. [`FrameAssembler`] puts them back together.
//! Request/response traffic (listing, creating, joining) goes through the
//! [`Transport`](crate::transport::Transport) methods instead; the link only
//! carries the streaming traffic: operations, acknowledgements, cursors and
//! workspace notifications.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, Cursor};
use uuid::Uuid;

use crate::buffer::{OpId, Operation, ReplicaSnapshot, VersionVector};
use crate::cursor::CursorState;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum frame size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Maximum size of a message reassembled from fragments (256MB)
pub const MAX_ASSEMBLED_SIZE: usize = 256 * 1024 * 1024;

const HEADER_LEN: usize = 5;

const MAX_PAYLOAD: usize = MAX_MESSAGE_SIZE - HEADER_LEN;

/// Message type identifiers for efficient binary encoding
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Connection
    Goodbye = 0x03,
    Error = 0x04,
    Fragment = 0x05,

    // Buffer replication
    Attach = 0x10,
    Detach = 0x11,
    Operation = 0x12,
    Ack = 0x13,
    BufferVersion = 0x14,
    Watermark = 0x15,
    ResyncRequest = 0x16,
    Snapshot = 0x17,

    // Workspace notifications
    MemberJoined = 0x20,
    MemberLeft = 0x21,
    BufferCreated = 0x22,
    BufferDeleted = 0x23,
    BufferRenamed = 0x24,

    // Presence
    CursorUpdate = 0x42,
    CursorBroadcast = 0x43,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x03 => Ok(MessageType::Goodbye),
            0x04 => Ok(MessageType::Error),
            0x05 => Ok(MessageType::Fragment),
            0x10 => Ok(MessageType::Attach),
            0x11 => Ok(MessageType::Detach),
            0x12 => Ok(MessageType::Operation),
            0x13 => Ok(MessageType::Ack),
            0x14 => Ok(MessageType::BufferVersion),
            0x15 => Ok(MessageType::Watermark),
            0x16 => Ok(MessageType::ResyncRequest),
            0x17 => Ok(MessageType::Snapshot),
            0x20 => Ok(MessageType::MemberJoined),
            0x21 => Ok(MessageType::MemberLeft),
            0x22 => Ok(MessageType::BufferCreated),
            0x23 => Ok(MessageType::BufferDeleted),
            0x24 => Ok(MessageType::BufferRenamed),
            0x42 => Ok(MessageType::CursorUpdate),
            0x43 => Ok(MessageType::CursorBroadcast),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Version mismatch: expected {0}, got {1}")]
    VersionMismatch(u8, u8),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        ProtocolError::Io(err.to_string())
    }
}

/// A member of a workspace as seen by everyone else
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: Uuid,
    pub name: String,
    pub color: String,
    /// Milliseconds since epoch
    pub joined_at: i64,
}

/// Messages sent from a client to the authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Graceful disconnect
    Goodbye { reason: Option<String> },

    /// Start replicating a buffer; answered with a snapshot
    Attach { buffer: String },

    /// Stop replicating a buffer
    Detach { buffer: String },

    /// A locally generated operation
    Operation { buffer: String, op: Operation },

    /// Everything this client has integrated, for watermark computation
    BufferVersion { buffer: String, version: VersionVector },

    /// The local replica is inconsistent; send an authoritative snapshot
    ResyncRequest { buffer: String },

    /// Local cursor moved
    CursorUpdate { state: CursorState },
}

/// Messages sent from the authority to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Error response
    Error {
        code: ErrorCode,
        message: String,
        buffer: Option<String>,
    },

    /// The authority is closing the link
    Goodbye { reason: Option<String> },

    /// Authoritative state of a buffer
    Snapshot {
        buffer: String,
        snapshot: ReplicaSnapshot,
    },

    /// Operation relayed from another member
    Operation { buffer: String, op: Operation },

    /// The authority accepted an operation authored by the receiver
    Ack { buffer: String, id: OpId },

    /// Version every attached member has integrated
    Watermark { buffer: String, version: VersionVector },

    /// Notification that a member joined
    MemberJoined { member: Member },

    /// Notification that a member left
    MemberLeft { member: Member },

    BufferCreated { path: String },

    BufferDeleted { path: String },

    BufferRenamed { from: String, to: String },

    /// Cursor broadcast from another member
    CursorBroadcast { user: Uuid, state: CursorState },
}

/// Error codes for server responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    Unknown = 0,
    InvalidMessage = 1,
    Unauthorized = 2,
    BufferNotFound = 4,
    ServerError = 6,
    VersionMismatch = 7,
    NotAttached = 10,
    Integrity = 11,
}

/// Protocol codec for encoding/decoding messages
pub struct SyncProtocol;

impl SyncProtocol {
    /// Encode a client message to a single frame
    pub fn encode_client(msg: &ClientMessage) -> Result<Bytes, ProtocolError> {
        Self::frame(Self::client_type(msg), &bincode::serialize(msg)?)
    }

    /// Encode a client message, split across as many frames as it needs
    pub fn encode_client_frames(msg: &ClientMessage) -> Result<Vec<Bytes>, ProtocolError> {
        Self::frames(Self::client_type(msg), &bincode::serialize(msg)?)
    }

    /// Encode a server message to a single frame
    pub fn encode_server(msg: &ServerMessage) -> Result<Bytes, ProtocolError> {
        Self::frame(Self::server_type(msg), &bincode::serialize(msg)?)
    }

    /// Encode a server message, split across as many frames as it needs
    pub fn encode_server_frames(msg: &ServerMessage) -> Result<Vec<Bytes>, ProtocolError> {
        Self::frames(Self::server_type(msg), &bincode::serialize(msg)?)
    }

    fn client_type(msg: &ClientMessage) -> MessageType {
        match msg {
            ClientMessage::Goodbye { .. } => MessageType::Goodbye,
            ClientMessage::Attach { .. } => MessageType::Attach,
            ClientMessage::Detach { .. } => MessageType::Detach,
            ClientMessage::Operation { .. } => MessageType::Operation,
            ClientMessage::BufferVersion { .. } => MessageType::BufferVersion,
            ClientMessage::ResyncRequest { .. } => MessageType::ResyncRequest,
            ClientMessage::CursorUpdate { .. } => MessageType::CursorUpdate,
        }
    }

    fn server_type(msg: &ServerMessage) -> MessageType {
        match msg {
            ServerMessage::Error { .. } => MessageType::Error,
            ServerMessage::Goodbye { .. } => MessageType::Goodbye,
            ServerMessage::Snapshot { .. } => MessageType::Snapshot,
            ServerMessage::Operation { .. } => MessageType::Operation,
            ServerMessage::Ack { .. } => MessageType::Ack,
            ServerMessage::Watermark { .. } => MessageType::Watermark,
            ServerMessage::MemberJoined { .. } => MessageType::MemberJoined,
            ServerMessage::MemberLeft { .. } => MessageType::MemberLeft,
            ServerMessage::BufferCreated { .. } => MessageType::BufferCreated,
            ServerMessage::BufferDeleted { .. } => MessageType::BufferDeleted,
            ServerMessage::BufferRenamed { .. } => MessageType::BufferRenamed,
            ServerMessage::CursorBroadcast { .. } => MessageType::CursorBroadcast,
        }
    }

    /// Decode a client message from bytes
    pub fn decode_client(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
        let (_, payload) = Self::unframe(data)?;
        Ok(bincode::deserialize(payload)?)
    }

    /// Decode a server message from bytes
    pub fn decode_server(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
        let (_, payload) = Self::unframe(data)?;
        Ok(bincode::deserialize(payload)?)
    }

    /// Read the message type of a frame without decoding its payload
    pub fn peek_type(data: &[u8]) -> Result<MessageType, ProtocolError> {
        Self::unframe(data).map(|(msg_type, _)| msg_type)
    }

    /// Create an error response message
    pub fn error_response(
        code: ErrorCode,
        message: impl Into<String>,
        buffer: Option<String>,
    ) -> ServerMessage {
        ServerMessage::Error {
            code,
            message: message.into(),
            buffer,
        }
    }

    fn frame(msg_type: MessageType, payload: &[u8]) -> Result<Bytes, ProtocolError> {
        if payload.len() + HEADER_LEN > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(
                payload.len() + HEADER_LEN,
                MAX_MESSAGE_SIZE,
            ));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(msg_type as u8);
        buf.put_u24(payload.len() as u32);
        buf.put_slice(payload);

        Ok(buf.freeze())
    }

    fn frames(msg_type: MessageType, payload: &[u8]) -> Result<Vec<Bytes>, ProtocolError> {
        if payload.len() > MAX_ASSEMBLED_SIZE {
            return Err(ProtocolError::MessageTooLarge(payload.len(), MAX_ASSEMBLED_SIZE));
        }
        if payload.len() <= MAX_PAYLOAD {
            return Ok(vec![Self::frame(msg_type, payload)?]);
        }

        let pieces = payload.len().div_ceil(MAX_PAYLOAD);
        payload
            .chunks(MAX_PAYLOAD)
            .enumerate()
            .map(|(index, chunk)| {
                let piece_type = if index + 1 == pieces {
                    msg_type
                } else {
                    MessageType::Fragment
                };
                Self::frame(piece_type, chunk)
            })
            .collect()
    }

    fn unframe(data: &[u8]) -> Result<(MessageType, &[u8]), ProtocolError> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::InvalidFormat(
                "Message too short".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let version = cursor.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, version));
        }

        let msg_type = MessageType::try_from(cursor.get_u8())?;
        let payload_len = cursor.get_uint(3) as usize;

        if data.len() < HEADER_LEN + payload_len {
            return Err(ProtocolError::InvalidFormat(format!(
                "Expected {} bytes, got {}",
                HEADER_LEN + payload_len,
                data.len()
            )));
        }

        Ok((msg_type, &data[HEADER_LEN..HEADER_LEN + payload_len]))
    }
}

/// Reassembles messages split across frames.
///
/// One assembler per direction of a link: fragments of a message are sent
/// back to back, so the next non-fragment frame completes it.
#[derive(Debug)]
pub struct FrameAssembler {
    partial: BytesMut,
    limit: usize,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::with_limit(MAX_ASSEMBLED_SIZE)
    }
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            partial: BytesMut::new(),
            limit,
        }
    }

    /// Feed a frame from a client; yields the message once complete
    pub fn push_client(&mut self, data: &[u8]) -> Result<Option<ClientMessage>, ProtocolError> {
        self.push(data)
    }

    /// Feed a frame from the authority; yields the message once complete
    pub fn push_server(&mut self, data: &[u8]) -> Result<Option<ServerMessage>, ProtocolError> {
        self.push(data)
    }

    /// No message is half received
    pub fn is_idle(&self) -> bool {
        self.partial.is_empty()
    }

    fn push<T: DeserializeOwned>(&mut self, data: &[u8]) -> Result<Option<T>, ProtocolError> {
        let (msg_type, payload) = SyncProtocol::unframe(data)?;

        let size = self.partial.len() + payload.len();
        if size > self.limit {
            self.partial.clear();
            return Err(ProtocolError::MessageTooLarge(size, self.limit));
        }
        if msg_type == MessageType::Fragment {
            self.partial.extend_from_slice(payload);
            return Ok(None);
        }
        if self.partial.is_empty() {
            return Ok(Some(bincode::deserialize(payload)?));
        }

        self.partial.extend_from_slice(payload);
        let message = self.partial.split();
        Ok(Some(bincode::deserialize(&message)?))
    }
}

/// Extension trait for writing u24 values
trait BufMutExt {
    fn put_u24(&mut self, n: u32);
}

impl BufMutExt for BytesMut {
    fn put_u24(&mut self, n: u32) {
        self.put_u8((n >> 16) as u8);
        self.put_u8((n >> 8) as u8);
        self.put_u8(n as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::OpKind;

    #[test]
    fn test_encode_decode_operation() {
        let author = Uuid::new_v4();
        let op = Operation {
            id: OpId::new(author, 1),
            version: VersionVector::new(),
            kind: OpKind::Insert {
                origin_left: None,
                origin_right: None,
                content: "hello".to_string(),
            },
        };
        let msg = ClientMessage::Operation {
            buffer: "src/main.rs".to_string(),
            op,
        };

        let encoded = SyncProtocol::encode_client(&msg).unwrap();
        assert_eq!(encoded[0], PROTOCOL_VERSION);
        assert_eq!(encoded[1], MessageType::Operation as u8);

        let decoded = SyncProtocol::decode_client(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_encode_decode_cursor_broadcast() {
        let msg = ServerMessage::CursorBroadcast {
            user: Uuid::new_v4(),
            state: CursorState::new("notes.txt", 3, 7),
        };

        let encoded = SyncProtocol::encode_server(&msg).unwrap();
        assert_eq!(
            SyncProtocol::peek_type(&encoded).unwrap(),
            MessageType::CursorBroadcast
        );
        assert_eq!(SyncProtocol::decode_server(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_version_mismatch() {
        let msg = ClientMessage::Attach {
            buffer: "a.txt".into(),
        };
        let mut encoded = SyncProtocol::encode_client(&msg).unwrap().to_vec();
        encoded[0] = 99;

        let result = SyncProtocol::decode_client(&encoded);
        assert_eq!(result, Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, 99)));
    }

    #[test]
    fn test_unknown_message_type() {
        let msg = ClientMessage::Detach {
            buffer: "a.txt".into(),
        };
        let mut encoded = SyncProtocol::encode_client(&msg).unwrap().to_vec();
        encoded[1] = 0xEE;

        assert_eq!(
            SyncProtocol::decode_client(&encoded),
            Err(ProtocolError::UnknownMessageType(0xEE))
        );
    }

    #[test]
    fn test_message_too_short() {
        let result = SyncProtocol::decode_client(&[1, 2, 3]);
        assert!(matches!(result, Err(ProtocolError::InvalidFormat(_))));
    }

    #[test]
    fn test_truncated_payload() {
        let msg = ServerMessage::BufferCreated {
            path: "docs/readme.md".into(),
        };
        let encoded = SyncProtocol::encode_server(&msg).unwrap();
        let result = SyncProtocol::decode_server(&encoded[..encoded.len() - 2]);
        assert!(matches!(result, Err(ProtocolError::InvalidFormat(_))));
    }

    #[test]
    fn test_oversized_message_is_fragmented() {
        let author = Uuid::new_v4();
        let msg = ClientMessage::Operation {
            buffer: "big.txt".into(),
            op: Operation {
                id: OpId::new(author, 1),
                version: VersionVector::new(),
                kind: OpKind::Insert {
                    origin_left: None,
                    origin_right: None,
                    content: "x".repeat(MAX_MESSAGE_SIZE + 1024),
                },
            },
        };
        assert!(matches!(
            SyncProtocol::encode_client(&msg),
            Err(ProtocolError::MessageTooLarge(_, MAX_MESSAGE_SIZE))
        ));

        let frames = SyncProtocol::encode_client_frames(&msg).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() <= MAX_MESSAGE_SIZE));
        assert_eq!(SyncProtocol::peek_type(&frames[0]).unwrap(), MessageType::Fragment);
        assert_eq!(SyncProtocol::peek_type(&frames[1]).unwrap(), MessageType::Operation);

        let mut assembler = FrameAssembler::new();
        assert_eq!(assembler.push_client(&frames[0]).unwrap(), None);
        assert!(!assembler.is_idle());
        assert_eq!(assembler.push_client(&frames[1]).unwrap(), Some(msg));
        assert!(assembler.is_idle());
    }

    #[test]
    fn test_assembler_passes_single_frames_through() {
        let msg = ServerMessage::BufferDeleted {
            path: "old.txt".into(),
        };
        let frames = SyncProtocol::encode_server_frames(&msg).unwrap();
        assert_eq!(frames.len(), 1);

        let mut assembler = FrameAssembler::new();
        assert_eq!(assembler.push_server(&frames[0]).unwrap(), Some(msg));
    }

    #[test]
    fn test_assembler_limit() {
        let piece = SyncProtocol::frame(MessageType::Fragment, &[0u8; 64]).unwrap();
        let mut assembler = FrameAssembler::with_limit(100);

        assert_eq!(assembler.push_client(&piece).unwrap(), None);
        assert_eq!(
            assembler.push_client(&piece),
            Err(ProtocolError::MessageTooLarge(128, 100))
        );
        assert!(assembler.is_idle());
    }

    #[test]
    fn test_large_buffer_snapshot_fits_one_frame() {
        let mut replica = crate::buffer::Replica::new(Uuid::new_v4());
        let text = "fn main() {}\n".repeat(25_000);
        replica.local_change(&crate::buffer::TextChange::insertion(0, text.clone()));
        replica.local_change(&crate::buffer::TextChange::deletion(0..text.len()));

        let msg = ServerMessage::Snapshot {
            buffer: "big.rs".into(),
            snapshot: replica.snapshot(),
        };
        let frames = SyncProtocol::encode_server_frames(&msg).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].len() < 2 * text.len());
        assert_eq!(SyncProtocol::decode_server(&frames[0]).unwrap(), msg);
    }

    #[test]
    fn test_u24_encoding() {
        let mut buf = BytesMut::new();
        buf.put_u24(0x123456);
        assert_eq!(buf.as_ref(), &[0x12, 0x34, 0x56]);
    }
}
