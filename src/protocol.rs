//! Client wire protocol.
//!
//! Every message on the local socket is framed as three little-endian
//! `u32`s followed by the payload:
//!
//! ```text
//! [message_id][command_id][payload_len][payload bytes]
//! ```
//!
//! `message_id` correlates a command with its completion; notifications
//! pushed by the server carry their own command id and a message id of
//! zero. Payloads are bincode records; the entity payloads reuse the
//! pipeline's [`Command`](crate::pipeline::Command) encoding, so the
//! listener can hand them to the inbound queue unparsed.

use bytes::{Buf, BufMut, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::notification::Notification;
use crate::queue::FlushKind;
use crate::sync::Inspection;
use crate::types::{EntityType, Revision};

/// Size of the fixed frame header.
pub const HEADER_SIZE: usize = 12;

/// Well-known command ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandId {
    /// Placeholder for unrecognized ids.
    Unknown = 0,
    /// Server → client: a command finished.
    CommandCompletion = 1,
    /// Client → server: first message on a connection.
    Handshake = 2,
    /// Server → client: the store advanced to a new revision.
    RevisionUpdate = 3,
    /// Client → server: trigger a synchronization.
    Synchronize = 4,
    /// Client → server: delete an entity.
    DeleteEntity = 5,
    /// Client → server: modify an entity.
    ModifyEntity = 6,
    /// Client → server: create an entity.
    CreateEntity = 7,
    /// Client → server: shut the worker down.
    Shutdown = 8,
    /// Server → client: a pushed notification.
    Notification = 9,
    /// Client → server: liveness probe.
    Ping = 10,
    /// Server → client: a local revision was replayed to the source.
    RevisionReplayed = 11,
    /// Client → server: run an inspection.
    Inspection = 12,
    /// Client → server: install a flush barrier.
    Flush = 13,
    /// Client → server: provide a secret.
    Secret = 14,
    /// Client → server: upgrade the storage format.
    Upgrade = 15,
}

impl CommandId {
    /// Decodes a wire command id.
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            1 => Self::CommandCompletion,
            2 => Self::Handshake,
            3 => Self::RevisionUpdate,
            4 => Self::Synchronize,
            5 => Self::DeleteEntity,
            6 => Self::ModifyEntity,
            7 => Self::CreateEntity,
            8 => Self::Shutdown,
            9 => Self::Notification,
            10 => Self::Ping,
            11 => Self::RevisionReplayed,
            12 => Self::Inspection,
            13 => Self::Flush,
            14 => Self::Secret,
            15 => Self::Upgrade,
            _ => Self::Unknown,
        }
    }

    /// Human-readable name for logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::CommandCompletion => "CommandCompletion",
            Self::Handshake => "Handshake",
            Self::RevisionUpdate => "RevisionUpdate",
            Self::Synchronize => "Synchronize",
            Self::DeleteEntity => "DeleteEntity",
            Self::ModifyEntity => "ModifyEntity",
            Self::CreateEntity => "CreateEntity",
            Self::Shutdown => "Shutdown",
            Self::Notification => "Notification",
            Self::Ping => "Ping",
            Self::RevisionReplayed => "RevisionReplayed",
            Self::Inspection => "Inspection",
            Self::Flush => "Flush",
            Self::Secret => "Secret",
            Self::Upgrade => "Upgrade",
        }
    }
}

/// One framed message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Client-chosen correlation id.
    pub message_id: u32,
    /// Raw command id (see [`CommandId::from_u32`]).
    pub command_id: u32,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Builds a frame with an encoded payload.
    pub fn new(message_id: u32, command: CommandId, payload: Vec<u8>) -> Self {
        Self {
            message_id,
            command_id: command as u32,
            payload,
        }
    }

    /// The decoded command id.
    pub fn command(&self) -> CommandId {
        CommandId::from_u32(self.command_id)
    }
}

/// Length-prefixed frame codec with a maximum-frame guard.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Creates a codec rejecting frames larger than `max_frame_size`
    /// (header included).
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<Frame>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &src[..HEADER_SIZE];
        let message_id = header.get_u32_le();
        let command_id = header.get_u32_le();
        let payload_len = header.get_u32_le() as usize;

        if HEADER_SIZE + payload_len > self.max_frame_size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds the maximum", payload_len),
            ));
        }
        if src.len() < HEADER_SIZE + payload_len {
            // Reserve what we know is coming.
            src.reserve(HEADER_SIZE + payload_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(payload_len).to_vec();
        Ok(Some(Frame {
            message_id,
            command_id,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> std::io::Result<()> {
        if HEADER_SIZE + frame.payload.len() > self.max_frame_size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "frame exceeds the maximum",
            ));
        }
        dst.reserve(HEADER_SIZE + frame.payload.len());
        dst.put_u32_le(frame.message_id);
        dst.put_u32_le(frame.command_id);
        dst.put_u32_le(frame.payload.len() as u32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Encodes a payload record.
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    bincode::serialize(payload)
        .map_err(|e| Error::invalid_payload(format!("unencodable payload: {}", e)))
}

/// Decodes a payload record.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|e| Error::invalid_payload(format!("undecodable payload: {}", e)))
}

/// First message a client sends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakePayload {
    /// Client name, for diagnostics.
    pub name: String,
}

/// Completion of a previously sent command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandCompletionPayload {
    /// The message id of the completed command.
    pub completed_message_id: u32,
    /// Whether the command succeeded.
    pub success: bool,
    /// Short failure description, empty on success.
    pub message: String,
}

/// Synchronization trigger.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SynchronizePayload {
    /// Types to synchronize; empty means everything.
    pub entity_types: Vec<EntityType>,
}

/// Flush barrier installation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushPayload {
    /// Barrier id echoed by the completion notification.
    pub id: String,
    /// Which queue the barrier waits for.
    pub kind: FlushKind,
}

/// Secret provision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretPayload {
    /// The secret for this resource instance.
    pub secret: String,
}

/// Inspection request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InspectionPayload {
    /// The inspection to run.
    pub inspection: Inspection,
}

/// Revision carried by revision-update / revision-replayed pushes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionPayload {
    /// The revision.
    pub revision: Revision,
}

/// A pushed notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    /// The notification.
    pub notification: Notification,
}
