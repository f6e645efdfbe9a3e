//! Binary protocol for replicated text synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id   │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ 8 bytes  │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Payloads are themselves bincode-encoded: `HelloPayload`,
//! `OperationEntry` (or a list of them for `OperationBatch`),
//! `AnnotationRecord` or `PresenceMessage` depending on `msg_type`. Anchors inside payloads travel as opaque bytes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use quire_core::{ActorId, Anchor, AnchorError, Annotation, AnnotationId, Operation, UnitId};

use crate::presence::CursorColor;

/// WebSocket close code the relay uses to reject a credential.
pub const CLOSE_UNAUTHORIZED: u16 = 4401;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client introduction with credential
    Hello = 1,
    /// Relay acknowledgement of a Hello
    Welcome = 2,
    /// One text operation
    Operation = 3,
    /// Backlog replay finished
    SyncComplete = 4,
    /// Ephemeral participant state
    Presence = 5,
    /// Annotation upsert or removal
    Annotation = 6,
    /// Peer left notification
    PeerLeft = 7,
    /// Heartbeat ping
    Ping = 8,
    /// Heartbeat pong
    Pong = 9,
    /// The operations of one local edit, applied together
    OperationBatch = 10,
}

/// Peer identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
        }
    }

    /// Stable display color derived from the peer id.
    pub fn color(&self) -> CursorColor {
        CursorColor::from_uuid(self.peer_id)
    }
}

/// Payload of a `Hello` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloPayload {
    pub peer: PeerInfo,
    pub token: Option<String>,
}

/// Operation kind on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpCode {
    Insert,
    Delete,
}

/// Wire form of one text operation.
///
/// For an insert, `(actor_id, logical_clock)` is the id of the first unit
/// in the run, `target_unit_ref` the unit it follows and `payload` the
/// text. For a delete, `target_unit_ref` is the removed unit and
/// `(actor_id, logical_clock)` stamps the sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationEntry {
    pub actor_id: ActorId,
    pub logical_clock: u64,
    pub opcode: OpCode,
    pub target_unit_ref: Option<UnitId>,
    pub payload: String,
}

impl OperationEntry {
    /// Wrap an operation produced by `actor` at `clock`.
    pub fn from_operation(actor: ActorId, clock: u64, op: &Operation) -> Self {
        match op {
            Operation::Insert { id, after, text } => Self {
                actor_id: id.actor,
                logical_clock: id.counter,
                opcode: OpCode::Insert,
                target_unit_ref: *after,
                payload: text.clone(),
            },
            Operation::Delete { target } => Self {
                actor_id: actor,
                logical_clock: clock,
                opcode: OpCode::Delete,
                target_unit_ref: Some(*target),
                payload: String::new(),
            },
        }
    }

    pub fn into_operation(self) -> Result<Operation, ProtocolError> {
        match self.opcode {
            OpCode::Insert => {
                if self.payload.is_empty() {
                    return Err(ProtocolError::InvalidPayload("empty insert".into()));
                }
                Ok(Operation::Insert {
                    id: UnitId::new(self.actor_id, self.logical_clock),
                    after: self.target_unit_ref,
                    text: self.payload,
                })
            }
            OpCode::Delete => {
                let target = self
                    .target_unit_ref
                    .ok_or_else(|| ProtocolError::InvalidPayload("delete without target".into()))?;
                Ok(Operation::Delete { target })
            }
        }
    }
}

/// Wire form of an annotation change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AnnotationRecord {
    Upsert {
        id: AnnotationId,
        anchor_bytes: Vec<u8>,
        end_anchor_bytes: Vec<u8>,
        span_length: usize,
        author: String,
        text: String,
        created_at: u64,
        resolved: bool,
        revision: u64,
        last_editor: ActorId,
    },
    Remove {
        id: AnnotationId,
    },
}

impl AnnotationRecord {
    pub fn upsert(annotation: &Annotation) -> Result<Self, AnchorError> {
        Ok(AnnotationRecord::Upsert {
            id: annotation.id,
            anchor_bytes: annotation.anchor.to_bytes()?,
            end_anchor_bytes: annotation.end_anchor.to_bytes()?,
            span_length: annotation.span_length,
            author: annotation.author.clone(),
            text: annotation.text.clone(),
            created_at: annotation.created_at,
            resolved: annotation.resolved,
            revision: annotation.revision,
            last_editor: annotation.last_editor,
        })
    }

    pub fn id(&self) -> AnnotationId {
        match self {
            AnnotationRecord::Upsert { id, .. } => *id,
            AnnotationRecord::Remove { id } => *id,
        }
    }

    /// Decode an upsert back into an annotation. `Remove` yields `None`.
    pub fn into_annotation(self) -> Result<Option<Annotation>, AnchorError> {
        match self {
            AnnotationRecord::Upsert {
                id,
                anchor_bytes,
                end_anchor_bytes,
                span_length,
                author,
                text,
                created_at,
                resolved,
                revision,
                last_editor,
            } => Ok(Some(Annotation {
                id,
                anchor: Anchor::from_bytes(&anchor_bytes)?,
                end_anchor: Anchor::from_bytes(&end_anchor_bytes)?,
                span_length,
                author,
                text,
                created_at,
                resolved,
                revision,
                last_editor,
            })),
            AnnotationRecord::Remove { .. } => Ok(None),
        }
    }
}

/// What a presence message says about its participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PresenceState {
    /// Self-introduction; answered by peers that did not know us.
    Announce { display_name: String },
    /// Cursor moved; `None` clears it.
    Cursor { anchor_bytes: Option<Vec<u8>> },
    /// Clean departure.
    Leave,
}

/// Payload of a `Presence` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceMessage {
    pub participant_id: Uuid,
    pub state: PresenceState,
}

/// Top-level protocol message.
///
/// Serialized with bincode for minimal overhead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub doc_id: Uuid,
    /// Lamport clock for causal ordering
    pub clock: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

impl SyncMessage {
    fn with_payload(msg_type: MessageType, peer_id: Uuid, doc_id: Uuid, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            doc_id,
            clock,
            payload,
        }
    }

    /// Create the client introduction.
    pub fn hello(doc_id: Uuid, hello: &HelloPayload) -> Result<Self, ProtocolError> {
        let payload = encode_payload(hello)?;
        Ok(Self::with_payload(MessageType::Hello, hello.peer.peer_id, doc_id, 0, payload))
    }

    /// Create the relay acknowledgement.
    pub fn welcome(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self::with_payload(MessageType::Welcome, peer_id, doc_id, 0, Vec::new())
    }

    /// Create an operation message.
    pub fn operation(peer_id: Uuid, doc_id: Uuid, entry: &OperationEntry) -> Result<Self, ProtocolError> {
        let payload = encode_payload(entry)?;
        Ok(Self::with_payload(
            MessageType::Operation,
            peer_id,
            doc_id,
            entry.logical_clock,
            payload,
        ))
    }

    /// Create one frame carrying every operation of a local edit.
    ///
    /// The relay records and replays it as a unit, so a peer never sees
    /// half of an edit.
    pub fn operations(peer_id: Uuid, doc_id: Uuid, entries: &[OperationEntry]) -> Result<Self, ProtocolError> {
        let clock = entries.iter().map(|e| e.logical_clock).max().unwrap_or(0);
        let payload = encode_payload(&entries)?;
        Ok(Self::with_payload(MessageType::OperationBatch, peer_id, doc_id, clock, payload))
    }

    /// Create the end-of-backlog marker.
    pub fn sync_complete(doc_id: Uuid) -> Self {
        Self::with_payload(MessageType::SyncComplete, Uuid::nil(), doc_id, 0, Vec::new())
    }

    /// Create a presence message.
    pub fn presence(peer_id: Uuid, doc_id: Uuid, message: &PresenceMessage) -> Result<Self, ProtocolError> {
        let payload = encode_payload(message)?;
        Ok(Self::with_payload(MessageType::Presence, peer_id, doc_id, 0, payload))
    }

    /// Create an annotation message.
    pub fn annotation(
        peer_id: Uuid,
        doc_id: Uuid,
        clock: u64,
        record: &AnnotationRecord,
    ) -> Result<Self, ProtocolError> {
        let payload = encode_payload(record)?;
        Ok(Self::with_payload(MessageType::Annotation, peer_id, doc_id, clock, payload))
    }

    /// Create a peer left notification.
    pub fn peer_left(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self::with_payload(MessageType::PeerLeft, peer_id, doc_id, 0, Vec::new())
    }

    /// Create a ping message.
    pub fn ping(peer_id: Uuid) -> Self {
        Self::with_payload(MessageType::Ping, peer_id, Uuid::nil(), 0, Vec::new())
    }

    /// Create a pong message.
    pub fn pong(peer_id: Uuid) -> Self {
        Self::with_payload(MessageType::Pong, peer_id, Uuid::nil(), 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_payload(bytes)
    }

    fn expect_type(&self, msg_type: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type != msg_type {
            return Err(ProtocolError::InvalidMessageType);
        }
        Ok(())
    }

    /// Parse hello payload.
    pub fn hello_payload(&self) -> Result<HelloPayload, ProtocolError> {
        self.expect_type(MessageType::Hello)?;
        decode_payload(&self.payload)
    }

    /// Parse operation payload.
    pub fn operation_entry(&self) -> Result<OperationEntry, ProtocolError> {
        self.expect_type(MessageType::Operation)?;
        decode_payload(&self.payload)
    }

    /// Parse a batched operation payload.
    pub fn operation_batch(&self) -> Result<Vec<OperationEntry>, ProtocolError> {
        self.expect_type(MessageType::OperationBatch)?;
        decode_payload(&self.payload)
    }

    /// Whether the relay keeps this message in the document backlog.
    pub fn is_durable(&self) -> bool {
        matches!(
            self.msg_type,
            MessageType::Operation | MessageType::OperationBatch | MessageType::Annotation
        )
    }

    /// Parse presence payload.
    pub fn presence_message(&self) -> Result<PresenceMessage, ProtocolError> {
        self.expect_type(MessageType::Presence)?;
        decode_payload(&self.payload)
    }

    /// Parse annotation payload.
    pub fn annotation_record(&self) -> Result<AnnotationRecord, ProtocolError> {
        self.expect_type(MessageType::Annotation)?;
        decode_payload(&self.payload)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    InvalidPayload(String),
    ConnectionClosed,
    /// The outgoing channel is full.
    QueueFull,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::InvalidPayload(e) => write!(f, "Invalid payload: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::QueueFull => write!(f, "Outgoing queue full"),
        }
    }
}

impl std::error::Error for ProtocolError {}
