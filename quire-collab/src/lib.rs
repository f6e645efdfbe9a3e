//! # quire-collab — Transport and session layer for Quire
//!
//! Ships replicated-text operations, annotations and presence between
//! participants over a WebSocket relay.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐     WebSocket      ┌─────────────┐
//! │ EditorSession │                    │ SyncServer  │
//! │  SyncClient   │ ◄────────────────► │  (relay)    │
//! │  (per user)   │    Binary Proto    └──────┬──────┘
//! └──────┬────────┘                           │
//!        │                            ┌───────┴───────┐
//!        ▼                            │ BroadcastGroup│
//! ┌──────────────────┐                │ + backlog     │
//! │ CollaborationEng │                └───────────────┘
//! │ (quire-core)     │
//! └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded SyncMessage)
//! - [`session`] — Connection lifecycle state machine with backoff
//! - [`client`] — WebSocket sync client with offline queue
//! - [`presence`] — Ephemeral participant state and cursor colors
//! - [`broadcast`] — Room-based fan-out with a durable backlog
//! - [`server`] — WebSocket relay
//! - [`editor`] — Session facade for the UI layer

pub mod protocol;
pub mod session;
pub mod broadcast;
pub mod server;
pub mod client;
pub mod presence;
pub mod editor;

// Re-exports for convenience
pub use protocol::{
    AnnotationRecord, HelloPayload, MessageType, OpCode, OperationEntry, PeerInfo,
    PresenceMessage, PresenceState, ProtocolError, SyncMessage, CLOSE_UNAUTHORIZED,
};
pub use session::{
    ConnectionState, SessionConfig, SessionEffect, SessionError, SessionEvent, SessionStatus,
    Transition, TransportSession,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, Membership, RoomManager};
pub use presence::{CursorColor, PresenceChannel, PresenceRecord};
pub use server::{ServerConfig, ServerHandle, ServerStats, SyncServer};
pub use client::{
    ClientConfig, CredentialProvider, OfflineQueue, Outbound, Outbox, SendPermit, StaticToken,
    SyncClient, SyncEvent,
};
pub use editor::{EditError, EditorCommand, EditorSession, EditorUpdate};
