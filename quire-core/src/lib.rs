//! # quire-core — replicated text, anchors and annotations
//!
//! One replica of a collaboratively edited plain-text document.
//!
//! ```text
//!  local edit ──► TextStore::apply_local ──► Vec<Operation> ──► transport
//!                      │
//!  remote op  ──► TextStore::apply_remote ──► TextDelta ──► subscribers
//!                      │
//!                      ▼
//!               Anchor::resolve ◄── AnnotationStore::resolve_all
//! ```
//!
//! ## Modules
//!
//! - [`text`] — RGA sequence CRDT with tombstones and a causal buffer
//! - [`anchor`] — logical positions bound to unit ids
//! - [`annotation`] — comment metadata keyed by anchors
//! - [`collab`] — [`CollaborationEngine`], the per-replica facade

pub mod anchor;
pub mod annotation;
pub mod collab;
pub mod text;

pub use anchor::{Anchor, AnchorError, Side};
pub use annotation::{
    Annotation, AnnotationError, AnnotationId, AnnotationPatch, AnnotationStore, ResolvedAnnotation,
};
pub use collab::{CollabError, CollaborationEngine};
pub use text::{ActorId, Operation, SubscriptionId, TextDelta, TextStore, UnitId, MAX_COUNTER};
