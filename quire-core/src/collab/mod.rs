use uuid::Uuid;

use crate::anchor::{Anchor, AnchorError};
use crate::annotation::{
    Annotation, AnnotationError, AnnotationId, AnnotationPatch, AnnotationStore, ResolvedAnnotation,
};
use crate::text::{ActorId, Operation, SubscriptionId, TextDelta, TextStore};

// Custom error type for collaboration operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollabError {
    Annotation(AnnotationError),
    Anchor(AnchorError),
}

impl std::fmt::Display for CollabError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Annotation(e) => write!(f, "{e}"),
            Self::Anchor(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CollabError {}

impl From<AnnotationError> for CollabError {
    fn from(e: AnnotationError) -> Self {
        CollabError::Annotation(e)
    }
}

impl From<AnchorError> for CollabError {
    fn from(e: AnchorError) -> Self {
        CollabError::Anchor(e)
    }
}

/// Main entry point for all collaborative operations on one replica.
///
/// Owns the text store and the annotation store; anything that changes
/// either goes through here.
#[derive(Debug)]
pub struct CollaborationEngine {
    text: TextStore,
    annotations: AnnotationStore,
}

impl CollaborationEngine {
    pub fn new(actor: ActorId) -> Self {
        Self {
            text: TextStore::new(actor),
            annotations: AnnotationStore::new(actor),
        }
    }

    /// Create with a fresh random actor id.
    pub fn with_random_actor() -> Self {
        Self::new(Uuid::new_v4())
    }

    pub fn actor(&self) -> ActorId {
        self.text.actor()
    }

    pub fn text(&self) -> &TextStore {
        &self.text
    }

    pub fn annotations(&self) -> &AnnotationStore {
        &self.annotations
    }

    pub fn plain_text(&self) -> String {
        self.text.current_text()
    }

    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&TextDelta) + Send + 'static,
    {
        self.text.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.text.unsubscribe(id)
    }

    /// Apply a local edit and return the operations to broadcast.
    pub fn apply_local_edit(&mut self, index: usize, inserted: &str, deleted: usize) -> Vec<Operation> {
        self.text.apply_local(index, inserted, deleted)
    }

    /// Merge a remote operation. Returns `true` if the text changed.
    pub fn apply_remote(&mut self, op: Operation) -> bool {
        self.text.apply_remote(op)
    }

    pub fn anchor_at(&self, index: usize) -> Anchor {
        Anchor::create(&self.text, index)
    }

    pub fn resolve_anchor(&self, anchor: &Anchor) -> Result<usize, CollabError> {
        Ok(anchor.resolve(&self.text)?)
    }

    /// Create an annotation and return the record to replicate.
    pub fn add_annotation(
        &mut self,
        index: usize,
        length: usize,
        author: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<Annotation, CollabError> {
        let id = self.annotations.create(&self.text, index, length, author, text);
        let record = self.annotations.get(&id).ok_or(AnnotationError::NotFound(id))?;
        Ok(record.clone())
    }

    pub fn update_annotation(&mut self, id: &AnnotationId, patch: AnnotationPatch) -> Result<Annotation, CollabError> {
        Ok(self.annotations.update(id, patch)?.clone())
    }

    pub fn remove_annotation(&mut self, id: &AnnotationId) -> Result<Annotation, CollabError> {
        Ok(self.annotations.remove(id)?)
    }

    pub fn resolve_annotations(&self) -> Vec<ResolvedAnnotation> {
        self.annotations.resolve_all(&self.text)
    }

    pub fn set_active_annotation(&mut self, id: Option<AnnotationId>) -> Option<AnnotationId> {
        self.annotations.set_active(id)
    }

    pub fn active_annotation(&self) -> Option<AnnotationId> {
        self.annotations.active()
    }

    pub fn apply_remote_annotation(&mut self, annotation: Annotation) -> bool {
        self.annotations.apply_remote(annotation)
    }

    pub fn apply_remote_annotation_removal(&mut self, id: &AnnotationId) -> bool {
        self.annotations.apply_remote_removal(id)
    }
}
