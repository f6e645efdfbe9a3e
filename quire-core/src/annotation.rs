//! Inline annotations (comments) keyed by logical anchors.
//!
//! Annotations are replicated verbatim. Concurrent updates of the same
//! annotation are ordered by `(revision, last_editor)`; removals are
//! remembered so a late update never brings a removed annotation back.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::anchor::Anchor;
use crate::text::{ActorId, TextStore};

/// Opaque, randomly generated annotation id.
pub type AnnotationId = Uuid;

/// A stored annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: AnnotationId,
    /// Start of the annotated span.
    pub anchor: Anchor,
    /// End of the annotated span; lets the length track edits inside it.
    pub end_anchor: Anchor,
    /// Span length at creation time.
    pub span_length: usize,
    pub author: String,
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    pub resolved: bool,
    pub revision: u64,
    pub last_editor: ActorId,
}

impl Annotation {
    fn version(&self) -> (u64, ActorId) {
        (self.revision, self.last_editor)
    }
}

/// Fields an update may change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnotationPatch {
    pub text: Option<String>,
    pub resolved: Option<bool>,
}

impl AnnotationPatch {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            resolved: None,
        }
    }

    pub fn resolved(resolved: bool) -> Self {
        Self {
            text: None,
            resolved: Some(resolved),
        }
    }
}

/// An annotation with its position re-resolved against the current text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAnnotation {
    pub id: AnnotationId,
    /// `None` when the anchor is orphaned ("position unknown").
    pub current_index: Option<usize>,
    pub current_length: usize,
    pub annotation: Annotation,
    pub orphaned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnotationError {
    NotFound(AnnotationId),
}

impl fmt::Display for AnnotationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "Annotation not found: {id}"),
        }
    }
}

impl std::error::Error for AnnotationError {}

/// Annotation metadata for one replica.
#[derive(Debug)]
pub struct AnnotationStore {
    actor: ActorId,
    annotations: HashMap<AnnotationId, Annotation>,
    removed: HashSet<AnnotationId>,
    active: Option<AnnotationId>,
}

impl AnnotationStore {
    pub fn new(actor: ActorId) -> Self {
        Self {
            actor,
            annotations: HashMap::new(),
            removed: HashSet::new(),
            active: None,
        }
    }

    /// Anchor a new annotation on `[index, index + length)` and return its id.
    pub fn create(
        &mut self,
        store: &TextStore,
        index: usize,
        length: usize,
        author: impl Into<String>,
        text: impl Into<String>,
    ) -> AnnotationId {
        let len = store.len();
        let start = index.min(len);
        let length = length.min(len - start);

        let annotation = Annotation {
            id: Uuid::new_v4(),
            anchor: Anchor::create(store, start),
            end_anchor: Anchor::create(store, start + length),
            span_length: length,
            author: author.into(),
            text: text.into(),
            created_at: now_millis(),
            resolved: false,
            revision: 0,
            last_editor: self.actor,
        };
        let id = annotation.id;
        log::debug!("Created annotation {id} at {start}+{length}");
        self.annotations.insert(id, annotation);
        id
    }

    pub fn get(&self, id: &AnnotationId) -> Option<&Annotation> {
        self.annotations.get(id)
    }

    pub fn len(&self) -> usize {
        self.annotations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.annotations.is_empty()
    }

    /// Re-resolve every annotation. Orphaned ones are flagged, never dropped,
    /// and sort after the positioned ones.
    pub fn resolve_all(&self, store: &TextStore) -> Vec<ResolvedAnnotation> {
        let mut resolved: Vec<ResolvedAnnotation> = self
            .annotations
            .values()
            .map(|a| Self::resolve_one(a, store))
            .collect();

        resolved.sort_by(|x, y| {
            let key = |r: &ResolvedAnnotation| {
                (r.orphaned, r.current_index, r.annotation.created_at, r.id)
            };
            key(x).cmp(&key(y))
        });
        resolved
    }

    fn resolve_one(annotation: &Annotation, store: &TextStore) -> ResolvedAnnotation {
        match annotation.anchor.resolve(store) {
            Ok(start) => {
                let current_length = match annotation.end_anchor.resolve(store) {
                    Ok(end) => end.saturating_sub(start),
                    Err(_) => annotation.span_length.min(store.len() - start),
                };
                ResolvedAnnotation {
                    id: annotation.id,
                    current_index: Some(start),
                    current_length,
                    annotation: annotation.clone(),
                    orphaned: false,
                }
            }
            Err(e) => {
                log::debug!("Annotation {} has no position: {e}", annotation.id);
                ResolvedAnnotation {
                    id: annotation.id,
                    current_index: None,
                    current_length: 0,
                    annotation: annotation.clone(),
                    orphaned: true,
                }
            }
        }
    }

    /// Apply a local update; bumps the revision.
    pub fn update(&mut self, id: &AnnotationId, patch: AnnotationPatch) -> Result<&Annotation, AnnotationError> {
        let annotation = self
            .annotations
            .get_mut(id)
            .ok_or(AnnotationError::NotFound(*id))?;
        if let Some(text) = patch.text {
            annotation.text = text;
        }
        if let Some(resolved) = patch.resolved {
            annotation.resolved = resolved;
        }
        annotation.revision += 1;
        annotation.last_editor = self.actor;
        Ok(annotation)
    }

    /// Remove locally. Clears the active pointer if it pointed here.
    pub fn remove(&mut self, id: &AnnotationId) -> Result<Annotation, AnnotationError> {
        let removed = self
            .annotations
            .remove(id)
            .ok_or(AnnotationError::NotFound(*id))?;
        self.forget(id);
        Ok(removed)
    }

    /// Merge a replicated annotation. Returns `true` if local state changed.
    pub fn apply_remote(&mut self, annotation: Annotation) -> bool {
        if self.removed.contains(&annotation.id) {
            return false;
        }
        match self.annotations.get(&annotation.id) {
            Some(existing) if existing.version() >= annotation.version() => false,
            _ => {
                self.annotations.insert(annotation.id, annotation);
                true
            }
        }
    }

    /// Merge a replicated removal.
    pub fn apply_remote_removal(&mut self, id: &AnnotationId) -> bool {
        let existed = self.annotations.remove(id).is_some();
        self.forget(id);
        existed
    }

    /// Toggle the active annotation.
    ///
    /// Selecting the active one clears it, selecting another replaces it,
    /// `None` clears. Unknown ids leave the selection unchanged.
    pub fn set_active(&mut self, id: Option<AnnotationId>) -> Option<AnnotationId> {
        self.active = match id {
            None => None,
            Some(id) if self.active == Some(id) => None,
            Some(id) if self.annotations.contains_key(&id) => Some(id),
            Some(id) => {
                log::debug!("Ignoring selection of unknown annotation {id}");
                self.active
            }
        };
        self.active
    }

    pub fn active(&self) -> Option<AnnotationId> {
        self.active
    }

    fn forget(&mut self, id: &AnnotationId) {
        self.removed.insert(*id);
        if self.active == Some(*id) {
            self.active = None;
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
