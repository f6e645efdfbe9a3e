//! Logical position anchors.
//!
//! An anchor names a unit id plus a side instead of a numeric offset, so the
//! position it denotes follows the text through concurrent edits. The start
//! of the document is a sentinel (`target == None`) that always resolves to 0.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::text::{Direction, TextStore, UnitId};

/// Which side of the target unit the anchor sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Before,
    After,
}

/// A logical text position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Anchor {
    target: Option<UnitId>,
    side: Side,
}

/// Anchor failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchorError {
    /// The target and every fallback neighbour are gone (or unknown here).
    Orphaned { target: UnitId },
    /// The opaque byte encoding could not be decoded.
    Malformed(String),
    /// The anchor could not be encoded.
    Encode(String),
}

impl fmt::Display for AnchorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Orphaned { target } => write!(f, "Anchor orphaned: unit {target} has no surviving neighbours"),
            Self::Malformed(e) => write!(f, "Malformed anchor: {e}"),
            Self::Encode(e) => write!(f, "Anchor encode failed: {e}"),
        }
    }
}

impl std::error::Error for AnchorError {}

impl Anchor {
    /// The start-of-document sentinel.
    pub const START: Anchor = Anchor {
        target: None,
        side: Side::After,
    };

    /// Bind to the unit just before `index` (or the start sentinel).
    pub fn create(store: &TextStore, index: usize) -> Self {
        let index = index.min(store.len());
        if index == 0 {
            return Self::START;
        }
        match store.unit_at(index - 1) {
            Some(id) => Self {
                target: Some(id),
                side: Side::After,
            },
            None => Self::START,
        }
    }

    /// Bind with an explicit side. `Before` binds to the unit at `index`;
    /// past the end it degrades to [`Anchor::create`].
    pub fn create_with_side(store: &TextStore, index: usize, side: Side) -> Self {
        match side {
            Side::After => Self::create(store, index),
            Side::Before => match store.unit_at(index) {
                Some(id) => Self {
                    target: Some(id),
                    side: Side::Before,
                },
                None => Self::create(store, index),
            },
        }
    }

    pub fn target(&self) -> Option<UnitId> {
        self.target
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn is_start(&self) -> bool {
        self.target.is_none()
    }

    /// Resolve to a visible index.
    ///
    /// A tombstoned target falls back to the nearest surviving unit in the
    /// anchor's own direction (`After` looks backward, `Before` forward),
    /// then the opposite direction.
    pub fn resolve(&self, store: &TextStore) -> Result<usize, AnchorError> {
        let target = match self.target {
            None => return Ok(0),
            Some(t) => t,
        };
        let orphaned = AnchorError::Orphaned { target };

        let location = store.locate(&target).ok_or(orphaned.clone())?;
        if !location.deleted {
            return Ok(match self.side {
                Side::Before => location.visible_index,
                Side::After => location.visible_index + 1,
            });
        }

        let (primary, secondary) = match self.side {
            Side::After => (Direction::Backward, Direction::Forward),
            Side::Before => (Direction::Forward, Direction::Backward),
        };
        for direction in [primary, secondary] {
            if let Some(neighbour) = store.nearest_visible(&target, direction) {
                return Ok(match direction {
                    Direction::Backward => neighbour + 1,
                    Direction::Forward => neighbour,
                });
            }
        }
        Err(orphaned)
    }

    /// Opaque encoding carried by annotations and presence.
    pub fn to_bytes(&self) -> Result<Vec<u8>, AnchorError> {
        serde_json::to_vec(self).map_err(|e| AnchorError::Encode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AnchorError> {
        serde_json::from_slice(bytes).map_err(|e| AnchorError::Malformed(e.to_string()))
    }
}

impl Default for Anchor {
    fn default() -> Self {
        Self::START
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::Operation;
    use uuid::Uuid;

    fn store_with(text: &str) -> TextStore {
        let mut store = TextStore::new(Uuid::from_u128(1));
        store.apply_local(0, text, 0);
        store
    }

    #[test]
    fn test_create_at_start_is_sentinel() {
        let store = store_with("abc");
        let anchor = Anchor::create(&store, 0);
        assert!(anchor.is_start());
        assert_eq!(anchor.resolve(&store), Ok(0));
    }

    #[test]
    fn test_create_and_resolve_roundtrip() {
        let store = store_with("hello world");
        for index in 0..=store.len() {
            let anchor = Anchor::create(&store, index);
            assert_eq!(anchor.resolve(&store), Ok(index));
        }
    }

    #[test]
    fn test_create_clamps_index() {
        let store = store_with("abc");
        let anchor = Anchor::create(&store, 99);
        assert_eq!(anchor.resolve(&store), Ok(3));
    }

    #[test]
    fn test_anchor_follows_insert_before_it() {
        let mut store = store_with("world");
        let anchor = Anchor::create(&store, 3); // after "wor"
        store.apply_local(0, "hello ", 0);
        assert_eq!(anchor.resolve(&store), Ok(9));
        assert_eq!(&store.current_text()[..9], "hello wor");
    }

    #[test]
    fn test_anchor_stable_under_remote_edits() {
        let mut a = TextStore::new(Uuid::from_u128(1));
        let mut b = TextStore::new(Uuid::from_u128(2));
        for op in a.apply_local(0, "The quick fox", 0) {
            b.apply_remote(op);
        }

        let anchor = Anchor::create(&a, 10); // just before "fox"
        let remote: Vec<Operation> = b
            .apply_local(4, "very ", 0)
            .into_iter()
            .chain(b.apply_local(0, "", 4))
            .collect();
        for op in remote {
            a.apply_remote(op);
        }

        let index = anchor.resolve(&a).unwrap();
        assert_eq!(a.current_text(), "very quick fox");
        assert_eq!(&a.current_text()[index..], "fox");
    }

    #[test]
    fn test_deleted_target_falls_back_to_neighbour() {
        let mut store = store_with("abcdef");
        let anchor = Anchor::create(&store, 3); // after 'c'
        store.apply_local(2, "", 2); // remove "cd"
        assert_eq!(store.current_text(), "abef");
        assert_eq!(anchor.resolve(&store), Ok(2));
    }

    #[test]
    fn test_before_side_falls_back_forward_then_backward() {
        let mut store = store_with("abc");
        let anchor = Anchor::create_with_side(&store, 2, Side::Before); // before 'c'
        assert_eq!(anchor.side(), Side::Before);
        assert_eq!(anchor.resolve(&store), Ok(2));

        store.apply_local(2, "", 1);
        assert_eq!(anchor.resolve(&store), Ok(2));

        store.apply_local(0, "", 1);
        assert_eq!(anchor.resolve(&store), Ok(1));
    }

    #[test]
    fn test_orphaned_when_all_text_deleted() {
        let mut store = store_with("abc");
        let anchor = Anchor::create(&store, 2);
        store.apply_local(0, "", 3);

        match anchor.resolve(&store) {
            Err(AnchorError::Orphaned { target }) => assert_eq!(Some(target), anchor.target()),
            other => panic!("Expected orphaned anchor, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_target_is_orphaned() {
        let source = store_with("abc");
        let other = TextStore::new(Uuid::from_u128(9));
        let anchor = Anchor::create(&source, 2);
        assert!(matches!(anchor.resolve(&other), Err(AnchorError::Orphaned { .. })));
    }

    #[test]
    fn test_bytes_roundtrip() {
        let store = store_with("abc");
        let anchor = Anchor::create(&store, 2);
        let bytes = anchor.to_bytes().unwrap();
        assert!(!bytes.is_empty());
        assert_eq!(Anchor::from_bytes(&bytes), Ok(anchor));
    }

    #[test]
    fn test_malformed_bytes() {
        assert!(matches!(
            Anchor::from_bytes(&[0xFF, 0x00]),
            Err(AnchorError::Malformed(_))
        ));
    }
}
