//! Replicated text store — an RGA sequence CRDT over `char` units.
//!
//! Every unit carries a causal id `(counter, actor)`. Counters are Lamport
//! clocks: a replica always generates counters greater than anything it has
//! produced or observed, so a unit's id is greater than the id of the unit
//! it was inserted after.
//!
//! ```text
//!  after = Some(p)                     new run "xy" (id = 9@B)
//!        │
//!  ... ─ p ─ [ids > 9@B skipped] ─ ▲ ─ [ids < 9@B] ─ ...
//!                                  └── x(9@B) y(10@B)
//! ```
//!
//! Deleted units stay in the sequence as tombstones so that later inserts
//! and anchors referencing them keep a stable position.
//!
//! Reference: Roh et al., "Replicated abstract data types" (RGA), 2011

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Replica identity.
pub type ActorId = Uuid;

/// Highest counter a unit may carry. Remote operations beyond it are
/// dropped so the local clock can always advance past what it has seen.
pub const MAX_COUNTER: u64 = i64::MAX as u64;

/// Listener handle returned by [`TextStore::subscribe`].
pub type SubscriptionId = u64;

type Listener = Box<dyn FnMut(&TextDelta) + Send>;

/// Globally unique unit identifier.
///
/// Field order matters: the derived `Ord` compares `counter` first and
/// breaks ties on `actor`, which is the merge tie-break rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitId {
    pub counter: u64,
    pub actor: ActorId,
}

impl UnitId {
    pub fn new(actor: ActorId, counter: u64) -> Self {
        Self { counter, actor }
    }

    /// Id of the `k`-th unit of a run starting at `self`.
    ///
    /// Runs are checked against [`MAX_COUNTER`] before they are placed.
    fn nth(&self, k: usize) -> UnitId {
        UnitId {
            counter: self.counter + k as u64,
            actor: self.actor,
        }
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.actor)
    }
}

/// A causal edit operation.
///
/// `Insert` describes a run: unit `k` of `text` has id `id.counter + k`
/// and sits directly after unit `k - 1` (the first one after `after`,
/// `None` being the document start).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Insert {
        id: UnitId,
        after: Option<UnitId>,
        text: String,
    },
    Delete {
        target: UnitId,
    },
}

impl Operation {
    /// The unit that must be known before this operation can merge.
    pub fn dependency(&self) -> Option<UnitId> {
        match self {
            Operation::Insert { after, .. } => *after,
            Operation::Delete { target } => Some(*target),
        }
    }

    /// Highest counter mentioned by this operation, or `None` if the run
    /// would overflow the counter space.
    pub fn max_counter(&self) -> Option<u64> {
        match self {
            Operation::Insert { id, text, .. } => {
                let units = text.chars().count() as u64;
                id.counter.checked_add(units.saturating_sub(1))
            }
            Operation::Delete { target } => Some(target.counter),
        }
    }
}

/// Change to the visible text: replace `deleted` chars at `index` with `inserted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextDelta {
    pub index: usize,
    pub inserted: String,
    pub deleted: usize,
}

impl TextDelta {
    pub fn insert(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            inserted: text.into(),
            deleted: 0,
        }
    }

    pub fn delete(index: usize, len: usize) -> Self {
        Self {
            index,
            inserted: String::new(),
            deleted: len,
        }
    }
}

/// Direction for neighbour searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Backward,
    Forward,
}

/// Where a unit currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitLocation {
    /// Number of visible units before this one.
    pub visible_index: usize,
    pub deleted: bool,
}

#[derive(Debug, Clone)]
struct Unit {
    id: UnitId,
    ch: char,
    deleted: bool,
}

/// The replicated text structure for one replica.
pub struct TextStore {
    actor: ActorId,
    /// Lamport clock: highest counter generated or observed.
    clock: u64,
    /// Full sequence including tombstones.
    units: Vec<Unit>,
    known: HashSet<UnitId>,
    /// Remote operations waiting for their dependency.
    pending: Vec<Operation>,
    listeners: Vec<(SubscriptionId, Listener)>,
    next_subscription: SubscriptionId,
}

impl fmt::Debug for TextStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextStore")
            .field("actor", &self.actor)
            .field("clock", &self.clock)
            .field("units", &self.units.len())
            .field("pending", &self.pending.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl TextStore {
    /// Create an empty store for the given actor.
    pub fn new(actor: ActorId) -> Self {
        Self {
            actor,
            clock: 0,
            units: Vec::new(),
            known: HashSet::new(),
            pending: Vec::new(),
            listeners: Vec::new(),
            next_subscription: 0,
        }
    }

    pub fn actor(&self) -> ActorId {
        self.actor
    }

    /// Current Lamport clock value.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Number of visible chars.
    pub fn len(&self) -> usize {
        self.units.iter().filter(|u| !u.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of retained tombstones.
    pub fn tombstones(&self) -> usize {
        self.units.iter().filter(|u| u.deleted).count()
    }

    /// Remote operations still waiting for a dependency.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Materialize the visible text.
    pub fn current_text(&self) -> String {
        self.units.iter().filter(|u| !u.deleted).map(|u| u.ch).collect()
    }

    /// Register a delta listener.
    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&TextDelta) + Send + 'static,
    {
        let id = self.next_subscription;
        self.next_subscription += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(sid, _)| *sid != id);
        self.listeners.len() != before
    }

    /// Apply an index-based local edit and return the operations to ship.
    ///
    /// `index` and `deleted` are clamped to the current bounds.
    pub fn apply_local(&mut self, index: usize, inserted: &str, deleted: usize) -> Vec<Operation> {
        let len = self.len();
        let index = index.min(len);
        let deleted = deleted.min(len - index);
        let mut ops = Vec::with_capacity(deleted + 1);

        if deleted > 0 {
            let targets: Vec<UnitId> = self
                .units
                .iter()
                .filter(|u| !u.deleted)
                .skip(index)
                .take(deleted)
                .map(|u| u.id)
                .collect();
            for target in targets {
                self.tombstone(target);
                ops.push(Operation::Delete { target });
            }
        }

        let mut inserted = inserted;
        if !inserted.is_empty() {
            let units = inserted.chars().count() as u64;
            match self.clock.checked_add(units).filter(|end| *end <= MAX_COUNTER) {
                Some(end) => {
                    let after = if index == 0 { None } else { self.unit_at(index - 1) };
                    let id = UnitId::new(self.actor, self.clock + 1);
                    self.clock = end;
                    self.integrate_insert(id, after, inserted);
                    ops.push(Operation::Insert {
                        id,
                        after,
                        text: inserted.to_string(),
                    });
                }
                None => {
                    log::error!("Counter space exhausted at {}, dropping local insert", self.clock);
                    inserted = "";
                }
            }
        }

        if !ops.is_empty() {
            self.emit(&TextDelta {
                index,
                inserted: inserted.to_string(),
                deleted,
            });
        }
        ops
    }

    /// Merge a remote operation.
    ///
    /// Idempotent and commutative. Operations whose dependency is unknown
    /// are buffered and merged once it arrives. Returns `true` if the
    /// visible text changed.
    pub fn apply_remote(&mut self, op: Operation) -> bool {
        if op.max_counter().map_or(true, |max| max > MAX_COUNTER) {
            log::warn!("Dropping operation with out-of-range counter: {op:?}");
            return false;
        }
        if !self.is_ready(&op) {
            if !self.pending.contains(&op) {
                log::trace!("Buffering operation until {:?} arrives", op.dependency());
                self.pending.push(op);
            }
            return false;
        }

        let mut changed = self.integrate(op);
        while let Some(i) = self.pending.iter().position(|op| self.is_ready(op)) {
            let op = self.pending.remove(i);
            changed |= self.integrate(op);
        }
        changed
    }

    /// Id of the visible unit at `index`.
    pub fn unit_at(&self, index: usize) -> Option<UnitId> {
        self.units
            .iter()
            .filter(|u| !u.deleted)
            .nth(index)
            .map(|u| u.id)
    }

    /// Whether a unit has been merged into this replica.
    pub fn contains(&self, id: &UnitId) -> bool {
        self.known.contains(id)
    }

    /// Locate a unit (visible or tombstoned).
    pub fn locate(&self, id: &UnitId) -> Option<UnitLocation> {
        let pos = self.position(id)?;
        Some(UnitLocation {
            visible_index: self.visible_before(pos),
            deleted: self.units[pos].deleted,
        })
    }

    /// Visible index of the nearest surviving unit next to `id` in `direction`.
    pub fn nearest_visible(&self, id: &UnitId, direction: Direction) -> Option<usize> {
        let pos = self.position(id)?;
        match direction {
            Direction::Backward => {
                let found = self.units[..pos].iter().rposition(|u| !u.deleted)?;
                Some(self.visible_before(found))
            }
            Direction::Forward => {
                let offset = self.units[pos + 1..].iter().position(|u| !u.deleted)?;
                Some(self.visible_before(pos + 1 + offset))
            }
        }
    }

    fn is_ready(&self, op: &Operation) -> bool {
        op.dependency().map_or(true, |dep| self.known.contains(&dep))
    }

    fn integrate(&mut self, op: Operation) -> bool {
        if let Some(max) = op.max_counter() {
            self.clock = self.clock.max(max);
        }
        match op {
            Operation::Insert { id, after, text } => {
                if text.is_empty() || self.known.contains(&id) {
                    return false;
                }
                let index = self.integrate_insert(id, after, &text);
                self.emit(&TextDelta::insert(index, text));
                true
            }
            Operation::Delete { target } => match self.tombstone(target) {
                Some(index) => {
                    self.emit(&TextDelta::delete(index, 1));
                    true
                }
                None => false,
            },
        }
    }

    /// Place a run and return the visible index of its first unit.
    fn integrate_insert(&mut self, id: UnitId, after: Option<UnitId>, text: &str) -> usize {
        let mut pos = match after.and_then(|a| self.position(&a)) {
            Some(p) => p + 1,
            None => 0,
        };
        while pos < self.units.len() && self.units[pos].id > id {
            pos += 1;
        }

        let index = self.visible_before(pos);
        let run: Vec<Unit> = text
            .chars()
            .enumerate()
            .map(|(k, ch)| Unit {
                id: id.nth(k),
                ch,
                deleted: false,
            })
            .collect();
        self.known.extend(run.iter().map(|u| u.id));
        self.units.splice(pos..pos, run);
        index
    }

    /// Tombstone a unit. Returns its former visible index if it was visible.
    fn tombstone(&mut self, target: UnitId) -> Option<usize> {
        let pos = self.position(&target)?;
        if self.units[pos].deleted {
            return None;
        }
        let index = self.visible_before(pos);
        self.units[pos].deleted = true;
        Some(index)
    }

    fn position(&self, id: &UnitId) -> Option<usize> {
        if !self.known.contains(id) {
            return None;
        }
        self.units.iter().position(|u| u.id == *id)
    }

    fn visible_before(&self, pos: usize) -> usize {
        self.units[..pos].iter().filter(|u| !u.deleted).count()
    }

    fn emit(&mut self, delta: &TextDelta) {
        for (_, listener) in self.listeners.iter_mut() {
            listener(delta);
        }
    }
}
