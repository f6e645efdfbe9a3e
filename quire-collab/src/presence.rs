//! Presence channel: who else is in the document and where their cursor is.
//!
//! ## Architecture
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! PresenceChannel::set_local_cursor()
//!       │  (rate-limited)
//!       ▼
//! PresenceMessage { Cursor { anchor_bytes } }
//!       │
//!       ▼   (WebSocket broadcast, fire-and-forget)
//! Remote PresenceChannel::handle_message()
//!       │
//!       ▼
//! participant_id → PresenceRecord
//! ```
//!
//! Records are ephemeral. They only exist while the connection is up and
//! are purged wholesale when it drops; re-announcements rebuild the map.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use quire_core::Anchor;

use crate::protocol::{PresenceMessage, PresenceState};
use crate::session::ConnectionState;

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// RGBA color for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, visually distinct color from a participant id.
    ///
    /// Hue comes from the id; saturation and lightness are fixed so every
    /// cursor reads well on a light background.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// `#rrggbb` form for UI layers that want CSS colors.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", channel(self.r), channel(self.g), channel(self.b))
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Remote participant state
// ───────────────────────────────────────────────────────────────────

/// What we know about one remote participant.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRecord {
    pub participant_id: Uuid,
    pub display_name: String,
    pub color: CursorColor,
    pub cursor_anchor: Option<Anchor>,
}

impl PresenceRecord {
    pub fn new(participant_id: Uuid, display_name: impl Into<String>) -> Self {
        Self {
            participant_id,
            display_name: display_name.into(),
            color: CursorColor::from_uuid(participant_id),
            cursor_anchor: None,
        }
    }

    /// Record for a participant we only know from a cursor update.
    fn placeholder(participant_id: Uuid) -> Self {
        let short = participant_id.simple().to_string();
        Self::new(participant_id, format!("Peer-{}", &short[..8]))
    }
}

fn decode_cursor(anchor_bytes: &Option<Vec<u8>>) -> Option<Anchor> {
    let bytes = anchor_bytes.as_ref()?;
    match Anchor::from_bytes(bytes) {
        Ok(anchor) => Some(anchor),
        Err(e) => {
            log::warn!("Dropping cursor with undecodable anchor: {e}");
            None
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence channel
// ───────────────────────────────────────────────────────────────────

/// Tracks remote participants and builds our own presence messages.
pub struct PresenceChannel {
    local_id: Uuid,
    display_name: String,
    peers: HashMap<Uuid, PresenceRecord>,
    local_cursor: Option<Anchor>,
    last_cursor_broadcast: Option<Instant>,
    cursor_broadcast_interval: Duration,
}

impl PresenceChannel {
    pub fn new(local_id: Uuid, display_name: impl Into<String>) -> Self {
        Self::with_interval(local_id, display_name, Duration::from_millis(50))
    }

    /// Create with a custom cursor rate limit.
    pub fn with_interval(local_id: Uuid, display_name: impl Into<String>, interval: Duration) -> Self {
        Self {
            local_id,
            display_name: display_name.into(),
            peers: HashMap::new(),
            local_cursor: None,
            last_cursor_broadcast: None,
            cursor_broadcast_interval: interval,
        }
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn local_cursor(&self) -> Option<Anchor> {
        self.local_cursor
    }

    /// Our self-introduction.
    pub fn announce(&self) -> PresenceMessage {
        PresenceMessage {
            participant_id: self.local_id,
            state: PresenceState::Announce {
                display_name: self.display_name.clone(),
            },
        }
    }

    /// Our departure.
    pub fn leave(&self) -> PresenceMessage {
        PresenceMessage {
            participant_id: self.local_id,
            state: PresenceState::Leave,
        }
    }

    /// Record the local cursor; returns a message unless rate-limited.
    pub fn set_local_cursor(&mut self, anchor: Option<Anchor>) -> Option<PresenceMessage> {
        self.local_cursor = anchor;
        if let Some(last) = self.last_cursor_broadcast {
            if last.elapsed() < self.cursor_broadcast_interval {
                return None;
            }
        }
        self.force_cursor()
    }

    /// Cursor message for the current local cursor, ignoring the rate limit.
    ///
    /// `None` if the cursor anchor cannot be encoded.
    pub fn force_cursor(&mut self) -> Option<PresenceMessage> {
        let anchor_bytes = match self.local_cursor.map(|a| a.to_bytes()).transpose() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Not publishing cursor: {e}");
                return None;
            }
        };
        self.last_cursor_broadcast = Some(Instant::now());
        Some(PresenceMessage {
            participant_id: self.local_id,
            state: PresenceState::Cursor { anchor_bytes },
        })
    }

    /// Apply a remote presence message.
    ///
    /// Returns our own announce when the sender was new to us, so late
    /// joiners learn about participants that were already present.
    pub fn handle_message(&mut self, msg: &PresenceMessage) -> Option<PresenceMessage> {
        if msg.participant_id == self.local_id {
            return None;
        }

        match &msg.state {
            PresenceState::Announce { display_name } => {
                match self.peers.get_mut(&msg.participant_id) {
                    Some(record) => {
                        record.display_name = display_name.clone();
                        None
                    }
                    None => {
                        log::debug!("Presence: {display_name} ({}) announced", msg.participant_id);
                        self.peers.insert(
                            msg.participant_id,
                            PresenceRecord::new(msg.participant_id, display_name.clone()),
                        );
                        Some(self.announce())
                    }
                }
            }

            PresenceState::Cursor { anchor_bytes } => {
                let cursor = decode_cursor(anchor_bytes);
                self.peers
                    .entry(msg.participant_id)
                    .or_insert_with(|| PresenceRecord::placeholder(msg.participant_id))
                    .cursor_anchor = cursor;
                None
            }

            PresenceState::Leave => {
                self.peers.remove(&msg.participant_id);
                None
            }
        }
    }

    /// Drop one participant (peer-left notification).
    pub fn remove_participant(&mut self, participant_id: &Uuid) -> Option<PresenceRecord> {
        self.peers.remove(participant_id)
    }

    /// Presence only lives while connected; any other state purges it.
    /// Returns `true` when records were dropped.
    pub fn on_connection_state(&mut self, state: ConnectionState) -> bool {
        if state == ConnectionState::Connected || self.peers.is_empty() {
            return false;
        }
        log::debug!("Presence: clearing {} participants ({state})", self.peers.len());
        self.peers.clear();
        true
    }

    pub fn participant(&self, participant_id: &Uuid) -> Option<&PresenceRecord> {
        self.peers.get(participant_id)
    }

    /// Remote participants ordered by display name.
    pub fn participants(&self) -> Vec<PresenceRecord> {
        let mut records: Vec<PresenceRecord> = self.peers.values().cloned().collect();
        records.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then(a.participant_id.cmp(&b.participant_id))
        });
        records
    }

    pub fn participant_count(&self) -> usize {
        self.peers.len()
    }
}
