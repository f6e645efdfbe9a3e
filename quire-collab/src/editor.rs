//! Editor session: the surface the UI layer talks to.
//!
//! Wires one [`CollaborationEngine`] replica, one [`PresenceChannel`] and one
//! [`SyncClient`] together. Local edits go in through methods (or
//! [`EditorCommand`]s); everything the UI needs to redraw comes out as
//! [`EditorUpdate`]s on a channel taken once with
//! [`EditorSession::take_update_rx`].
//!
//! ```text
//!  UI ──EditorCommand──► EditorSession ──ops──► SyncClient ──► relay
//!   ▲                        │    ▲                 │
//!   └────EditorUpdate────────┘    └──── pump ◄──SyncEvent
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use quire_core::{
    Annotation, AnnotationId, AnnotationPatch, CollabError, CollaborationEngine, ResolvedAnnotation,
    TextDelta,
};

use crate::client::{ClientConfig, CredentialProvider, Outbox, Outbound, SyncClient, SyncEvent};
use crate::presence::{PresenceChannel, PresenceRecord};
use crate::protocol::{AnnotationRecord, OperationEntry, PeerInfo, ProtocolError};
use crate::session::{ConnectionState, SessionStatus};

/// Core → UI notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum EditorUpdate {
    /// The visible text changed.
    Text(TextDelta),
    /// Annotation positions or contents changed.
    Annotations(Vec<ResolvedAnnotation>),
    Connection(SessionStatus),
    /// Remote participants changed.
    Presence(Vec<PresenceRecord>),
}

/// UI → core requests.
#[derive(Debug, Clone, PartialEq)]
pub enum EditorCommand {
    LocalEdit {
        index: usize,
        inserted: String,
        deleted: usize,
    },
    CursorMoved {
        index: usize,
    },
    AddAnnotation {
        index: usize,
        length: usize,
        author: String,
        text: String,
    },
    UpdateAnnotation {
        id: AnnotationId,
        patch: AnnotationPatch,
    },
    RemoveAnnotation(AnnotationId),
    SetActiveAnnotation(Option<AnnotationId>),
}

/// Errors returned to the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum EditError {
    /// Local edits are refused unless connected and synced.
    EditingDisabled(ConnectionState),
    Collab(CollabError),
    Transport(ProtocolError),
}

impl std::fmt::Display for EditError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EditingDisabled(state) => write!(f, "Editing disabled while {state}"),
            Self::Collab(e) => write!(f, "{e}"),
            Self::Transport(e) => write!(f, "Transport error: {e}"),
        }
    }
}

impl std::error::Error for EditError {}

impl From<CollabError> for EditError {
    fn from(e: CollabError) -> Self {
        EditError::Collab(e)
    }
}

impl From<ProtocolError> for EditError {
    fn from(e: ProtocolError) -> Self {
        EditError::Transport(e)
    }
}

/// Lock ignoring poisoning; the guarded state is never left half-updated.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the session handle and its pump task.
struct Shared {
    engine: Mutex<CollaborationEngine>,
    presence: Mutex<PresenceChannel>,
    update_tx: mpsc::UnboundedSender<EditorUpdate>,
    outbox: Outbox,
}

impl Shared {
    fn emit(&self, update: EditorUpdate) {
        // Nobody listening is fine.
        let _ = self.update_tx.send(update);
    }

    fn emit_annotations(&self) {
        let resolved = lock(&self.engine).resolve_annotations();
        self.emit(EditorUpdate::Annotations(resolved));
    }

    fn emit_presence(&self) {
        let participants = lock(&self.presence).participants();
        self.emit(EditorUpdate::Presence(participants));
    }

    fn publish(&self, message: Outbound) {
        if let Err(e) = self.outbox.send(message) {
            log::debug!("Dropping presence update: {e}");
        }
    }
}

/// One participant's editing session on one document.
pub struct EditorSession {
    shared: Arc<Shared>,
    client: SyncClient,
    update_rx: Option<mpsc::UnboundedReceiver<EditorUpdate>>,
    pump: Option<JoinHandle<()>>,
}

impl EditorSession {
    pub fn new(
        peer_info: PeerInfo,
        doc_id: Uuid,
        config: ClientConfig,
        credentials: impl CredentialProvider,
    ) -> Self {
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        let mut engine = CollaborationEngine::new(peer_info.peer_id);
        let text_tx = update_tx.clone();
        engine.subscribe(move |delta: &TextDelta| {
            let _ = text_tx.send(EditorUpdate::Text(delta.clone()));
        });

        let presence = PresenceChannel::new(peer_info.peer_id, peer_info.name.clone());
        let client = SyncClient::new(peer_info, doc_id, config, credentials);

        Self {
            shared: Arc::new(Shared {
                engine: Mutex::new(engine),
                presence: Mutex::new(presence),
                update_tx,
                outbox: client.outbox(),
            }),
            client,
            update_rx: Some(update_rx),
            pump: None,
        }
    }

    /// Take the update receiver (can only be called once).
    pub fn take_update_rx(&mut self) -> Option<mpsc::UnboundedReceiver<EditorUpdate>> {
        self.update_rx.take()
    }

    pub fn peer_id(&self) -> Uuid {
        self.client.peer_info().peer_id
    }

    pub fn doc_id(&self) -> Uuid {
        self.client.doc_id()
    }

    pub fn client(&self) -> &SyncClient {
        &self.client
    }

    // ── lifecycle ─────────────────────────────────────────────────

    pub async fn connect(&mut self) -> Result<(), EditError> {
        self.ensure_pump();
        Ok(self.client.connect().await?)
    }

    /// Leave `Failed` (or any state) and try again with a fresh budget.
    pub async fn restart(&mut self) -> Result<(), EditError> {
        self.ensure_pump();
        Ok(self.client.restart().await?)
    }

    pub async fn shutdown(&mut self) {
        if self.client.connection_state() == ConnectionState::Connected {
            let leave = lock(&self.shared.presence).leave();
            self.shared.publish(Outbound::Presence(leave));
        }
        self.client.shutdown().await;
    }

    fn ensure_pump(&mut self) {
        if self.pump.is_some() {
            return;
        }
        let Some(events) = self.client.take_event_rx() else {
            return;
        };
        self.pump = Some(tokio::spawn(pump(self.shared.clone(), events)));
    }

    // ── connection state ──────────────────────────────────────────

    pub fn connection_state(&self) -> ConnectionState {
        self.client.connection_state()
    }

    pub fn connection_error(&self) -> Option<String> {
        self.client.status().last_error
    }

    pub fn synced(&self) -> bool {
        self.client.status().synced
    }

    pub fn editing_enabled(&self) -> bool {
        self.client.status().editing_enabled()
    }

    pub fn status(&self) -> SessionStatus {
        self.client.status()
    }

    // ── text ──────────────────────────────────────────────────────

    pub fn plain_text(&self) -> String {
        lock(&self.shared.engine).plain_text()
    }

    /// Replace `deleted` chars at `index` with `inserted` and ship the result.
    ///
    /// The edit travels as one batch. A full outgoing channel is reported
    /// before the replica is touched, so local and shipped state never
    /// disagree.
    pub fn apply_local_edit(&self, index: usize, inserted: &str, deleted: usize) -> Result<(), EditError> {
        let status = self.client.status();
        if !status.editing_enabled() {
            return Err(EditError::EditingDisabled(status.state));
        }

        let permit = self.client.reserve()?;
        let entries: Vec<OperationEntry> = {
            let mut engine = lock(&self.shared.engine);
            let ops = engine.apply_local_edit(index, inserted, deleted);
            let actor = engine.actor();
            let clock = engine.text().clock();
            ops.iter()
                .map(|op| OperationEntry::from_operation(actor, clock, op))
                .collect()
        };
        if entries.is_empty() {
            return Ok(());
        }

        permit.send(Outbound::Operations(entries));
        self.shared.emit_annotations();
        Ok(())
    }

    /// Move the local cursor; published to peers subject to rate limiting.
    pub fn move_cursor(&self, index: usize) {
        let anchor = lock(&self.shared.engine).anchor_at(index);
        let message = lock(&self.shared.presence).set_local_cursor(Some(anchor));
        if let Some(message) = message {
            if self.client.connection_state() == ConnectionState::Connected {
                self.shared.publish(Outbound::Presence(message));
            }
        }
    }

    // ── annotations ───────────────────────────────────────────────

    pub fn add_annotation(
        &self,
        index: usize,
        length: usize,
        author: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<Annotation, EditError> {
        let permit = self.client.reserve()?;
        let annotation = lock(&self.shared.engine).add_annotation(index, length, author, text)?;
        let record = AnnotationRecord::upsert(&annotation).map_err(CollabError::from)?;
        permit.send(Outbound::Annotation(record));
        self.shared.emit_annotations();
        Ok(annotation)
    }

    pub fn update_annotation(&self, id: &AnnotationId, patch: AnnotationPatch) -> Result<Annotation, EditError> {
        let permit = self.client.reserve()?;
        let annotation = lock(&self.shared.engine).update_annotation(id, patch)?;
        let record = AnnotationRecord::upsert(&annotation).map_err(CollabError::from)?;
        permit.send(Outbound::Annotation(record));
        self.shared.emit_annotations();
        Ok(annotation)
    }

    pub fn remove_annotation(&self, id: &AnnotationId) -> Result<Annotation, EditError> {
        let permit = self.client.reserve()?;
        let removed = lock(&self.shared.engine).remove_annotation(id)?;
        permit.send(Outbound::Annotation(AnnotationRecord::Remove { id: *id }));
        self.shared.emit_annotations();
        Ok(removed)
    }

    pub fn resolve_annotations(&self) -> Vec<ResolvedAnnotation> {
        lock(&self.shared.engine).resolve_annotations()
    }

    /// Toggle the highlighted annotation. Local only.
    pub fn set_active_annotation(&self, id: Option<AnnotationId>) -> Option<AnnotationId> {
        let active = lock(&self.shared.engine).set_active_annotation(id);
        self.shared.emit_annotations();
        active
    }

    pub fn active_annotation(&self) -> Option<AnnotationId> {
        lock(&self.shared.engine).active_annotation()
    }

    // ── presence ──────────────────────────────────────────────────

    pub fn remote_presence(&self) -> Vec<PresenceRecord> {
        lock(&self.shared.presence).participants()
    }

    /// Resolve a participant's cursor against the local text.
    pub fn remote_cursor_index(&self, participant_id: &Uuid) -> Option<usize> {
        let anchor = lock(&self.shared.presence)
            .participant(participant_id)?
            .cursor_anchor?;
        lock(&self.shared.engine).resolve_anchor(&anchor).ok()
    }

    /// Run one UI command.
    pub fn handle_command(&self, command: EditorCommand) -> Result<(), EditError> {
        match command {
            EditorCommand::LocalEdit {
                index,
                inserted,
                deleted,
            } => self.apply_local_edit(index, &inserted, deleted),
            EditorCommand::CursorMoved { index } => {
                self.move_cursor(index);
                Ok(())
            }
            EditorCommand::AddAnnotation {
                index,
                length,
                author,
                text,
            } => self.add_annotation(index, length, author, text).map(|_| ()),
            EditorCommand::UpdateAnnotation { id, patch } => self.update_annotation(&id, patch).map(|_| ()),
            EditorCommand::RemoveAnnotation(id) => self.remove_annotation(&id).map(|_| ()),
            EditorCommand::SetActiveAnnotation(id) => {
                self.set_active_annotation(id);
                Ok(())
            }
        }
    }
}

impl Drop for EditorSession {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Apply incoming sync events to the replica until the client goes away.
async fn pump(shared: Arc<Shared>, mut events: mpsc::Receiver<SyncEvent>) {
    let mut last_state = ConnectionState::Idle;

    while let Some(event) = events.recv().await {
        match event {
            SyncEvent::StateChanged(status) => {
                let state = status.state;
                if lock(&shared.presence).on_connection_state(state) {
                    shared.emit_presence();
                }
                if state == ConnectionState::Connected && last_state != ConnectionState::Connected {
                    let (announce, cursor) = {
                        let mut presence = lock(&shared.presence);
                        let cursor = presence.local_cursor().and_then(|_| presence.force_cursor());
                        (presence.announce(), cursor)
                    };
                    shared.publish(Outbound::Presence(announce));
                    if let Some(cursor) = cursor {
                        shared.publish(Outbound::Presence(cursor));
                    }
                }
                last_state = state;
                shared.emit(EditorUpdate::Connection(status));
            }

            SyncEvent::RemoteOperation { peer_id, operation } => {
                log::trace!("Merging operation from {peer_id}");
                let changed = lock(&shared.engine).apply_remote(operation);
                if changed {
                    shared.emit_annotations();
                }
            }

            SyncEvent::RemoteAnnotation { peer_id, record } => {
                let changed = match record {
                    AnnotationRecord::Remove { id } => lock(&shared.engine).apply_remote_annotation_removal(&id),
                    upsert => match upsert.into_annotation() {
                        Ok(Some(annotation)) => lock(&shared.engine).apply_remote_annotation(annotation),
                        Ok(None) => false,
                        Err(e) => {
                            log::warn!("Dropping annotation from {peer_id}: {e}");
                            false
                        }
                    },
                };
                if changed {
                    shared.emit_annotations();
                }
            }

            SyncEvent::Presence(message) => {
                let reply = lock(&shared.presence).handle_message(&message);
                if let Some(reply) = reply {
                    shared.publish(Outbound::Presence(reply));
                }
                shared.emit_presence();
            }

            SyncEvent::PeerLeft(peer_id) => {
                if lock(&shared.presence).remove_participant(&peer_id).is_some() {
                    shared.emit_presence();
                }
            }
        }
    }
    log::debug!("Editor pump finished");
}
