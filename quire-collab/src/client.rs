//! WebSocket sync client for connecting to the relay.
//!
//! Provides:
//! - Connection lifecycle driven by [`TransportSession`] (connect, backoff, give up)
//! - Operation/annotation send and receive
//! - Fire-and-forget presence
//! - Offline queue for messages submitted while not connected
//!
//! One background task (the driver) owns the socket, the in-flight connect
//! attempt and the session timer. The [`SyncClient`] handle talks to it over
//! a bounded command channel and observes status through a watch channel.
//!
//! ```text
//!  SyncClient ──Command──► Driver ──► TransportSession::handle(event)
//!      ▲                     │                 │
//!      │ watch<SessionStatus>│◄──── effects ───┘
//!      │                     ▼
//!  SyncEvent ◄────────── WebSocket
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use quire_core::Operation;

use crate::protocol::{
    AnnotationRecord, HelloPayload, MessageType, OperationEntry, PeerInfo, PresenceMessage,
    ProtocolError, SyncMessage,
};
use crate::session::{
    ConnectionState, SessionConfig, SessionEffect, SessionEvent, SessionStatus, TransportSession,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ───────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────

/// Supplies the credential sent with every connection attempt.
pub trait CredentialProvider: Send + Sync + 'static {
    fn token(&self) -> Option<String>;
}

impl<F> CredentialProvider for F
where
    F: Fn() -> Option<String> + Send + Sync + 'static,
{
    fn token(&self) -> Option<String> {
        self()
    }
}

/// A fixed token (or none).
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

impl CredentialProvider for StaticToken {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay base URL; the document id is appended as a path segment.
    pub server_url: String,
    pub session: SessionConfig,
    /// Capacity of the command channel to the driver.
    pub outgoing_capacity: usize,
    /// Capacity of the event channel to the application.
    pub event_capacity: usize,
    /// Offline queue length past which a warning is logged. Durable
    /// messages are never dropped.
    pub offline_capacity: usize,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            session: SessionConfig::default(),
            outgoing_capacity: 1024,
            event_capacity: 1024,
            offline_capacity: 10_000,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Events and outbound messages
// ───────────────────────────────────────────────────────────────────

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The session status changed (state, retry count, error or synced flag).
    StateChanged(SessionStatus),
    /// A text operation from the relay (live or backlog replay).
    RemoteOperation { peer_id: Uuid, operation: Operation },
    /// An annotation change from the relay.
    RemoteAnnotation { peer_id: Uuid, record: AnnotationRecord },
    /// Ephemeral presence from another participant.
    Presence(PresenceMessage),
    /// A participant's connection closed.
    PeerLeft(Uuid),
}

/// Something the application wants on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Operation(OperationEntry),
    /// Every operation of one local edit, shipped as a single frame.
    Operations(Vec<OperationEntry>),
    Annotation(AnnotationRecord),
    Presence(PresenceMessage),
}

impl Outbound {
    /// Durable messages survive disconnects in the offline queue.
    pub fn is_durable(&self) -> bool {
        !matches!(self, Outbound::Presence(_))
    }

    fn into_message(self, peer_id: Uuid, doc_id: Uuid) -> Result<SyncMessage, ProtocolError> {
        match self {
            Outbound::Operation(entry) => SyncMessage::operation(peer_id, doc_id, &entry),
            Outbound::Operations(entries) => SyncMessage::operations(peer_id, doc_id, &entries),
            Outbound::Annotation(record) => SyncMessage::annotation(peer_id, doc_id, 0, &record),
            Outbound::Presence(msg) => SyncMessage::presence(peer_id, doc_id, &msg),
        }
    }
}

/// Offline queue for messages submitted while disconnected.
///
/// Queued messages are replayed, in order, after the next server ack.
/// Everything queued has already been applied locally, so nothing is
/// dropped; `soft_limit` only controls when the backlog is reported.
pub struct OfflineQueue {
    queue: VecDeque<Outbound>,
    soft_limit: usize,
}

impl OfflineQueue {
    pub fn new(soft_limit: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(soft_limit.min(1024)),
            soft_limit,
        }
    }

    /// Queue a message for later replay. Returns `false` once the queue
    /// has grown past its soft limit.
    pub fn enqueue(&mut self, message: Outbound) -> bool {
        self.queue.push_back(message);
        self.queue.len() <= self.soft_limit
    }

    /// Put messages back at the front, ahead of anything queued since.
    fn requeue_front(&mut self, messages: impl DoubleEndedIterator<Item = Outbound>) {
        for message in messages.rev() {
            self.queue.push_front(message);
        }
    }

    /// Drain all queued messages for replay.
    pub fn drain(&mut self) -> Vec<Outbound> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

struct PendingDriver {
    command_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<SyncEvent>,
    status_tx: watch::Sender<SessionStatus>,
}

enum Command {
    Connect,
    Restart,
    Shutdown,
    Send(Outbound),
}

// ───────────────────────────────────────────────────────────────────
// Client handle
// ───────────────────────────────────────────────────────────────────

/// The sync client.
///
/// Cheap handle over the driver task. Dropping it aborts the driver.
pub struct SyncClient {
    peer_info: PeerInfo,
    doc_id: Uuid,
    config: ClientConfig,
    credentials: Arc<dyn CredentialProvider>,
    command_tx: mpsc::Sender<Command>,
    /// Held until the driver is spawned by the first `connect`.
    pending_driver: Option<PendingDriver>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    status_rx: watch::Receiver<SessionStatus>,
    driver: Option<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(
        peer_info: PeerInfo,
        doc_id: Uuid,
        config: ClientConfig,
        credentials: impl CredentialProvider,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(config.outgoing_capacity.max(1));
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        Self {
            peer_info,
            doc_id,
            config,
            credentials: Arc::new(credentials),
            command_tx,
            pending_driver: Some(PendingDriver {
                command_rx,
                event_tx,
                status_tx,
            }),
            event_rx: Some(event_rx),
            status_rx,
            driver: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Start (or resume) connecting. Spawns the driver on first use.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        self.ensure_driver();
        self.command(Command::Connect).await
    }

    /// Reset the retry budget and connect again, even from `Failed`.
    pub async fn restart(&mut self) -> Result<(), ProtocolError> {
        self.ensure_driver();
        self.command(Command::Restart).await
    }

    /// Close the connection and return to `Idle`. Safe to call repeatedly
    /// and before `connect`.
    pub async fn shutdown(&mut self) {
        if self.driver.is_none() {
            return;
        }
        if self.command(Command::Shutdown).await.is_err() {
            log::debug!("Driver already gone during shutdown");
        }
    }

    fn ensure_driver(&mut self) {
        if self.driver.is_some() {
            return;
        }
        let Some(pending) = self.pending_driver.take() else {
            return;
        };
        let driver = Driver {
            peer_info: self.peer_info.clone(),
            doc_id: self.doc_id,
            server_url: self.config.server_url.clone(),
            credentials: self.credentials.clone(),
            session: TransportSession::new(self.config.session.clone()),
            command_rx: pending.command_rx,
            event_tx: pending.event_tx,
            status_tx: pending.status_tx,
            offline: OfflineQueue::new(self.config.offline_capacity),
            socket: None,
            connecting: None,
            retry_at: None,
        };
        self.driver = Some(tokio::spawn(driver.run()));
    }

    async fn command(&self, command: Command) -> Result<(), ProtocolError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Queue a message for the driver without waiting.
    pub fn send(&self, message: Outbound) -> Result<(), ProtocolError> {
        try_submit(&self.command_tx, message)
    }

    /// Reserve a slot in the command channel.
    ///
    /// Callers that mutate local state before sending reserve first, so a
    /// full channel is reported before anything changes.
    pub fn reserve(&self) -> Result<SendPermit<'_>, ProtocolError> {
        try_reserve(&self.command_tx)
    }

    /// Ship every operation of one local edit as a single frame.
    pub fn send_operations(&self, entries: Vec<OperationEntry>) -> Result<(), ProtocolError> {
        self.send(Outbound::Operations(entries))
    }

    /// A cloneable sending half, for tasks that do not own the client.
    pub fn outbox(&self) -> Outbox {
        Outbox {
            command_tx: self.command_tx.clone(),
        }
    }

    /// Ship a text operation; queued offline when not connected.
    pub fn send_operation(&self, entry: OperationEntry) -> Result<(), ProtocolError> {
        self.send(Outbound::Operation(entry))
    }

    /// Ship an annotation change; queued offline when not connected.
    pub fn send_annotation(&self, record: AnnotationRecord) -> Result<(), ProtocolError> {
        self.send(Outbound::Annotation(record))
    }

    /// Publish presence. Dropped when not connected.
    pub fn send_presence(&self, message: PresenceMessage) -> Result<(), ProtocolError> {
        self.send(Outbound::Presence(message))
    }

    pub fn status(&self) -> SessionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.status_rx.borrow().state
    }

    /// Watch status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn server_url(&self) -> &str {
        &self.config.server_url
    }

    /// Relay URL for this document.
    pub fn document_url(&self) -> String {
        document_url(&self.config.server_url, self.doc_id)
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

/// Sending half of a [`SyncClient`].
#[derive(Clone)]
pub struct Outbox {
    command_tx: mpsc::Sender<Command>,
}

impl Outbox {
    pub fn send(&self, message: Outbound) -> Result<(), ProtocolError> {
        try_submit(&self.command_tx, message)
    }

    pub fn reserve(&self) -> Result<SendPermit<'_>, ProtocolError> {
        try_reserve(&self.command_tx)
    }
}

/// A reserved slot in the command channel. Sending through it cannot fail.
pub struct SendPermit<'a> {
    permit: mpsc::Permit<'a, Command>,
}

impl SendPermit<'_> {
    pub fn send(self, message: Outbound) {
        self.permit.send(Command::Send(message));
    }
}

fn channel_error<T>(error: mpsc::error::TrySendError<T>) -> ProtocolError {
    match error {
        mpsc::error::TrySendError::Full(_) => ProtocolError::QueueFull,
        mpsc::error::TrySendError::Closed(_) => ProtocolError::ConnectionClosed,
    }
}

fn try_submit(command_tx: &mpsc::Sender<Command>, message: Outbound) -> Result<(), ProtocolError> {
    command_tx.try_send(Command::Send(message)).map_err(channel_error)
}

fn try_reserve(command_tx: &mpsc::Sender<Command>) -> Result<SendPermit<'_>, ProtocolError> {
    command_tx
        .try_reserve()
        .map(|permit| SendPermit { permit })
        .map_err(channel_error)
}

fn document_url(server_url: &str, doc_id: Uuid) -> String {
    format!("{}/{}", server_url.trim_end_matches('/'), doc_id)
}

// ───────────────────────────────────────────────────────────────────
// Driver task
// ───────────────────────────────────────────────────────────────────

struct Driver {
    peer_info: PeerInfo,
    doc_id: Uuid,
    server_url: String,
    credentials: Arc<dyn CredentialProvider>,
    session: TransportSession,
    command_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<SyncEvent>,
    status_tx: watch::Sender<SessionStatus>,
    offline: OfflineQueue,
    socket: Option<WsStream>,
    connecting: Option<JoinHandle<Result<WsStream, WsError>>>,
    retry_at: Option<Instant>,
}

async fn next_frame(socket: &mut Option<WsStream>) -> Option<Result<Message, WsError>> {
    match socket {
        Some(ws) => ws.next().await,
        None => std::future::pending().await,
    }
}

async fn connect_finished(
    pending: &mut Option<JoinHandle<Result<WsStream, WsError>>>,
) -> Result<Result<WsStream, WsError>, tokio::task::JoinError> {
    match pending {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn retry_timer(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Driver {
    async fn run(mut self) {
        log::debug!("Sync driver started for doc {}", self.doc_id);
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(Command::Connect) => self.dispatch(SessionEvent::Connect).await,
                    Some(Command::Restart) => self.dispatch(SessionEvent::Restart).await,
                    Some(Command::Shutdown) => self.dispatch(SessionEvent::Shutdown).await,
                    Some(Command::Send(message)) => self.submit(message).await,
                    None => {
                        self.dispatch(SessionEvent::Shutdown).await;
                        break;
                    }
                },

                result = connect_finished(&mut self.connecting) => {
                    self.connecting = None;
                    match result {
                        Ok(Ok(ws)) => self.on_socket_open(ws).await,
                        Ok(Err(e)) => self.dispatch(connect_error_event(e)).await,
                        Err(e) => self.dispatch(SessionEvent::NetworkError(e.to_string())).await,
                    }
                }

                frame = next_frame(&mut self.socket) => self.on_frame(frame).await,

                _ = retry_timer(self.retry_at) => {
                    self.retry_at = None;
                    self.dispatch(SessionEvent::RetryTimerFired).await;
                }
            }
        }
        log::debug!("Sync driver stopped for doc {}", self.doc_id);
    }

    /// Run one event through the session and execute its effects.
    ///
    /// A failed offline replay feeds a follow-up `NetworkError` through
    /// the same loop.
    async fn dispatch(&mut self, event: SessionEvent) {
        let mut next = Some(event);
        while let Some(event) = next.take() {
            let before = self.session.status().clone();
            let transition = self.session.handle(event);

            for effect in transition.effects {
                match effect {
                    SessionEffect::OpenConnection { attempt } => self.open_connection(attempt),
                    SessionEffect::CloseConnection => self.close_connection(),
                    SessionEffect::ScheduleRetry(delay) => self.retry_at = Some(Instant::now() + delay),
                    SessionEffect::CancelRetry => self.retry_at = None,
                }
            }

            let status = self.session.status().clone();
            if status != before {
                self.status_tx.send_replace(status.clone());
                self.emit(SyncEvent::StateChanged(status)).await;
            }
            if transition.from == ConnectionState::Connecting && transition.to == ConnectionState::Connected {
                next = self.replay_offline().await.map(SessionEvent::NetworkError);
            }
        }
    }

    fn open_connection(&mut self, attempt: u32) {
        if let Some(previous) = self.connecting.take() {
            previous.abort();
        }
        let url = document_url(&self.server_url, self.doc_id);
        log::info!("Connecting to {url} (attempt {attempt})");
        self.connecting = Some(tokio::spawn(async move {
            tokio_tungstenite::connect_async(url).await.map(|(ws, _)| ws)
        }));
    }

    fn close_connection(&mut self) {
        if let Some(pending) = self.connecting.take() {
            pending.abort();
        }
        if let Some(mut ws) = self.socket.take() {
            tokio::spawn(async move {
                let _ = tokio::time::timeout(Duration::from_secs(1), ws.close(None)).await;
            });
        }
    }

    async fn on_socket_open(&mut self, ws: WsStream) {
        if self.session.state() != ConnectionState::Connecting {
            return;
        }
        self.socket = Some(ws);
        let hello = HelloPayload {
            peer: self.peer_info.clone(),
            token: self.credentials.token(),
        };
        let sent = match SyncMessage::hello(self.doc_id, &hello) {
            Ok(msg) => self.write(&msg).await,
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = sent {
            self.dispatch(SessionEvent::NetworkError(e)).await;
        }
    }

    async fn on_frame(&mut self, frame: Option<Result<Message, WsError>>) {
        match frame {
            Some(Ok(Message::Binary(data))) => match SyncMessage::decode(&data) {
                Ok(msg) => self.on_message(msg).await,
                Err(e) => log::warn!("Failed to decode message from relay: {e}"),
            },
            Some(Ok(Message::Close(Some(close)))) => {
                self.socket = None;
                let event = SessionEvent::ServerClose {
                    code: u16::from(close.code),
                    reason: close.reason.to_string(),
                };
                self.dispatch(event).await;
            }
            Some(Ok(Message::Close(None))) | None => {
                self.socket = None;
                self.dispatch(SessionEvent::NetworkError("connection closed".into())).await;
            }
            Some(Err(e)) => {
                self.socket = None;
                self.dispatch(SessionEvent::NetworkError(e.to_string())).await;
            }
            Some(Ok(_)) => {}
        }
    }

    async fn on_message(&mut self, msg: SyncMessage) {
        match msg.msg_type {
            MessageType::Welcome => self.dispatch(SessionEvent::ServerAck).await,
            MessageType::SyncComplete => self.dispatch(SessionEvent::SyncComplete).await,
            MessageType::Operation => {
                match msg.operation_entry().and_then(OperationEntry::into_operation) {
                    Ok(operation) => {
                        self.emit(SyncEvent::RemoteOperation {
                            peer_id: msg.peer_id,
                            operation,
                        })
                        .await
                    }
                    Err(e) => log::warn!("Dropping operation from {}: {e}", msg.peer_id),
                }
            }
            MessageType::OperationBatch => {
                let operations: Result<Vec<Operation>, ProtocolError> = msg
                    .operation_batch()
                    .and_then(|entries| entries.into_iter().map(OperationEntry::into_operation).collect());
                match operations {
                    Ok(operations) => {
                        for operation in operations {
                            self.emit(SyncEvent::RemoteOperation {
                                peer_id: msg.peer_id,
                                operation,
                            })
                            .await;
                        }
                    }
                    Err(e) => log::warn!("Dropping operation batch from {}: {e}", msg.peer_id),
                }
            }
            MessageType::Annotation => match msg.annotation_record() {
                Ok(record) => {
                    self.emit(SyncEvent::RemoteAnnotation {
                        peer_id: msg.peer_id,
                        record,
                    })
                    .await
                }
                Err(e) => log::warn!("Dropping annotation from {}: {e}", msg.peer_id),
            },
            MessageType::Presence => match msg.presence_message() {
                Ok(presence) => self.emit(SyncEvent::Presence(presence)).await,
                Err(e) => log::warn!("Dropping presence from {}: {e}", msg.peer_id),
            },
            MessageType::PeerLeft => self.emit(SyncEvent::PeerLeft(msg.peer_id)).await,
            MessageType::Ping => {
                let pong = SyncMessage::pong(self.peer_info.peer_id);
                if let Err(e) = self.write(&pong).await {
                    self.dispatch(SessionEvent::NetworkError(e)).await;
                }
            }
            MessageType::Pong => log::trace!("Pong from relay"),
            MessageType::Hello => log::debug!("Ignoring hello from relay"),
        }
    }

    /// Send now if connected, otherwise queue (durable) or drop (presence).
    async fn submit(&mut self, message: Outbound) {
        if self.session.state() == ConnectionState::Connected && self.socket.is_some() {
            let msg = match message.clone().into_message(self.peer_info.peer_id, self.doc_id) {
                Ok(msg) => msg,
                Err(e) => {
                    log::error!("Cannot encode outgoing message: {e}");
                    return;
                }
            };
            if let Err(e) = self.write(&msg).await {
                self.queue_offline(message);
                self.dispatch(SessionEvent::NetworkError(e)).await;
            }
            return;
        }
        self.queue_offline(message);
    }

    fn queue_offline(&mut self, message: Outbound) {
        if !message.is_durable() {
            log::trace!("Dropping presence while offline");
            return;
        }
        if !self.offline.enqueue(message) {
            log::warn!("Offline queue holds {} messages and is still growing", self.offline.len());
        }
    }

    /// Write queued messages in order. On failure the unsent tail goes back
    /// to the front of the queue and the write error is returned.
    async fn replay_offline(&mut self) -> Option<String> {
        let queued = self.offline.drain();
        if queued.is_empty() {
            return None;
        }
        log::info!("Replaying {} queued messages", queued.len());
        let mut pending = queued.into_iter();
        while let Some(message) = pending.next() {
            let msg = match message.clone().into_message(self.peer_info.peer_id, self.doc_id) {
                Ok(msg) => msg,
                Err(e) => {
                    log::error!("Cannot encode queued message: {e}");
                    continue;
                }
            };
            if let Err(e) = self.write(&msg).await {
                self.offline.requeue_front(std::iter::once(message).chain(pending));
                return Some(e);
            }
        }
        None
    }

    async fn write(&mut self, msg: &SyncMessage) -> Result<(), String> {
        let encoded = msg.encode().map_err(|e| e.to_string())?;
        let ws = self.socket.as_mut().ok_or_else(|| "not connected".to_string())?;
        ws.send(Message::Binary(encoded.into())).await.map_err(|e| e.to_string())
    }

    async fn emit(&self, event: SyncEvent) {
        if self.event_tx.send(event).await.is_err() {
            log::trace!("Event receiver dropped");
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if let Some(pending) = self.connecting.take() {
            pending.abort();
        }
    }
}

/// Map a failed handshake to a session event; HTTP 401 is an auth failure.
fn connect_error_event(error: WsError) -> SessionEvent {
    match error {
        WsError::Http(response) => {
            let code = response.status().as_u16();
            SessionEvent::ServerClose {
                code,
                reason: format!("handshake rejected with HTTP {code}"),
            }
        }
        other => SessionEvent::NetworkError(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_core::TextStore;

    fn entry(text: &str) -> OperationEntry {
        let actor = Uuid::new_v4();
        let mut store = TextStore::new(actor);
        let ops = store.apply_local(0, text, 0);
        OperationEntry::from_operation(actor, store.clock(), &ops[0])
    }

    fn presence() -> PresenceMessage {
        PresenceMessage {
            participant_id: Uuid::new_v4(),
            state: crate::protocol::PresenceState::Leave,
        }
    }

    #[test]
    fn test_client_creation() {
        let info = PeerInfo::new("TestUser");
        let doc_id = Uuid::new_v4();
        let client = SyncClient::new(info, doc_id, ClientConfig::new("ws://localhost:9090/"), StaticToken::none());

        assert_eq!(client.peer_info().name, "TestUser");
        assert_eq!(client.doc_id(), doc_id);
        assert_eq!(client.server_url(), "ws://localhost:9090/");
        assert_eq!(client.document_url(), format!("ws://localhost:9090/{doc_id}"));
        assert_eq!(client.connection_state(), ConnectionState::Idle);
    }

    #[test]
    fn test_credential_providers() {
        assert_eq!(StaticToken::new("abc").token().as_deref(), Some("abc"));
        assert_eq!(StaticToken::none().token(), None);
        let closure = || Some("from-closure".to_string());
        assert_eq!(closure.token().as_deref(), Some("from-closure"));
    }

    #[tokio::test]
    async fn test_shutdown_before_connect_is_noop() {
        let mut client = SyncClient::new(PeerInfo::new("A"), Uuid::new_v4(), ClientConfig::default(), StaticToken::none());
        client.shutdown().await;
        client.shutdown().await;
        assert_eq!(client.connection_state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_send_before_connect_is_buffered() {
        let client = SyncClient::new(PeerInfo::new("A"), Uuid::new_v4(), ClientConfig::default(), StaticToken::none());
        assert!(client.send_operation(entry("hi")).is_ok());
        assert!(client.send_presence(presence()).is_ok());
    }

    #[tokio::test]
    async fn test_send_backpressure() {
        let config = ClientConfig {
            outgoing_capacity: 1,
            ..ClientConfig::default()
        };
        let client = SyncClient::new(PeerInfo::new("A"), Uuid::new_v4(), config, StaticToken::none());
        client.send_operation(entry("a")).unwrap();
        assert_eq!(client.send_operation(entry("b")), Err(ProtocolError::QueueFull));
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new(PeerInfo::new("A"), Uuid::new_v4(), ClientConfig::default(), StaticToken::none());
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_relay_fails_after_retries() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = ClientConfig {
            session: SessionConfig {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(20),
                connect_timeout: Duration::from_secs(2),
                ..SessionConfig::default()
            },
            ..ClientConfig::new(format!("ws://127.0.0.1:{port}"))
        };
        let mut client = SyncClient::new(PeerInfo::new("A"), Uuid::new_v4(), config, StaticToken::none());
        let mut status = client.subscribe_status();
        client.connect().await.unwrap();

        let failed = tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| s.state == ConnectionState::Failed),
        )
        .await
        .expect("client should give up")
        .unwrap()
        .clone();
        assert_eq!(failed.retry_count, 3);
        assert!(failed.last_error.unwrap().starts_with("retry limit exceeded"));
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());

        queue.enqueue(Outbound::Operation(entry("a")));
        queue.enqueue(Outbound::Operation(entry("b")));
        assert_eq!(queue.len(), 2);

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert!(matches!(&drained[0], Outbound::Operation(e) if e.payload == "a"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_keeps_messages_past_soft_limit() {
        let mut queue = OfflineQueue::new(2);
        assert!(queue.enqueue(Outbound::Operation(entry("a"))));
        assert!(queue.enqueue(Outbound::Operation(entry("b"))));
        assert!(!queue.enqueue(Outbound::Operation(entry("c"))));
        assert_eq!(queue.len(), 3);

        let drained = queue.drain();
        assert!(matches!(&drained[2], Outbound::Operation(e) if e.payload == "c"));

        queue.enqueue(Outbound::Operation(entry("d")));
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_front_preserves_order() {
        let mut queue = OfflineQueue::new(10);
        queue.enqueue(Outbound::Operation(entry("c")));
        queue.requeue_front(vec![Outbound::Operation(entry("a")), Outbound::Operation(entry("b"))].into_iter());

        let payloads: Vec<String> = queue
            .drain()
            .into_iter()
            .map(|m| match m {
                Outbound::Operation(e) => e.payload,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(payloads, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_reserve_reports_full_before_anything_is_sent() {
        let config = ClientConfig {
            outgoing_capacity: 1,
            ..ClientConfig::default()
        };
        let client = SyncClient::new(PeerInfo::new("A"), Uuid::new_v4(), config, StaticToken::none());

        let permit = client.reserve().unwrap();
        assert!(matches!(client.reserve(), Err(ProtocolError::QueueFull)));
        assert!(matches!(client.outbox().reserve(), Err(ProtocolError::QueueFull)));
        permit.send(Outbound::Operations(vec![entry("a"), entry("b")]));

        assert_eq!(client.send_operation(entry("c")), Err(ProtocolError::QueueFull));
    }

    #[tokio::test]
    async fn test_whole_edit_fits_one_command_slot() {
        let config = ClientConfig {
            outgoing_capacity: 1,
            ..ClientConfig::default()
        };
        let client = SyncClient::new(PeerInfo::new("A"), Uuid::new_v4(), config, StaticToken::none());
        let entries: Vec<OperationEntry> = (0..5000).map(|_| entry("x")).collect();
        assert!(client.send_operations(entries).is_ok());
    }

    fn offline_driver(queued: &[&str]) -> (Driver, mpsc::Receiver<SyncEvent>) {
        let (_command_tx, command_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::channel(64);
        let (status_tx, _) = watch::channel(SessionStatus::default());
        let mut offline = OfflineQueue::new(100);
        for text in queued {
            offline.enqueue(Outbound::Operation(entry(text)));
        }
        let driver = Driver {
            peer_info: PeerInfo::new("A"),
            doc_id: Uuid::new_v4(),
            server_url: "ws://127.0.0.1:9".into(),
            credentials: Arc::new(StaticToken::none()),
            session: TransportSession::new(SessionConfig::default()),
            command_rx,
            event_tx,
            status_tx,
            offline,
            socket: None,
            connecting: None,
            retry_at: None,
        };
        (driver, event_rx)
    }

    #[tokio::test]
    async fn test_failed_replay_keeps_queue_and_disconnects() {
        let (mut driver, mut events) = offline_driver(&["a", "b", "c"]);
        driver.session.handle(SessionEvent::Connect);

        // Acked without a socket: the first replay write fails.
        driver.dispatch(SessionEvent::ServerAck).await;

        assert_eq!(driver.session.state(), ConnectionState::Disconnected);
        assert!(driver.retry_at.is_some());
        assert_eq!(driver.offline.len(), 3);
        assert!(driver.status_tx.borrow().last_error.is_some());

        let mut states = Vec::new();
        while let Ok(SyncEvent::StateChanged(status)) = events.try_recv() {
            states.push(status.state);
        }
        assert_eq!(states, [ConnectionState::Connected, ConnectionState::Disconnected]);

        let payloads: Vec<String> = driver
            .offline
            .drain()
            .into_iter()
            .filter_map(|m| match m {
                Outbound::Operation(e) => Some(e.payload),
                _ => None,
            })
            .collect();
        assert_eq!(payloads, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_empty_replay_stays_connected() {
        let (mut driver, _events) = offline_driver(&[]);
        driver.session.handle(SessionEvent::Connect);
        driver.dispatch(SessionEvent::ServerAck).await;
        assert_eq!(driver.session.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_presence_is_not_durable() {
        assert!(!Outbound::Presence(presence()).is_durable());
        assert!(Outbound::Operation(entry("x")).is_durable());
        assert!(Outbound::Operations(vec![entry("x")]).is_durable());
        assert!(Outbound::Annotation(AnnotationRecord::Remove { id: Uuid::new_v4() }).is_durable());
    }
}
