//! WebSocket relay with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (doc_id) ── backlog (ops + annotations)
//! Client B ──┘         │
//!                      └── BroadcastGroup
//!                               │
//!                    ┌──────────┼───────────┐
//!                    ▼          ▼           ▼
//!                 Client A   Client B    Client C
//! ```
//!
//! Connection handshake:
//! 1. client sends `Hello { peer, token }`
//! 2. relay checks the token (close 4401 on mismatch)
//! 3. relay sends `Welcome`, replays the backlog, sends `SyncComplete`
//! 4. live fan-out until either side closes
//!
//! The relay never interprets operations; it only orders and stores them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, RoomManager};
use crate::protocol::{MessageType, PeerInfo, SyncMessage, CLOSE_UNAUTHORIZED};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Shared token clients must present; `None` accepts everyone.
    pub auth_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            auth_token: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// The relay server.
pub struct SyncServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

/// A running relay.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

struct Connection {
    addr: SocketAddr,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
    config: ServerConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the listener and start accepting in the background.
    pub async fn bind(self) -> std::io::Result<ServerHandle> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Relay listening on {local_addr}");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.rooms.clone(),
            self.stats.clone(),
            self.config.clone(),
            shutdown_rx,
        ));

        Ok(ServerHandle {
            local_addr,
            shutdown_tx,
            accept_task,
            rooms: self.rooms,
            stats: self.stats,
        })
    }

    /// Bind and serve until the accept loop ends.
    pub async fn run(self) -> Result<(), BoxError> {
        let handle = self.bind().await?;
        handle.accept_task.await?;
        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` base URL clients should connect to.
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    /// Stop accepting and close every open connection.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.accept_task.await {
            log::warn!("Accept loop ended abnormally: {e}");
        }
        log::info!("Relay on {} shut down", self.local_addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
    config: ServerConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::error!("Accept failed: {e}");
                        continue;
                    }
                };
                log::debug!("New TCP connection from {addr}");

                let connection = Connection {
                    addr,
                    rooms: rooms.clone(),
                    stats: stats.clone(),
                    config: config.clone(),
                    shutdown_rx: shutdown_rx.clone(),
                };
                tokio::spawn(async move {
                    if let Err(e) = connection.handle(stream).await {
                        log::error!("Connection error from {addr}: {e}");
                    }
                });
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}

fn close_message(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }))
}

impl Connection {
    async fn handle(mut self, stream: TcpStream) -> Result<(), BoxError> {
        let addr = self.addr;
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Handshake: the first binary message must be a Hello.
        let hello = loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => match SyncMessage::decode(&data) {
                        Ok(msg) if msg.msg_type == MessageType::Hello => break msg,
                        Ok(msg) => log::debug!("Ignoring {:?} before hello from {addr}", msg.msg_type),
                        Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        self.finish(None).await;
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        self.finish(None).await;
                        return Err(e.into());
                    }
                    Some(Ok(_)) => {}
                },
                _ = self.shutdown_rx.changed() => {
                    let _ = ws_sender.send(close_message(1001, "relay shutting down")).await;
                    self.finish(None).await;
                    return Ok(());
                }
            }
        };

        let payload = match hello.hello_payload() {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("Malformed hello from {addr}: {e}");
                let _ = ws_sender.send(close_message(1002, "malformed hello")).await;
                self.finish(None).await;
                return Ok(());
            }
        };

        if let Some(expected) = &self.config.auth_token {
            if payload.token.as_deref() != Some(expected.as_str()) {
                log::warn!("Rejecting peer {} from {addr}: bad credential", payload.peer.peer_id);
                self.stats.write().await.rejected_connections += 1;
                let _ = ws_sender.send(close_message(CLOSE_UNAUTHORIZED, "unauthorized")).await;
                // Let the client read the close frame before the socket goes away.
                let _ = tokio::time::timeout(Duration::from_secs(1), ws_receiver.next()).await;
                self.finish(None).await;
                return Ok(());
            }
        }

        let peer: PeerInfo = payload.peer;
        let peer_id = peer.peer_id;
        let doc_id = hello.doc_id;
        let room = self.rooms.get_or_create(doc_id).await;
        let membership = room.add_peer(peer.clone()).await;
        let mut broadcast_rx = membership.receiver;
        self.stats.write().await.active_rooms = self.rooms.room_count().await;

        log::info!(
            "Peer {} ({}) joined doc {doc_id}, replaying {} messages",
            peer.name,
            peer_id,
            membership.backlog.len()
        );

        let joined = async {
            ws_sender
                .send(Message::Binary(SyncMessage::welcome(peer_id, doc_id).encode()?.into()))
                .await?;
            for frame in &membership.backlog {
                ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
            }
            ws_sender
                .send(Message::Binary(SyncMessage::sync_complete(doc_id).encode()?.into()))
                .await?;
            Ok::<(), BoxError>(())
        }
        .await;
        if let Err(e) = joined {
            self.finish(Some((&room, peer_id, doc_id))).await;
            return Err(e);
        }

        let result: Result<(), BoxError> = loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        {
                            let mut s = self.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }
                        match SyncMessage::decode(&data) {
                            Ok(msg) => match msg.msg_type {
                                _ if msg.is_durable() => {
                                    log::trace!("Recording {:?} from {peer_id} in doc {doc_id}", msg.msg_type);
                                    room.record_and_broadcast(Arc::new(data.to_vec())).await;
                                }
                                MessageType::Presence => {
                                    room.broadcast_raw(Arc::new(data.to_vec()));
                                }
                                MessageType::Ping => {
                                    let pong = match SyncMessage::pong(peer_id).encode() {
                                        Ok(bytes) => bytes,
                                        Err(e) => break Err(e.into()),
                                    };
                                    if let Err(e) = ws_sender.send(Message::Binary(pong.into())).await {
                                        break Err(e.into());
                                    }
                                }
                                other => log::debug!("Unhandled message type from {peer_id}: {other:?}"),
                            },
                            Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break Ok(());
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break Ok(());
                    }
                    Some(Ok(_)) => {}
                },

                frame = broadcast_rx.recv() => match frame {
                    Ok(data) => {
                        // Don't echo back to sender
                        if let Ok(msg) = SyncMessage::decode(&data) {
                            if msg.peer_id == peer_id {
                                continue;
                            }
                        }
                        if let Err(e) = ws_sender.send(Message::Binary(data.to_vec().into())).await {
                            break Err(e.into());
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Missed durable messages; make the peer reconnect and replay.
                        log::warn!("Peer {peer_id} lagged by {n} messages; closing");
                        room.record_dropped(n);
                        let _ = ws_sender.send(close_message(1013, "lagged")).await;
                        break Ok(());
                    }
                    Err(broadcast::error::RecvError::Closed) => break Ok(()),
                },

                _ = self.shutdown_rx.changed() => {
                    let _ = ws_sender.send(close_message(1001, "relay shutting down")).await;
                    break Ok(());
                }
            }
        };

        self.finish(Some((&room, peer_id, doc_id))).await;
        result
    }

    /// Leave the room (if joined) and update stats.
    async fn finish(&self, joined: Option<(&Arc<BroadcastGroup>, Uuid, Uuid)>) {
        if let Some((room, peer_id, doc_id)) = joined {
            room.remove_peer(&peer_id).await;
            if let Err(e) = room.broadcast(&SyncMessage::peer_left(peer_id, doc_id)) {
                log::warn!("Failed to announce departure of {peer_id}: {e}");
            }
            if self.rooms.remove_if_empty(&doc_id).await {
                log::info!("Room {doc_id} removed (empty)");
            }
            log::info!("Peer {peer_id} left doc {doc_id}");
        }

        let mut s = self.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_rooms = self.rooms.room_count().await;
    }
}
