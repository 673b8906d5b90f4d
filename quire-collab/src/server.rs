//! WebSocket relay: the sync endpoint sessions connect to.
//!
//! ```text
//! Session A ──┐
//!             ├── Room (doc id) ── SharedDoc (authoritative) ── BroadcastGroup
//! Session B ──┘        │
//!                      └── awareness roster (replayed to newcomers)
//! ```
//!
//! Each room keeps:
//! - A [`SharedDoc`] merging every writable client's updates
//! - A [`BroadcastGroup`] for fan-out
//! - The last awareness entry per connected client
//!
//! Rooms live for the lifetime of the relay. Nothing is persisted.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{BroadcastGroup, Envelope, PeerInfo};
use crate::document::{DocumentId, SharedDoc};
use crate::protocol::{AwarenessEntry, AwarenessUpdate, ClientId, JoinRequest, MessageType, SyncMessage};

/// Client id the relay uses for its own messages.
pub const RELAY_CLIENT_ID: ClientId = 0;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Share token → document id it grants access to
    pub share_tokens: HashMap<String, String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            share_tokens: HashMap::new(),
        }
    }
}

impl RelayConfig {
    /// Read `QUIRE_BIND_ADDR`, `QUIRE_BROADCAST_CAPACITY` and
    /// `QUIRE_SHARE_TOKENS` over the defaults.
    pub fn from_env() -> Result<Self, RelayError> {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("QUIRE_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(raw) = std::env::var("QUIRE_BROADCAST_CAPACITY") {
            config.broadcast_capacity = raw
                .trim()
                .parse()
                .map_err(|_| RelayError::Config(format!("QUIRE_BROADCAST_CAPACITY={raw:?}")))?;
        }
        if let Ok(raw) = std::env::var("QUIRE_SHARE_TOKENS") {
            config.share_tokens = parse_share_tokens(&raw)?;
        }
        Ok(config)
    }

    pub fn with_share_token(mut self, token: impl Into<String>, doc_id: impl Into<String>) -> Self {
        self.share_tokens.insert(token.into(), doc_id.into());
        self
    }

    /// Decide whether a join may proceed.
    ///
    /// No token means owner access. A token must map to exactly this document.
    pub fn authorize(&self, doc_id: &DocumentId, token: Option<&str>) -> Result<(), String> {
        match token {
            None => Ok(()),
            Some(token) => match self.share_tokens.get(token) {
                Some(granted) if granted == doc_id.as_str() => Ok(()),
                Some(_) => Err("share token is for another document".to_string()),
                None => Err("invalid share token".to_string()),
            },
        }
    }
}

/// Parse `token=docId,token=docId`.
pub fn parse_share_tokens(raw: &str) -> Result<HashMap<String, String>, RelayError> {
    let mut tokens = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (token, doc_id) = pair
            .split_once('=')
            .ok_or_else(|| RelayError::Config(format!("share token entry {pair:?} lacks '='")))?;
        let (token, doc_id) = (token.trim(), doc_id.trim());
        if token.is_empty() {
            return Err(RelayError::Config(format!("empty share token in {pair:?}")));
        }
        DocumentId::parse(doc_id).map_err(|e| RelayError::Config(e.to_string()))?;
        tokens.insert(token.to_string(), doc_id.to_string());
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub rejected_joins: u64,
    pub dropped_read_only_updates: u64,
    pub active_rooms: usize,
}

struct Room {
    doc: SharedDoc,
    broadcast: BroadcastGroup,
    /// Last awareness entry per client, tagged with the connection that sent it
    roster: Mutex<HashMap<ClientId, (u64, AwarenessEntry)>>,
}

impl Room {
    fn new(id: DocumentId, capacity: usize) -> Self {
        Self {
            doc: SharedDoc::new(id),
            broadcast: BroadcastGroup::new(capacity),
            roster: Mutex::new(HashMap::new()),
        }
    }

    fn roster(&self) -> MutexGuard<'_, HashMap<ClientId, (u64, AwarenessEntry)>> {
        self.roster.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Keep the newest entry per client. Returns false for stale entries.
    ///
    /// Clocks are only compared within one connection: a reconnected client
    /// replaces whatever its previous socket left behind.
    fn remember(&self, connection: u64, entry: &AwarenessEntry) -> bool {
        let mut roster = self.roster();
        match roster.get(&entry.client_id) {
            Some((known_conn, known)) if *known_conn == connection && known.clock > entry.clock => false,
            _ => {
                if entry.state.is_some() {
                    roster.insert(entry.client_id, (connection, entry.clone()));
                } else {
                    roster.remove(&entry.client_id);
                }
                true
            }
        }
    }

    /// Drop the client's entry if `connection` still owns it.
    fn forget(&self, client_id: ClientId, connection: u64) -> bool {
        let mut roster = self.roster();
        match roster.get(&client_id) {
            Some((known_conn, _)) if *known_conn == connection => roster.remove(&client_id).is_some(),
            _ => false,
        }
    }

    fn snapshot(&self, except: ClientId) -> AwarenessUpdate {
        let mut entries: Vec<AwarenessEntry> = self
            .roster()
            .values()
            .map(|(_, e)| e)
            .filter(|e| e.client_id != except)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.client_id);
        AwarenessUpdate { entries }
    }
}

type Rooms = Arc<RwLock<HashMap<DocumentId, Arc<Room>>>>;

/// A joined connection.
struct Member {
    client_id: ClientId,
    connection: u64,
    doc_id: DocumentId,
    read_only: bool,
    room: Arc<Room>,
}

type ConnResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// The relay server.
pub struct RelayServer {
    config: Arc<RelayConfig>,
    rooms: Rooms,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config: Arc::new(config),
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Authoritative text of a room, if it exists.
    pub async fn document_text(&self, doc_id: &str) -> Option<String> {
        let id = DocumentId::parse(doc_id).ok()?;
        self.rooms.read().await.get(&id).map(|room| room.doc.text())
    }

    async fn room(rooms: &Rooms, doc_id: &DocumentId, capacity: usize, stats: &RwLock<RelayStats>) -> Arc<Room> {
        if let Some(room) = rooms.read().await.get(doc_id) {
            return room.clone();
        }
        let mut rooms_w = rooms.write().await;
        let room = rooms_w
            .entry(doc_id.clone())
            .or_insert_with(|| {
                log::info!("Room {doc_id} created");
                Arc::new(Room::new(doc_id.clone(), capacity))
            })
            .clone();
        let count = rooms_w.len();
        drop(rooms_w);
        stats.write().await.active_rooms = count;
        room
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Rooms,
        stats: Arc<RwLock<RelayStats>>,
        config: Arc<RelayConfig>,
    ) -> ConnResult {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        let connection = {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
            s.total_connections
        };

        let mut member: Option<Member> = None;
        let mut broadcast_rx: Option<broadcast::Receiver<Envelope>> = None;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let data: Vec<u8> = match msg {
                        Some(Ok(Message::Binary(data))) => data.into(),
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        Some(Ok(_)) => continue,
                    };
                    stats.write().await.total_messages += 1;

                    let sync_msg = match SyncMessage::decode(&data) {
                        Ok(m) => m,
                        Err(e) => {
                            log::warn!("Failed to decode message from {addr}: {e}");
                            continue;
                        }
                    };

                    if member.is_none() {
                        if sync_msg.msg_type != MessageType::Join {
                            log::debug!("Ignoring {:?} from {addr} before join", sync_msg.msg_type);
                            continue;
                        }
                        match Self::admit(&sync_msg, &config) {
                            Ok((doc_id, request)) => {
                                let room = Self::room(&rooms, &doc_id, config.broadcast_capacity, &stats).await;
                                let info = PeerInfo {
                                    client_id: sync_msg.client_id,
                                    connection,
                                    read_only: request.read_only,
                                };
                                broadcast_rx = Some(room.broadcast.add_peer(info).await);
                                log::info!(
                                    "Client {} joined {doc_id}{}",
                                    sync_msg.client_id,
                                    if request.read_only { " (read-only)" } else { "" }
                                );
                                member = Some(Member {
                                    client_id: sync_msg.client_id,
                                    connection,
                                    doc_id,
                                    read_only: request.read_only,
                                    room,
                                });
                            }
                            Err(reason) => {
                                log::warn!("Rejected join from {addr} for {:?}: {reason}", sync_msg.doc_id);
                                stats.write().await.rejected_joins += 1;
                                let reply = SyncMessage::auth_rejected(&sync_msg.doc_id, &reason);
                                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                let _ = ws_sender.close().await;
                                break;
                            }
                        }
                        continue;
                    }
                    let Some(joined) = member.as_ref() else {
                        continue;
                    };

                    match sync_msg.msg_type {
                        MessageType::SyncStep1 => {
                            let doc_id = joined.doc_id.as_str();
                            let diff = match joined.room.doc.diff_since(&sync_msg.payload) {
                                Ok(diff) => diff,
                                Err(e) => {
                                    log::warn!("Bad state vector from client {}: {e}", joined.client_id);
                                    continue;
                                }
                            };
                            let replies = [
                                SyncMessage::sync_step2(RELAY_CLIENT_ID, doc_id, diff),
                                SyncMessage::sync_step1(RELAY_CLIENT_ID, doc_id, joined.room.doc.state_vector()),
                                SyncMessage::awareness(RELAY_CLIENT_ID, doc_id, &joined.room.snapshot(joined.client_id))?,
                            ];
                            for reply in &replies {
                                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                            }
                        }

                        MessageType::SyncStep2 | MessageType::Update => {
                            if joined.read_only {
                                log::debug!("Dropped update from read-only client {}", joined.client_id);
                                stats.write().await.dropped_read_only_updates += 1;
                                continue;
                            }
                            if let Err(e) = joined.room.doc.apply_update(&sync_msg.payload) {
                                log::warn!("Rejected update from client {}: {e}", joined.client_id);
                                continue;
                            }
                            let relayed = SyncMessage::update(
                                joined.client_id,
                                joined.doc_id.as_str(),
                                sync_msg.clock,
                                sync_msg.payload,
                            );
                            joined.room.broadcast.broadcast(joined.client_id, &relayed)?;
                        }

                        MessageType::Awareness => {
                            let update = match sync_msg.awareness_update() {
                                Ok(update) => update,
                                Err(e) => {
                                    log::warn!("Bad awareness payload from client {}: {e}", joined.client_id);
                                    continue;
                                }
                            };
                            // A client may only speak for itself.
                            let entries: Vec<AwarenessEntry> = update
                                .entries
                                .into_iter()
                                .filter(|e| e.client_id == joined.client_id)
                                .filter(|e| joined.room.remember(joined.connection, e))
                                .collect();
                            if entries.is_empty() {
                                continue;
                            }
                            log::trace!("Presence update from client {} in {}", joined.client_id, joined.doc_id);
                            let relayed = SyncMessage::awareness(
                                joined.client_id,
                                joined.doc_id.as_str(),
                                &AwarenessUpdate { entries },
                            )?;
                            joined.room.broadcast.broadcast(joined.client_id, &relayed)?;
                        }

                        MessageType::Leave => {
                            log::info!("Client {} leaving {}", joined.client_id, joined.doc_id);
                            break;
                        }

                        MessageType::Ping => {
                            let pong = SyncMessage::pong(RELAY_CLIENT_ID);
                            ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                        }

                        other => {
                            log::debug!("Unhandled message type: {other:?}");
                        }
                    }
                }

                envelope = async {
                    match broadcast_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match envelope {
                        Ok(envelope) => {
                            if member.as_ref().is_some_and(|m| m.client_id == envelope.from) {
                                continue;
                            }
                            ws_sender.send(Message::Binary(envelope.bytes.to_vec().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Connection {addr} lagged by {n} messages");
                            if let Some(m) = member.as_ref() {
                                m.room.broadcast.record_dropped(n);
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        if let Some(m) = member {
            m.room.forget(m.client_id, m.connection);
            // Only the client's current connection announces its departure.
            if m.room.broadcast.remove_peer(m.client_id, m.connection).await.is_some() {
                let leave = SyncMessage::leave(m.client_id, m.doc_id.as_str());
                let _ = m.room.broadcast.broadcast(m.client_id, &leave);
                log::info!("Client {} left {}", m.client_id, m.doc_id);
            } else {
                log::debug!("Stale connection of client {} to {} closed", m.client_id, m.doc_id);
            }
        }
        stats.write().await.active_connections -= 1;

        Ok(())
    }

    fn admit(msg: &SyncMessage, config: &RelayConfig) -> Result<(DocumentId, JoinRequest), String> {
        if msg.client_id == RELAY_CLIENT_ID {
            return Err("reserved client id".to_string());
        }
        let doc_id = DocumentId::parse(&msg.doc_id).map_err(|e| e.to_string())?;
        let request = msg.join_request().map_err(|e| e.to_string())?;
        config.authorize(&doc_id, request.token.as_deref())?;
        Ok((doc_id, request))
    }
}
