//! WebSocket transport for a [`Session`](crate::session::Session).
//!
//! One task per session: connect, run the handshake, pump frames, and on
//! a drop wait out an exponential backoff before trying again. Local edits
//! made while disconnected stay in the replica and reach the endpoint in
//! the next handshake's SyncStep2.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::document::DocumentId;
use crate::protocol::{JoinRequest, MessageType, SyncMessage};
use crate::session::{SessionConfig, SessionError, SessionShared, SessionStatus};

/// Build `<endpoint>/<doc id>[?token=...]`.
pub fn endpoint_url(endpoint: &str, doc_id: &DocumentId, token: Option<&str>) -> Result<Url, SessionError> {
    let mut url = Url::parse(endpoint).map_err(|e| SessionError::InvalidEndpoint(e.to_string()))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(SessionError::InvalidEndpoint(format!(
            "unsupported scheme {:?}",
            url.scheme()
        )));
    }
    url.path_segments_mut()
        .map_err(|_| SessionError::InvalidEndpoint(endpoint.to_string()))?
        .pop_if_empty()
        .push(doc_id.as_str());
    url.set_query(None);
    if let Some(token) = token {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}

/// Extract the `token` query parameter from a shared-document URL.
///
/// Accepts absolute URLs and bare routes such as `/doc/abc?token=xyz`.
pub fn share_token_from_url(route: &str) -> Option<String> {
    let base = Url::parse("http://localhost/").ok()?;
    let url = base.join(route).ok()?;
    url.query_pairs()
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
        .filter(|token| !token.is_empty())
}

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self { initial, max, current: initial }
    }

    /// Delay before the next attempt; doubles up to the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// How one connection ended.
enum Outcome {
    /// Transport dropped; reconnect.
    Dropped,
    /// Session closed locally.
    Closed,
    /// Unrecoverable; stop for good.
    Fatal(SessionError),
}

/// Connection loop. Runs until the session closes or fails fatally.
pub(crate) async fn run(shared: Arc<SessionShared>, url: Url, config: SessionConfig) {
    let mut backoff = Backoff::new(config.initial_backoff, config.max_backoff);

    loop {
        if shared.is_closed() {
            return;
        }
        shared.set_status(SessionStatus::Connecting);

        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                log::info!("Session {} connected to {}", shared.client_id, shared.doc_id);
                backoff.reset();
                match drive(&shared, ws).await {
                    Outcome::Closed => return,
                    Outcome::Fatal(error) => {
                        shared.awareness.clear_remote();
                        shared.fail(error);
                        return;
                    }
                    Outcome::Dropped => {
                        log::warn!("Session {} lost connection to {}", shared.client_id, shared.doc_id);
                    }
                }
            }
            Err(e) => {
                log::debug!("Session {} connect failed: {e}", shared.client_id);
                shared.report(SessionError::Transport(e.to_string()));
            }
        }

        if shared.is_closed() {
            return;
        }
        shared.set_status(SessionStatus::Connecting);
        shared.awareness.clear_remote();
        tokio::time::sleep(backoff.next_delay()).await;
    }
}

async fn drive<S>(shared: &Arc<SessionShared>, ws: tokio_tungstenite::WebSocketStream<S>) -> Outcome
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_writer, mut ws_reader) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer = tokio::spawn(async move {
        while let Some(data) = out_rx.recv().await {
            if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_writer.close().await;
    });

    shared.attach(out_tx);
    if let Err(error) = handshake(shared) {
        shared.detach();
        writer.abort();
        return Outcome::Fatal(error);
    }

    let outcome = loop {
        let frame = match ws_reader.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                shared.report(SessionError::Transport(e.to_string()));
                break Outcome::Dropped;
            }
            None => break Outcome::Dropped,
        };
        if shared.is_closed() {
            break Outcome::Closed;
        }

        let data: Vec<u8> = match frame {
            Message::Binary(data) => data.into(),
            Message::Close(_) => break Outcome::Dropped,
            _ => continue,
        };
        let msg = match SyncMessage::decode(&data) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Session {} ignored malformed frame: {e}", shared.client_id);
                continue;
            }
        };
        if let Some(outcome) = handle_message(shared, msg) {
            break outcome;
        }
    };

    // Let the writer drain and close the socket once every sender is gone.
    shared.detach();
    drop(writer);
    outcome
}

fn handshake(shared: &SessionShared) -> Result<(), SessionError> {
    let request = JoinRequest {
        token: shared.token.clone(),
        read_only: shared.read_only,
    };
    let doc_id = shared.doc_id.as_str();
    shared.send(&SyncMessage::join(shared.client_id, doc_id, &request)?);
    shared.send(&SyncMessage::sync_step1(shared.client_id, doc_id, shared.doc.state_vector()));
    if let Some(update) = shared.awareness.encode_local() {
        shared.send_awareness(&update);
    }
    Ok(())
}

/// Apply one inbound message. `Some` ends the connection.
fn handle_message(shared: &SessionShared, msg: SyncMessage) -> Option<Outcome> {
    if msg.client_id == shared.client_id {
        return None;
    }
    if !msg.doc_id.is_empty() && msg.doc_id != shared.doc_id.as_str() {
        log::warn!("Session {} ignored message for {}", shared.client_id, msg.doc_id);
        return None;
    }

    match msg.msg_type {
        MessageType::SyncStep2 => {
            if let Err(e) = shared.doc.apply_update(&msg.payload) {
                return Some(Outcome::Fatal(SessionError::Replication(e.to_string())));
            }
            if shared.status() != SessionStatus::Connected {
                shared.set_status(SessionStatus::Connected);
            }
        }
        MessageType::SyncStep1 => {
            if shared.read_only {
                return None;
            }
            match shared.doc.diff_since(&msg.payload) {
                Ok(diff) => shared.send(&SyncMessage::sync_step2(shared.client_id, shared.doc_id.as_str(), diff)),
                Err(e) => log::warn!("Session {} could not answer SyncStep1: {e}", shared.client_id),
            }
        }
        MessageType::Update => {
            if let Err(e) = shared.doc.apply_update(&msg.payload) {
                return Some(Outcome::Fatal(SessionError::Replication(e.to_string())));
            }
        }
        MessageType::Awareness => match msg.awareness_update() {
            Ok(update) => {
                shared.awareness.apply_update(&update);
            }
            Err(e) => log::warn!("Session {} ignored awareness payload: {e}", shared.client_id),
        },
        MessageType::Leave => {
            shared.awareness.remove_client(msg.client_id);
        }
        MessageType::AuthRejected => {
            let reason = msg
                .rejection_reason()
                .unwrap_or_else(|_| "access denied".to_string());
            return Some(Outcome::Fatal(SessionError::AuthRejected(reason)));
        }
        MessageType::Ping => shared.send(&SyncMessage::pong(shared.client_id)),
        MessageType::Pong | MessageType::Join => {}
    }
    None
}
