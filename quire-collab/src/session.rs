//! Document replication session: one live binding between a document id,
//! its CRDT replica and a connection to the sync endpoint.
//!
//! Provides:
//! - Connection lifecycle (open, automatic reconnect, idempotent close)
//! - Local edits that replicate immediately when connected and merge on
//!   the next handshake when not
//! - The awareness channel and presence helpers for this connection
//! - Status (`tokio::sync::watch`) and an error side channel
//!
//! ```text
//!  Session ──► SharedDoc (DocRegistry, refcounted)
//!     │
//!     ├──► Awareness ──► PresenceTracker
//!     │
//!     └──► transport task ◄──► WebSocket ◄──► endpoint
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::awareness::Awareness;
use crate::document::{ChangeCallback, DocChange, DocRegistry, DocumentError, DocumentId, ObserverId, SharedDoc};
use crate::presence::{self, Collaborator, PresenceTracker, SelectionRange};
use crate::protocol::{AwarenessUpdate, ClientId, ProtocolError, SyncMessage};
use crate::transport;

/// Session connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("invalid document id {0:?}")]
    InvalidDocumentId(String),
    #[error("invalid endpoint url: {0}")]
    InvalidEndpoint(String),
    #[error("document is open read-only")]
    ReadOnly,
    #[error("session is closed")]
    Closed,
    #[error("share token rejected: {0}")]
    AuthRejected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("replication error: {0}")]
    Replication(String),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl SessionError {
    /// Whether the session has stopped for good.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthRejected(_) | Self::Replication(_) | Self::Closed)
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base WebSocket URL of the sync endpoint
    pub endpoint: String,
    /// Error side-channel capacity; errors beyond it are dropped
    pub event_capacity: usize,
    /// First reconnect delay
    pub initial_backoff: Duration,
    /// Reconnect delay ceiling
    pub max_backoff: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:9090".to_string(),
            event_capacity: 256,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }
}

/// Per-open options.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Share token for non-owner access, validated by the endpoint.
    pub token: Option<String>,
    pub read_only: bool,
}

/// State shared between the handle and its transport task.
pub(crate) struct SessionShared {
    pub(crate) client_id: ClientId,
    pub(crate) doc_id: DocumentId,
    pub(crate) doc: Arc<SharedDoc>,
    pub(crate) awareness: Arc<Awareness>,
    pub(crate) read_only: bool,
    pub(crate) token: Option<String>,
    closed: AtomicBool,
    status_tx: watch::Sender<SessionStatus>,
    error_tx: mpsc::Sender<SessionError>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    clock: AtomicU64,
    fatal: Mutex<Option<SessionError>>,
}

impl SessionShared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_status(&self, status: SessionStatus) {
        if self.is_closed() && status != SessionStatus::Disconnected {
            return;
        }
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            log::debug!("Session {} for {}: {:?} -> {:?}", self.client_id, self.doc_id, previous, status);
        }
    }

    pub(crate) fn status(&self) -> SessionStatus {
        *self.status_tx.borrow()
    }

    /// Push an error to the side channel. Dropped if nobody drains it.
    pub(crate) fn report(&self, error: SessionError) {
        if self.error_tx.try_send(error).is_err() {
            log::debug!("Session {} error channel full or closed", self.client_id);
        }
    }

    /// Record a fatal error: the session stops and `wait_connected` fails.
    pub(crate) fn fail(&self, error: SessionError) {
        log::error!("Session {} for {} stopped: {error}", self.client_id, self.doc_id);
        *lock(&self.fatal) = Some(error.clone());
        self.report(error);
        self.set_status(SessionStatus::Disconnected);
    }

    pub(crate) fn fatal(&self) -> Option<SessionError> {
        lock(&self.fatal).clone()
    }

    pub(crate) fn attach(&self, tx: mpsc::UnboundedSender<Vec<u8>>) {
        *lock(&self.outgoing) = Some(tx);
    }

    pub(crate) fn detach(&self) -> Option<mpsc::UnboundedSender<Vec<u8>>> {
        lock(&self.outgoing).take()
    }

    /// Send on the live connection; a no-op while disconnected.
    pub(crate) fn send(&self, msg: &SyncMessage) {
        let outgoing = lock(&self.outgoing);
        let Some(tx) = outgoing.as_ref() else {
            return;
        };
        match msg.encode() {
            Ok(bytes) => {
                let _ = tx.send(bytes);
            }
            Err(e) => log::error!("Failed to encode {:?} message: {e}", msg.msg_type),
        }
    }

    pub(crate) fn send_update(&self, update: Vec<u8>) {
        let clock = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        self.send(&SyncMessage::update(self.client_id, self.doc_id.as_str(), clock, update));
    }

    pub(crate) fn send_awareness(&self, update: &AwarenessUpdate) {
        match SyncMessage::awareness(self.client_id, self.doc_id.as_str(), update) {
            Ok(msg) => self.send(&msg),
            Err(e) => log::error!("Failed to encode awareness update: {e}"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to one open document.
///
/// Dropping the handle closes it.
pub struct Session {
    shared: Arc<SessionShared>,
    registry: DocRegistry,
    task: Mutex<Option<JoinHandle<()>>>,
    error_rx: Option<mpsc::Receiver<SessionError>>,
}

impl Session {
    /// Open `document_id` and start connecting in the background.
    ///
    /// Must be called inside a tokio runtime. Returns as soon as the
    /// connection task is running; use [`Session::wait_connected`] to
    /// suspend until the replica has synced with the endpoint.
    pub fn open(
        registry: &DocRegistry,
        config: &SessionConfig,
        document_id: &str,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        let doc_id = DocumentId::parse(document_id)
            .map_err(|_| SessionError::InvalidDocumentId(document_id.to_string()))?;
        let url = transport::endpoint_url(&config.endpoint, &doc_id, options.token.as_deref())?;

        let client_id = new_client_id();
        let doc = registry.acquire(&doc_id);
        let (status_tx, _) = watch::channel(SessionStatus::Disconnected);
        let (error_tx, error_rx) = mpsc::channel(config.event_capacity.max(1));

        let shared = Arc::new(SessionShared {
            client_id,
            doc_id,
            doc,
            awareness: Arc::new(Awareness::new(client_id)),
            read_only: options.read_only,
            token: options.token,
            closed: AtomicBool::new(false),
            status_tx,
            error_tx,
            outgoing: Mutex::new(None),
            clock: AtomicU64::new(0),
            fatal: Mutex::new(None),
        });

        shared.set_status(SessionStatus::Connecting);
        let task = tokio::spawn(transport::run(shared.clone(), url, config.clone()));
        log::info!(
            "Opened session {} for document {}{}",
            client_id,
            shared.doc_id,
            if shared.read_only { " (read-only)" } else { "" }
        );

        Ok(Self {
            shared,
            registry: registry.clone(),
            task: Mutex::new(Some(task)),
            error_rx: Some(error_rx),
        })
    }

    /// Suspend until the session is connected and synced.
    ///
    /// Fails with the fatal error if the endpoint rejected the session, or
    /// with [`SessionError::Closed`] after `close`. Wrap in
    /// `tokio::time::timeout` to give up early.
    pub async fn wait_connected(&self) -> Result<(), SessionError> {
        let mut rx = self.shared.status_tx.subscribe();
        loop {
            if let Some(error) = self.shared.fatal() {
                return Err(error);
            }
            if self.shared.is_closed() {
                return Err(SessionError::Closed);
            }
            if *rx.borrow_and_update() == SessionStatus::Connected {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Err(SessionError::Closed);
            }
        }
    }

    /// Close the session. Safe to call more than once.
    ///
    /// Observers are unregistered before the transport stops, so no
    /// callback registered through this handle fires afterwards.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let removed = self.shared.doc.unobserve_owner(self.shared.client_id);
        let departure = self.shared.awareness.clear_local_state();
        self.shared.awareness.destroy();

        if let Some(tx) = self.shared.detach() {
            let client_id = self.shared.client_id;
            let doc_id = self.shared.doc_id.as_str();
            let mut farewell = Vec::with_capacity(2);
            if let Some(update) = departure {
                match SyncMessage::awareness(client_id, doc_id, &update) {
                    Ok(msg) => farewell.push(msg),
                    Err(e) => log::debug!("Failed to encode awareness departure: {e}"),
                }
            }
            farewell.push(SyncMessage::leave(client_id, doc_id));
            for msg in &farewell {
                if let Ok(bytes) = msg.encode() {
                    let _ = tx.send(bytes);
                }
            }
        }
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        self.shared.set_status(SessionStatus::Disconnected);

        let freed = self.registry.release(&self.shared.doc_id);
        log::info!(
            "Closed session {} for document {} ({} observers removed{})",
            self.shared.client_id,
            self.shared.doc_id,
            removed,
            if freed { ", replica released" } else { "" }
        );
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    /// Watch status transitions.
    pub fn status_changes(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Take the error receiver (can only be called once).
    pub fn take_error_rx(&mut self) -> Option<mpsc::Receiver<SessionError>> {
        self.error_rx.take()
    }

    pub fn client_id(&self) -> ClientId {
        self.shared.client_id
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.shared.doc_id
    }

    pub fn is_read_only(&self) -> bool {
        self.shared.read_only
    }

    pub fn doc(&self) -> &Arc<SharedDoc> {
        &self.shared.doc
    }

    pub fn awareness(&self) -> &Arc<Awareness> {
        &self.shared.awareness
    }

    pub fn text(&self) -> String {
        self.shared.doc.text()
    }

    fn check_writable(&self) -> Result<(), SessionError> {
        if self.shared.is_closed() {
            return Err(SessionError::Closed);
        }
        if self.shared.read_only {
            return Err(SessionError::ReadOnly);
        }
        Ok(())
    }

    pub fn insert(&self, index: u32, chunk: &str) -> Result<(), SessionError> {
        self.check_writable()?;
        let update = self.shared.doc.insert(index, chunk)?;
        self.shared.send_update(update);
        Ok(())
    }

    pub fn delete(&self, index: u32, len: u32) -> Result<(), SessionError> {
        self.check_writable()?;
        let update = self.shared.doc.delete(index, len)?;
        self.shared.send_update(update);
        Ok(())
    }

    /// Replace the whole text with a minimal edit.
    pub fn replace_all(&self, content: &str) -> Result<(), SessionError> {
        self.check_writable()?;
        if let Some(update) = self.shared.doc.replace_all(content) {
            self.shared.send_update(update);
        }
        Ok(())
    }

    /// Observe document changes until `unobserve` or `close`.
    pub fn on_change<F>(&self, callback: F) -> Result<ObserverId, SessionError>
    where
        F: Fn(&DocChange) + Send + Sync + 'static,
    {
        if self.shared.is_closed() {
            return Err(SessionError::Closed);
        }
        let shared = Arc::downgrade(&self.shared);
        let guarded: ChangeCallback = Arc::new(move |change| {
            if shared.upgrade().is_some_and(|s| !s.is_closed()) {
                callback(change);
            }
        });
        Ok(self.shared.doc.observe(self.shared.client_id, guarded))
    }

    pub fn unobserve(&self, id: ObserverId) -> bool {
        self.shared.doc.unobserve(id)
    }

    /// Track remote collaborators on this session's awareness channel.
    ///
    /// The callback stops firing once the session is closed.
    pub fn presence<F>(&self, on_update: F) -> PresenceTracker
    where
        F: Fn(&[Collaborator]) + Send + Sync + 'static,
    {
        let shared = Arc::downgrade(&self.shared);
        PresenceTracker::subscribe(&self.shared.awareness, move |roster: &[Collaborator]| {
            if shared.upgrade().is_some_and(|s| !s.is_closed()) {
                on_update(roster);
            }
        })
    }

    /// Publish the local user's profile.
    pub fn set_local_user(&self, name: &str, color: &str) {
        if let Some(update) = self
            .shared
            .awareness
            .merge_local_field("user", presence::user_value(name, color))
        {
            self.shared.send_awareness(&update);
        }
    }

    /// Publish the local caret/selection, or clear it with `None`.
    pub fn set_local_cursor(&self, selection: Option<SelectionRange>) {
        if let Some(update) = self
            .shared
            .awareness
            .merge_local_field("cursor", presence::cursor_value(selection))
        {
            self.shared.send_awareness(&update);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Random per-connection client id, kept within JavaScript's safe integer
/// range so web peers can round-trip it.
fn new_client_id() -> ClientId {
    let (high, _) = Uuid::new_v4().as_u64_pair();
    (high >> 11).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn offline_config() -> SessionConfig {
        // Nothing listens on port 1; the transport keeps retrying.
        SessionConfig {
            endpoint: "ws://127.0.0.1:1".to_string(),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_config_default() {
        let config = SessionConfig::default();
        assert_eq!(config.endpoint, "ws://127.0.0.1:9090");
        assert_eq!(config.initial_backoff, Duration::from_millis(100));
        assert_eq!(config.max_backoff, Duration::from_secs(5));
    }

    #[test]
    fn test_client_ids_are_js_safe() {
        for _ in 0..100 {
            let id = new_client_id();
            assert!(id >= 1 && id < (1u64 << 53));
        }
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_document_id() {
        let registry = DocRegistry::new();
        let result = Session::open(&registry, &offline_config(), "bad id", SessionOptions::default());
        assert!(matches!(result, Err(SessionError::InvalidDocumentId(_))));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_offline_edits_stay_in_replica() {
        let registry = DocRegistry::new();
        let session = Session::open(&registry, &offline_config(), "offline", SessionOptions::default()).unwrap();
        assert_eq!(session.status(), SessionStatus::Connecting);

        session.insert(0, "written offline").unwrap();
        session.delete(0, 8).unwrap();
        assert_eq!(session.text(), "offline");
    }

    #[tokio::test]
    async fn test_read_only_rejects_edits() {
        let registry = DocRegistry::new();
        let options = SessionOptions { token: None, read_only: true };
        let session = Session::open(&registry, &offline_config(), "ro", options).unwrap();
        assert!(matches!(session.insert(0, "x"), Err(SessionError::ReadOnly)));
        assert!(matches!(session.replace_all("x"), Err(SessionError::ReadOnly)));
        assert_eq!(session.text(), "");
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_releases() {
        let registry = DocRegistry::new();
        let session = Session::open(&registry, &offline_config(), "closing", SessionOptions::default()).unwrap();
        session.on_change(|_| {}).unwrap();

        session.close();
        session.close();
        assert!(session.is_closed());
        assert_eq!(session.status(), SessionStatus::Disconnected);
        assert!(registry.is_empty());
        assert!(session.awareness().is_destroyed());
        assert!(matches!(session.insert(0, "x"), Err(SessionError::Closed)));
        assert!(matches!(session.wait_connected().await, Err(SessionError::Closed)));
    }

    #[tokio::test]
    async fn test_shared_replica_between_sessions() {
        let registry = DocRegistry::new();
        let config = offline_config();
        let editor = Session::open(&registry, &config, "shared", SessionOptions::default()).unwrap();
        let viewer = Session::open(
            &registry,
            &config,
            "shared",
            SessionOptions { token: None, read_only: true },
        )
        .unwrap();
        assert_ne!(editor.client_id(), viewer.client_id());

        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        viewer
            .on_change(move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        editor.insert(0, "# Shared").unwrap();
        assert_eq!(viewer.text(), "# Shared");
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        editor.close();
        assert_eq!(registry.ref_count(viewer.document_id()), 1);
        viewer.close();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_no_change_callbacks_after_close() {
        let registry = DocRegistry::new();
        let config = offline_config();
        let closing = Session::open(&registry, &config, "late", SessionOptions::default()).unwrap();
        let other = Session::open(&registry, &config, "late", SessionOptions::default()).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        closing
            .on_change(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        closing.close();
        other.insert(0, "after close").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_presence_callbacks_after_close() {
        let registry = DocRegistry::new();
        let session = Session::open(&registry, &offline_config(), "quiet", SessionOptions::default()).unwrap();
        session.set_local_user("Ada", "#30bced");

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let tracker = session.presence(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        session.close();
        let remote = AwarenessUpdate {
            entries: vec![crate::protocol::AwarenessEntry {
                client_id: 42,
                clock: 1,
                state: Some(r#"{"user":{"name":"Grace"}}"#.to_string()),
            }],
        };
        session.awareness().apply_update(&remote);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(tracker.roster().is_empty());
    }

    #[tokio::test]
    async fn test_local_presence_fields() {
        let registry = DocRegistry::new();
        let session = Session::open(&registry, &offline_config(), "presence", SessionOptions::default()).unwrap();
        session.set_local_user("Ada", "#30bced");
        session.set_local_cursor(Some(SelectionRange { anchor: 2, head: 5 }));

        let state = session.awareness().local_state().unwrap();
        assert_eq!(state["user"]["name"], "Ada");
        assert_eq!(state["cursor"]["anchor"], 2);

        session.set_local_cursor(None);
        assert!(session.awareness().local_state().unwrap()["cursor"].is_null());
    }
}
