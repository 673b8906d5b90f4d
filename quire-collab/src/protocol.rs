//! Binary protocol for CRDT document replication.
//!
//! Wire format (bincode-encoded, one WebSocket binary frame per message):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ client_id │ doc_id   │ clock    │ payload  │
//! │ 1 byte   │ varint    │ string   │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Handshake on every (re)connect:
//! ```text
//! client                               endpoint
//!   │── Join { token, read_only } ───────►│
//!   │── SyncStep1 (client state vector) ─►│
//!   │◄── SyncStep2 (diff client lacks) ───│
//!   │◄── SyncStep1 (endpoint state vec) ──│
//!   │── SyncStep2 (diff endpoint lacks) ─►│   ← replays offline edits
//!   │◄── Awareness (current roster) ──────│
//! ```

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Per-connection client identifier used for awareness and echo filtering.
pub type ClientId = u64;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector, asking the other side for what we lack
    SyncStep1 = 1,
    /// Yrs state diff answering a SyncStep1
    SyncStep2 = 2,
    /// Incremental CRDT update
    Update = 3,
    /// Awareness (presence) entries
    Awareness = 4,
    /// First message of a connection: access request
    Join = 5,
    /// A client left the document room
    Leave = 6,
    /// Share token refused; the endpoint closes the connection
    AuthRejected = 7,
    /// Heartbeat ping
    Ping = 8,
    /// Heartbeat pong
    Pong = 9,
}

/// Access request carried by a `Join` message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Share token for non-owner access.
    pub token: Option<String>,
    /// Updates from a read-only client are dropped by the endpoint.
    pub read_only: bool,
}

/// One client's awareness state as carried on the wire.
///
/// `state` holds the JSON text of the metadata object; `None` means the
/// client is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub client_id: ClientId,
    pub clock: u32,
    pub state: Option<String>,
}

/// Batch of awareness entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub client_id: ClientId,
    pub doc_id: String,
    /// Sender-local sequence number, informational only
    pub clock: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn raw(msg_type: MessageType, client_id: ClientId, doc_id: &str, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            client_id,
            doc_id: doc_id.to_string(),
            clock: 0,
            payload,
        }
    }

    /// Create an incremental update message.
    pub fn update(client_id: ClientId, doc_id: &str, clock: u64, yrs_update: Vec<u8>) -> Self {
        Self {
            clock,
            ..Self::raw(MessageType::Update, client_id, doc_id, yrs_update)
        }
    }

    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(client_id: ClientId, doc_id: &str, state_vector: Vec<u8>) -> Self {
        Self::raw(MessageType::SyncStep1, client_id, doc_id, state_vector)
    }

    /// Create a sync step 2 (state diff response).
    pub fn sync_step2(client_id: ClientId, doc_id: &str, state_diff: Vec<u8>) -> Self {
        Self::raw(MessageType::SyncStep2, client_id, doc_id, state_diff)
    }

    /// Create an awareness message.
    pub fn awareness(
        client_id: ClientId,
        doc_id: &str,
        update: &AwarenessUpdate,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::raw(MessageType::Awareness, client_id, doc_id, encode_payload(update)?))
    }

    /// Create a join request.
    pub fn join(client_id: ClientId, doc_id: &str, request: &JoinRequest) -> Result<Self, ProtocolError> {
        Ok(Self::raw(MessageType::Join, client_id, doc_id, encode_payload(request)?))
    }

    /// Create a leave notification for `client_id`.
    pub fn leave(client_id: ClientId, doc_id: &str) -> Self {
        Self::raw(MessageType::Leave, client_id, doc_id, Vec::new())
    }

    /// Create an auth rejection carrying a human-readable reason.
    pub fn auth_rejected(doc_id: &str, reason: &str) -> Self {
        Self::raw(MessageType::AuthRejected, 0, doc_id, reason.as_bytes().to_vec())
    }

    pub fn ping(client_id: ClientId) -> Self {
        Self::raw(MessageType::Ping, client_id, "", Vec::new())
    }

    pub fn pong(client_id: ClientId) -> Self {
        Self::raw(MessageType::Pong, client_id, "", Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_payload(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_payload(bytes)
    }

    /// Parse the awareness payload.
    pub fn awareness_update(&self) -> Result<AwarenessUpdate, ProtocolError> {
        self.expect_type(MessageType::Awareness)?;
        decode_payload(&self.payload)
    }

    /// Parse the join payload.
    pub fn join_request(&self) -> Result<JoinRequest, ProtocolError> {
        self.expect_type(MessageType::Join)?;
        decode_payload(&self.payload)
    }

    /// Reason text of an `AuthRejected` message.
    pub fn rejection_reason(&self) -> Result<String, ProtocolError> {
        self.expect_type(MessageType::AuthRejected)?;
        Ok(String::from_utf8_lossy(&self.payload).into_owned())
    }

    fn expect_type(&self, expected: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType {
                expected,
                actual: self.msg_type,
            });
        }
        Ok(())
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("expected {expected:?} message, got {actual:?}")]
    InvalidMessageType {
        expected: MessageType,
        actual: MessageType,
    },
    #[error("connection closed")]
    ConnectionClosed,
}
