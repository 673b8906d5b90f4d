//! # quire-collab — Real-time document sync for Quire
//!
//! Replicates markdown documents between editors over WebSocket using the
//! yrs CRDT, and tracks who else is editing through an awareness channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ Session     │ ◄─────────────────► │ RelayServer │
//! │ (per doc)   │    Binary Proto     │ (endpoint)  │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ SharedDoc   │                     │ SharedDoc   │
//! │ (registry)  │                     │ (authority) │
//! └─────────────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                           ┌───────┴───────┐
//! ┌─────────────┐                    │ BroadcastGroup│
//! │ Awareness → │                    │ (fan-out)     │
//! │ Presence    │                    └───────────────┘
//! └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded SyncMessage)
//! - [`document`] — yrs-backed replicas and the refcounted registry
//! - [`awareness`] — Ephemeral per-client state with clock-based merging
//! - [`presence`] — Collaborator roster derived from awareness
//! - [`session`] — Document replication session (open, edit, close)
//! - [`transport`] — Session connection loop with reconnect backoff
//! - [`broadcast`] — Room fan-out
//! - [`server`] — WebSocket relay endpoint

pub mod protocol;
pub mod document;
pub mod awareness;
pub mod presence;
pub mod session;
pub mod transport;
pub mod broadcast;
pub mod server;

// Re-exports for convenience
pub use protocol::{
    AwarenessEntry, AwarenessUpdate, ClientId, JoinRequest, MessageType, ProtocolError, SyncMessage,
};
pub use document::{
    ChangeOrigin, DocChange, DocRegistry, DocumentError, DocumentId, ObserverId, SharedDoc,
};
pub use awareness::{Awareness, AwarenessChange, AwarenessStates};
pub use presence::{Collaborator, PresenceTracker, SelectionRange};
pub use session::{Session, SessionConfig, SessionError, SessionOptions, SessionStatus};
pub use transport::{share_token_from_url, Backoff};
pub use broadcast::{BroadcastGroup, BroadcastStats, PeerInfo};
pub use server::{RelayConfig, RelayError, RelayServer, RelayStats};
