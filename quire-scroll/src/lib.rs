//! # quire-scroll — Editor ↔ preview scroll reconciliation
//!
//! Keeps the markdown source editor and its rendered preview aligned while
//! either one scrolls, while content grows, and while the user types at the
//! bottom of the document.
//!
//! ```text
//!  EditorSurface ──scroll──┐                ┌──scroll── PreviewSurface
//!                          ▼                ▼
//!                   ┌──────────────────────────────┐
//!                   │ Reconciler                   │
//!                   │  SyncGuard   (one direction) │
//!                   │  BottomLock  (pin window)    │
//!                   │  AnchorMap   (line ↔ px)     │
//!                   │  FractionTracker ×2          │
//!                   └──────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`metrics`] — Scroll geometry and growth-aware fraction sampling
//! - [`anchors`] — Source-line anchors of the preview
//! - [`guard`] — Three-state reentrancy guard
//! - [`lock`] — Time-boxed bottom lock
//! - [`reconciler`] — The state machine
//! - [`link`] — Binding to live surfaces through weak references

pub mod metrics;
pub mod anchors;
pub mod guard;
pub mod lock;
pub mod reconciler;
pub mod link;

pub use anchors::{parse_source_line, Anchor, AnchorMap};
pub use guard::{GuardState, SyncGuard, SyncSource};
pub use link::{EditorSurface, PreviewSurface, ScrollLink};
pub use lock::BottomLock;
pub use metrics::{FractionTracker, ScrollMetrics};
pub use reconciler::{EditorTarget, PreviewTarget, Reconciler, ReconcilerConfig, ReconcilerState};
