//! Replicated text documents and the registry that shares them.
//!
//! A [`SharedDoc`] wraps one yrs `Doc` holding a single `Y.Text` named
//! [`TEXT_NAME`]. Sessions never own a document directly: they borrow it
//! from a [`DocRegistry`], which reference-counts documents by
//! [`DocumentId`] so that a primary editor and a read-only viewer in the
//! same process replicate into one CRDT instance.
//!
//! ```text
//! Session A ──┐                      ┌──────────────┐
//!             ├── DocRegistry ──────►│ SharedDoc    │── observers
//! Session B ──┘   (refcount per id)  │ (yrs Doc)    │
//!                                    └──────────────┘
//! ```
//!
//! Offsets are yrs' default unit (UTF-8 bytes) and must fall on character
//! boundaries.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, TextRef, Transact, Update};

/// Name of the shared `Y.Text` holding the markdown source.
pub const TEXT_NAME: &str = "content";

const MAX_ID_LEN: usize = 256;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DocumentError {
    #[error("invalid document id {0:?}")]
    InvalidId(String),
    #[error("failed to decode update: {0}")]
    Decode(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
    #[error("range {index}..{end} outside document of length {len}")]
    OutOfBounds { index: u32, end: u32, len: u32 },
}

/// Validated document identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(String);

impl DocumentId {
    /// Validate a raw identifier.
    ///
    /// Accepts ASCII alphanumerics and `-_.:/`, up to 256 bytes, without a
    /// leading or trailing `/`.
    pub fn parse(raw: &str) -> Result<Self, DocumentError> {
        let valid_chars = raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':' | b'/'));
        if raw.is_empty()
            || raw.len() > MAX_ID_LEN
            || !valid_chars
            || raw.starts_with('/')
            || raw.ends_with('/')
        {
            return Err(DocumentError::InvalidId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DocumentId {
    type Err = DocumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a document change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// Notification delivered to document observers after the text changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocChange {
    pub origin: ChangeOrigin,
    /// Text length after the change.
    pub text_len: u32,
}

pub type ChangeCallback = Arc<dyn Fn(&DocChange) + Send + Sync>;

/// Handle returned by [`SharedDoc::observe`].
pub type ObserverId = u64;

struct Observer {
    id: ObserverId,
    /// Key of the session that registered it, so `close` can drop its own.
    owner: u64,
    callback: ChangeCallback,
}

struct Replica {
    doc: Doc,
    text: TextRef,
}

/// One CRDT text document, shareable between sessions.
pub struct SharedDoc {
    id: DocumentId,
    replica: Mutex<Replica>,
    observers: Mutex<Vec<Observer>>,
    next_observer: AtomicU64,
}

impl SharedDoc {
    pub fn new(id: DocumentId) -> Self {
        let doc = Doc::new();
        let text = doc.get_or_insert_text(TEXT_NAME);
        Self {
            id,
            replica: Mutex::new(Replica { doc, text }),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    fn replica(&self) -> MutexGuard<'_, Replica> {
        self.replica.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current text content.
    pub fn text(&self) -> String {
        let replica = self.replica();
        let txn = replica.doc.transact();
        replica.text.get_string(&txn)
    }

    /// Current text length in yrs offsets.
    pub fn len(&self) -> u32 {
        let replica = self.replica();
        let txn = replica.doc.transact();
        replica.text.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert `chunk` at `index` and return the encoded update.
    pub fn insert(&self, index: u32, chunk: &str) -> Result<Vec<u8>, DocumentError> {
        let update = {
            let replica = self.replica();
            let len = replica.text.len(&replica.doc.transact());
            if index > len {
                return Err(DocumentError::OutOfBounds { index, end: index, len });
            }
            Self::mutate(&replica, |txn, text| text.insert(txn, index, chunk))
        };
        self.notify_local();
        Ok(update)
    }

    /// Delete `len` units starting at `index` and return the encoded update.
    pub fn delete(&self, index: u32, len: u32) -> Result<Vec<u8>, DocumentError> {
        let update = {
            let replica = self.replica();
            let text_len = replica.text.len(&replica.doc.transact());
            let end = index.saturating_add(len);
            if end > text_len {
                return Err(DocumentError::OutOfBounds { index, end, len: text_len });
            }
            Self::mutate(&replica, |txn, text| text.remove_range(txn, index, len))
        };
        self.notify_local();
        Ok(update)
    }

    /// Replace the whole text using a minimal prefix/suffix edit.
    ///
    /// Returns `None` when the content is unchanged.
    pub fn replace_all(&self, content: &str) -> Option<Vec<u8>> {
        let update = {
            let replica = self.replica();
            let current = replica.text.get_string(&replica.doc.transact());
            if current == content {
                return None;
            }
            let (start, old_end, new_end) = minimal_edit(&current, content);
            Self::mutate(&replica, |txn, text| {
                if old_end > start {
                    text.remove_range(txn, start as u32, (old_end - start) as u32);
                }
                if new_end > start {
                    text.insert(txn, start as u32, &content[start..new_end]);
                }
            })
        };
        self.notify_local();
        Some(update)
    }

    fn mutate<F>(replica: &Replica, edit: F) -> Vec<u8>
    where
        F: FnOnce(&mut yrs::TransactionMut<'_>, &TextRef),
    {
        let before = replica.doc.transact().state_vector();
        {
            let mut txn = replica.doc.transact_mut();
            edit(&mut txn, &replica.text);
        }
        replica.doc.transact().encode_state_as_update_v1(&before)
    }

    /// Encoded state vector of this replica.
    pub fn state_vector(&self) -> Vec<u8> {
        let replica = self.replica();
        let txn = replica.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this replica has that a peer with `remote_sv` lacks.
    pub fn diff_since(&self, remote_sv: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let sv = StateVector::decode_v1(remote_sv)
            .map_err(|e| DocumentError::Decode(e.to_string()))?;
        let replica = self.replica();
        let txn = replica.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Merge a remote update. Observers fire only if the text changed.
    ///
    /// Applying the same update twice, or updates out of order, is safe.
    pub fn apply_update(&self, bytes: &[u8]) -> Result<bool, DocumentError> {
        let update = Update::decode_v1(bytes).map_err(|e| DocumentError::Decode(e.to_string()))?;
        let changed = {
            let replica = self.replica();
            let before = replica.text.get_string(&replica.doc.transact());
            {
                let mut txn = replica.doc.transact_mut();
                txn.apply_update(update)
                    .map_err(|e| DocumentError::Apply(e.to_string()))?;
            }
            let after = replica.text.get_string(&replica.doc.transact());
            before != after
        };
        if changed {
            self.notify(ChangeOrigin::Remote);
        }
        Ok(changed)
    }

    /// Register a change observer on behalf of `owner`.
    pub fn observe(&self, owner: u64, callback: ChangeCallback) -> ObserverId {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        self.observers_mut().push(Observer { id, owner, callback });
        id
    }

    /// Remove one observer. Returns `false` if it was already gone.
    pub fn unobserve(&self, id: ObserverId) -> bool {
        let mut observers = self.observers_mut();
        let before = observers.len();
        observers.retain(|o| o.id != id);
        observers.len() != before
    }

    /// Remove every observer registered by `owner`.
    pub fn unobserve_owner(&self, owner: u64) -> usize {
        let mut observers = self.observers_mut();
        let before = observers.len();
        observers.retain(|o| o.owner != owner);
        before - observers.len()
    }

    pub fn observer_count(&self) -> usize {
        self.observers_mut().len()
    }

    fn observers_mut(&self) -> MutexGuard<'_, Vec<Observer>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_local(&self) {
        self.notify(ChangeOrigin::Local);
    }

    fn notify(&self, origin: ChangeOrigin) {
        let change = DocChange { origin, text_len: self.len() };
        // Callbacks run unlocked so they may read the document.
        let callbacks: Vec<ChangeCallback> =
            self.observers_mut().iter().map(|o| o.callback.clone()).collect();
        for callback in callbacks {
            callback(&change);
        }
    }
}

/// Byte ranges `(start, old_end, new_end)` of the minimal single edit turning
/// `old` into `new`, on character boundaries.
fn minimal_edit(old: &str, new: &str) -> (usize, usize, usize) {
    let prefix: usize = old
        .chars()
        .zip(new.chars())
        .take_while(|(a, b)| a == b)
        .map(|(a, _)| a.len_utf8())
        .sum();
    let max_suffix = (old.len() - prefix).min(new.len() - prefix);
    let suffix: usize = old[prefix..]
        .chars()
        .rev()
        .zip(new[prefix..].chars().rev())
        .take_while(|(a, b)| a == b)
        .map(|(a, _)| a.len_utf8())
        .scan(0usize, |acc, n| {
            *acc += n;
            (*acc <= max_suffix).then_some(n)
        })
        .sum();
    (prefix, old.len() - suffix, new.len() - suffix)
}

struct RegistryEntry {
    doc: Arc<SharedDoc>,
    refs: usize,
}

/// Reference-counted documents keyed by id.
///
/// Cloning the registry shares the same map.
#[derive(Clone, Default)]
pub struct DocRegistry {
    entries: Arc<Mutex<HashMap<DocumentId, RegistryEntry>>>,
}

impl DocRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<DocumentId, RegistryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Borrow the document for `id`, creating it on first use.
    pub fn acquire(&self, id: &DocumentId) -> Arc<SharedDoc> {
        let mut entries = self.entries();
        let entry = entries.entry(id.clone()).or_insert_with(|| {
            log::debug!("Creating replica for document {id}");
            RegistryEntry {
                doc: Arc::new(SharedDoc::new(id.clone())),
                refs: 0,
            }
        });
        entry.refs += 1;
        entry.doc.clone()
    }

    /// Return a reference. Returns `true` when it was the last one and the
    /// document has been dropped from the registry.
    pub fn release(&self, id: &DocumentId) -> bool {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(id) else {
            return false;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            entries.remove(id);
            log::debug!("Released last reference to document {id}");
            return true;
        }
        false
    }

    pub fn ref_count(&self, id: &DocumentId) -> usize {
        self.entries().get(id).map_or(0, |e| e.refs)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
