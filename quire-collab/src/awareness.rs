//! Awareness channel: ephemeral per-client metadata broadcast next to
//! document updates.
//!
//! Every client owns one JSON state (user profile, cursor) versioned by a
//! clock that only its owner increments. Remote entries are merged
//! last-writer-wins on that clock, so duplicated or reordered broadcasts
//! settle to the same roster.
//!
//! ```text
//! set_local_state() ──► AwarenessUpdate ──► transport ──► apply_update()
//!                                                            │
//!                                            on_update observers (roster)
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::protocol::{AwarenessEntry, AwarenessUpdate, ClientId};

/// Snapshot of all known states, local client included.
pub type AwarenessStates = HashMap<ClientId, Value>;

/// Client ids touched by one awareness update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

pub type AwarenessCallback = Arc<dyn Fn(&AwarenessChange, &AwarenessStates) + Send + Sync>;

#[derive(Debug, Clone)]
struct ClientState {
    clock: u32,
    state: Value,
}

#[derive(Default)]
struct Inner {
    states: HashMap<ClientId, ClientState>,
    /// Last clock seen for removed clients, so stale entries can't resurrect them.
    removed_clocks: HashMap<ClientId, u32>,
    local_clock: u32,
    observers: Vec<(u64, AwarenessCallback)>,
    next_observer: u64,
    destroyed: bool,
}

/// Awareness state for one connection.
pub struct Awareness {
    local_id: ClientId,
    inner: Mutex<Inner>,
}

impl Awareness {
    pub fn new(local_id: ClientId) -> Self {
        Self {
            local_id,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn local_client_id(&self) -> ClientId {
        self.local_id
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the local state. Returns the entry to broadcast, or `None`
    /// once the channel has been destroyed.
    pub fn set_local_state(&self, state: Value) -> Option<AwarenessUpdate> {
        let mut change = AwarenessChange::default();
        let entry = {
            let mut inner = self.inner();
            if inner.destroyed {
                return None;
            }
            inner.local_clock += 1;
            let clock = inner.local_clock;
            let previous = inner.states.insert(self.local_id, ClientState { clock, state: state.clone() });
            match previous {
                None => change.added.push(self.local_id),
                Some(prev) if prev.state != state => change.updated.push(self.local_id),
                Some(_) => {}
            }
            AwarenessEntry {
                client_id: self.local_id,
                clock,
                state: Some(state.to_string()),
            }
        };
        self.notify(&change);
        Some(AwarenessUpdate { entries: vec![entry] })
    }

    /// Merge fields into the local state object, creating it if needed.
    pub fn merge_local_field(&self, field: &str, value: Value) -> Option<AwarenessUpdate> {
        let mut state = match self.local_state() {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        state.insert(field.to_string(), value);
        self.set_local_state(Value::Object(state))
    }

    /// Drop the local state (announces departure to peers).
    pub fn clear_local_state(&self) -> Option<AwarenessUpdate> {
        let mut change = AwarenessChange::default();
        let entry = {
            let mut inner = self.inner();
            if inner.destroyed {
                return None;
            }
            inner.local_clock += 1;
            if inner.states.remove(&self.local_id).is_some() {
                change.removed.push(self.local_id);
            }
            AwarenessEntry {
                client_id: self.local_id,
                clock: inner.local_clock,
                state: None,
            }
        };
        self.notify(&change);
        Some(AwarenessUpdate { entries: vec![entry] })
    }

    pub fn local_state(&self) -> Option<Value> {
        self.inner().states.get(&self.local_id).map(|s| s.state.clone())
    }

    /// Current local entry under a fresh clock, for re-announcing after a
    /// reconnect. Peers may still hold the previous clock for this client.
    pub fn encode_local(&self) -> Option<AwarenessUpdate> {
        let mut inner = self.inner();
        if inner.destroyed || !inner.states.contains_key(&self.local_id) {
            return None;
        }
        inner.local_clock += 1;
        let clock = inner.local_clock;
        let local = inner.states.get_mut(&self.local_id)?;
        local.clock = clock;
        Some(AwarenessUpdate {
            entries: vec![AwarenessEntry {
                client_id: self.local_id,
                clock,
                state: Some(local.state.to_string()),
            }],
        })
    }

    pub fn get_states(&self) -> AwarenessStates {
        snapshot(&self.inner())
    }

    /// Merge remote entries. Entries for the local client and entries whose
    /// JSON does not parse are ignored.
    pub fn apply_update(&self, update: &AwarenessUpdate) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        {
            let mut inner = self.inner();
            if inner.destroyed {
                return change;
            }
            for entry in &update.entries {
                if entry.client_id == self.local_id {
                    continue;
                }
                apply_entry(&mut inner, entry, &mut change);
            }
        }
        self.notify(&change);
        change
    }

    /// Remove a remote client whose connection went away.
    ///
    /// Unlike a `None` state this leaves no tombstone: the client may
    /// reconnect and re-announce itself.
    pub fn remove_client(&self, client_id: ClientId) -> bool {
        if client_id == self.local_id {
            return false;
        }
        let removed = {
            let mut inner = self.inner();
            if inner.destroyed {
                return false;
            }
            inner.states.remove(&client_id).is_some()
        };
        if removed {
            self.notify(&AwarenessChange {
                removed: vec![client_id],
                ..AwarenessChange::default()
            });
        }
        removed
    }

    /// Forget every remote client. Used when the connection drops; the
    /// endpoint replays the roster after reconnecting.
    pub fn clear_remote(&self) -> Vec<ClientId> {
        let removed: Vec<ClientId> = {
            let mut inner = self.inner();
            let ids: Vec<ClientId> = inner
                .states
                .keys()
                .copied()
                .filter(|id| *id != self.local_id)
                .collect();
            for id in &ids {
                inner.states.remove(id);
            }
            ids
        };
        if !removed.is_empty() {
            self.notify(&AwarenessChange {
                removed: removed.clone(),
                ..AwarenessChange::default()
            });
        }
        removed
    }

    /// Register an update observer. Returns `None` if the channel is destroyed.
    pub fn on_update(&self, callback: AwarenessCallback) -> Option<u64> {
        let mut inner = self.inner();
        if inner.destroyed {
            return None;
        }
        inner.next_observer += 1;
        let id = inner.next_observer;
        inner.observers.push((id, callback));
        Some(id)
    }

    pub fn unobserve(&self, id: u64) -> bool {
        let mut inner = self.inner();
        let before = inner.observers.len();
        inner.observers.retain(|(oid, _)| *oid != id);
        inner.observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.inner().observers.len()
    }

    /// Drop all observers and states. Further updates are ignored.
    pub fn destroy(&self) {
        let mut inner = self.inner();
        inner.destroyed = true;
        inner.observers.clear();
        inner.states.clear();
    }

    fn is_observing(&self, id: u64) -> bool {
        let inner = self.inner();
        !inner.destroyed && inner.observers.iter().any(|(oid, _)| *oid == id)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner().destroyed
    }

    fn notify(&self, change: &AwarenessChange) {
        if change.is_empty() {
            return;
        }
        let (callbacks, states) = {
            let inner = self.inner();
            let callbacks: Vec<(u64, AwarenessCallback)> = inner.observers.clone();
            (callbacks, snapshot(&inner))
        };
        for (id, callback) in callbacks {
            // An earlier callback may have destroyed the channel or unobserved this one.
            if !self.is_observing(id) {
                continue;
            }
            callback(change, &states);
        }
    }
}

fn snapshot(inner: &Inner) -> AwarenessStates {
    inner
        .states
        .iter()
        .map(|(id, s)| (*id, s.state.clone()))
        .collect()
}

fn apply_entry(inner: &mut Inner, entry: &AwarenessEntry, change: &mut AwarenessChange) {
    let known_clock = inner
        .states
        .get(&entry.client_id)
        .map(|s| s.clock)
        .or_else(|| inner.removed_clocks.get(&entry.client_id).copied());
    let present = inner.states.contains_key(&entry.client_id);

    match &entry.state {
        None => {
            // A removal at the same clock still wins.
            if present && known_clock.map_or(true, |c| c <= entry.clock) {
                inner.states.remove(&entry.client_id);
                inner.removed_clocks.insert(entry.client_id, entry.clock);
                change.removed.push(entry.client_id);
            }
        }
        Some(text) => {
            if known_clock.is_some_and(|c| c >= entry.clock) {
                return;
            }
            let state: Value = match serde_json::from_str(text) {
                Ok(value) => value,
                Err(e) => {
                    log::debug!("Skipping malformed awareness state for client {}: {e}", entry.client_id);
                    return;
                }
            };
            inner.removed_clocks.remove(&entry.client_id);
            let previous = inner.states.insert(
                entry.client_id,
                ClientState { clock: entry.clock, state: state.clone() },
            );
            match previous {
                None => change.added.push(entry.client_id),
                Some(prev) if prev.state != state => change.updated.push(entry.client_id),
                Some(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry(client_id: ClientId, clock: u32, state: Option<Value>) -> AwarenessEntry {
        AwarenessEntry {
            client_id,
            clock,
            state: state.map(|s| s.to_string()),
        }
    }

    fn update(entries: Vec<AwarenessEntry>) -> AwarenessUpdate {
        AwarenessUpdate { entries }
    }

    #[test]
    fn test_local_state_bumps_clock() {
        let awareness = Awareness::new(1);
        let first = awareness.set_local_state(json!({"user": {"name": "Ada"}})).unwrap();
        let second = awareness.set_local_state(json!({"user": {"name": "Ada L."}})).unwrap();
        assert_eq!(first.entries[0].clock, 1);
        assert_eq!(second.entries[0].clock, 2);
        assert_eq!(awareness.get_states().len(), 1);
    }

    #[test]
    fn test_merge_local_field_keeps_other_fields() {
        let awareness = Awareness::new(1);
        awareness.merge_local_field("user", json!({"name": "Ada"}));
        awareness.merge_local_field("cursor", json!({"anchor": 1, "head": 2}));
        let state = awareness.local_state().unwrap();
        assert_eq!(state["user"]["name"], "Ada");
        assert_eq!(state["cursor"]["head"], 2);
    }

    #[test]
    fn test_remote_entries_last_writer_wins() {
        let awareness = Awareness::new(1);
        let change = awareness.apply_update(&update(vec![entry(2, 5, Some(json!({"v": 5})))]));
        assert_eq!(change.added, vec![2]);

        // Stale clock ignored.
        let change = awareness.apply_update(&update(vec![entry(2, 4, Some(json!({"v": 4})))]));
        assert!(change.is_empty());
        assert_eq!(awareness.get_states()[&2]["v"], 5);

        let change = awareness.apply_update(&update(vec![entry(2, 6, Some(json!({"v": 6})))]));
        assert_eq!(change.updated, vec![2]);
    }

    #[test]
    fn test_removal_and_no_resurrection() {
        let awareness = Awareness::new(1);
        awareness.apply_update(&update(vec![entry(2, 3, Some(json!({})))]));
        let change = awareness.apply_update(&update(vec![entry(2, 3, None)]));
        assert_eq!(change.removed, vec![2]);

        // A delayed copy of the old state must not bring the client back.
        let change = awareness.apply_update(&update(vec![entry(2, 3, Some(json!({})))]));
        assert!(change.is_empty());
        assert!(awareness.get_states().is_empty());
    }

    #[test]
    fn test_departed_client_can_reannounce() {
        let awareness = Awareness::new(1);
        awareness.apply_update(&update(vec![entry(2, 1, Some(json!({"user": {"name": "Ada"}})))]));
        assert!(awareness.remove_client(2));

        // Same client id, same clock, on its new connection.
        let change = awareness.apply_update(&update(vec![entry(2, 1, Some(json!({"user": {"name": "Ada"}})))]));
        assert_eq!(change.added, vec![2]);
        assert!(awareness.get_states().contains_key(&2));
    }

    #[test]
    fn test_encode_local_uses_fresh_clock() {
        let awareness = Awareness::new(1);
        assert!(awareness.encode_local().is_none());
        awareness.set_local_state(json!({"user": {"name": "Ada"}}));

        let first = awareness.encode_local().unwrap();
        let second = awareness.encode_local().unwrap();
        assert_eq!(first.entries[0].clock, 2);
        assert_eq!(second.entries[0].clock, 3);

        // A peer that tombstoned the earlier clock still accepts the re-announce.
        let peer = Awareness::new(9);
        peer.apply_update(&update(vec![entry(1, 1, Some(json!({})))]));
        peer.apply_update(&update(vec![entry(1, 2, None)]));
        let change = peer.apply_update(&second);
        assert_eq!(change.added, vec![1]);
    }

    #[test]
    fn test_clear_local_state_tombstones() {
        let awareness = Awareness::new(1);
        awareness.set_local_state(json!({}));
        let cleared = awareness.clear_local_state().unwrap();
        assert_eq!(cleared.entries[0].state, None);
        assert!(awareness.local_state().is_none());

        let peer = Awareness::new(9);
        peer.apply_update(&update(vec![entry(1, 1, Some(json!({})))]));
        assert_eq!(peer.apply_update(&cleared).removed, vec![1]);
    }

    #[test]
    fn test_no_callbacks_after_destroy_mid_dispatch() {
        let awareness = Arc::new(Awareness::new(1));
        let late = Arc::new(AtomicUsize::new(0));

        let channel = Arc::downgrade(&awareness);
        awareness
            .on_update(Arc::new(move |_, _| {
                if let Some(channel) = channel.upgrade() {
                    channel.destroy();
                }
            }))
            .unwrap();
        let l = late.clone();
        awareness
            .on_update(Arc::new(move |_, _| {
                l.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        awareness.apply_update(&update(vec![entry(2, 1, Some(json!({})))]));
        assert!(awareness.is_destroyed());
        assert_eq!(late.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_local_entries_from_remote_ignored() {
        let awareness = Awareness::new(1);
        awareness.set_local_state(json!({"mine": true}));
        awareness.apply_update(&update(vec![entry(1, 99, Some(json!({"mine": false})))]));
        assert_eq!(awareness.local_state().unwrap()["mine"], true);
    }

    #[test]
    fn test_malformed_json_skipped() {
        let awareness = Awareness::new(1);
        let bad = AwarenessEntry { client_id: 3, clock: 1, state: Some("{not json".into()) };
        let change = awareness.apply_update(&update(vec![bad, entry(4, 1, Some(json!({})))]));
        assert_eq!(change.added, vec![4]);
    }

    #[test]
    fn test_clear_remote_keeps_local() {
        let awareness = Awareness::new(1);
        awareness.set_local_state(json!({}));
        awareness.apply_update(&update(vec![
            entry(2, 1, Some(json!({}))),
            entry(3, 1, Some(json!({}))),
        ]));
        let mut removed = awareness.clear_remote();
        removed.sort();
        assert_eq!(removed, vec![2, 3]);
        assert_eq!(awareness.get_states().keys().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_observers_and_destroy() {
        let awareness = Awareness::new(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let id = awareness
            .on_update(Arc::new(move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        awareness.apply_update(&update(vec![entry(2, 1, Some(json!({})))]));
        assert!(awareness.remove_client(2));
        assert!(!awareness.remove_client(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert!(awareness.unobserve(id));
        awareness.destroy();
        assert!(awareness.is_destroyed());
        assert!(awareness.on_update(Arc::new(|_, _| {})).is_none());
        assert!(awareness.set_local_state(json!({})).is_none());
        assert!(awareness.apply_update(&update(vec![entry(5, 1, Some(json!({})))])).is_empty());
    }
}
