//! Presence tracking: turns the raw awareness roster into a typed list of
//! remote collaborators for cursor and avatar rendering.
//!
//! ```text
//! Awareness::on_update ──► build_roster() ──► PresenceTracker::roster()
//!   (client id → JSON)       (skip local,        └─► on_update callback
//!                             skip malformed,
//!                             fallback names)
//! ```
//!
//! The roster is rebuilt from the full state map on every update rather than
//! patched, so join/leave churn can never leave stale entries behind.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::awareness::{Awareness, AwarenessStates};
use crate::protocol::ClientId;

/// Name editors send when the user has not set one.
pub const PLACEHOLDER_NAME: &str = "Anonymous";

/// Selection in document coordinates. `anchor == head` is a bare caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub anchor: u32,
    pub head: u32,
}

/// One remote collaborator, ready for rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Collaborator {
    pub client_id: ClientId,
    pub name: String,
    /// CSS hex color, e.g. `#30bced`.
    pub color: String,
    pub selection: Option<SelectionRange>,
    /// Whether the collaborator currently has a selection.
    pub is_active: bool,
}

/// Deterministic display name for an unnamed client.
pub fn fallback_name(client_id: ClientId) -> String {
    format!("User-{client_id}")
}

/// Resolve a display name. Already-resolved names pass through unchanged.
pub fn normalize_name(client_id: ClientId, name: Option<&str>) -> String {
    match name.map(str::trim) {
        Some(n) if !n.is_empty() && n != PLACEHOLDER_NAME => n.to_string(),
        _ => fallback_name(client_id),
    }
}

/// Stable cursor color for a client id.
///
/// Uses HSL with fixed saturation and lightness so every hue stays legible
/// on a light background.
pub fn color_for_client(client_id: ClientId) -> String {
    let hue = (client_id % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.5);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Awareness `user` object for the local client.
pub fn user_value(name: &str, color: &str) -> Value {
    json!({ "name": name, "color": color })
}

/// Awareness `cursor` value for the local client.
pub fn cursor_value(selection: Option<SelectionRange>) -> Value {
    match selection {
        Some(sel) => json!({ "anchor": sel.anchor, "head": sel.head }),
        None => Value::Null,
    }
}

fn position(value: &Value, key: &str) -> Option<u32> {
    value.get(key)?.as_u64().and_then(|v| u32::try_from(v).ok())
}

/// Decode one awareness state. Returns `None` when `user` is missing or
/// not an object.
pub fn collaborator_from_state(client_id: ClientId, state: &Value) -> Option<Collaborator> {
    let user = state.get("user").filter(|u| u.is_object())?;

    let name = normalize_name(client_id, user.get("name").and_then(Value::as_str));
    let color = user
        .get("color")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| color_for_client(client_id));

    let selection = state.get("cursor").and_then(|cursor| {
        Some(SelectionRange {
            anchor: position(cursor, "anchor")?,
            head: position(cursor, "head")?,
        })
    });

    Some(Collaborator {
        client_id,
        name,
        color,
        is_active: selection.is_some(),
        selection,
    })
}

/// Build the remote roster, ordered by client id.
pub fn build_roster(local_id: ClientId, states: &AwarenessStates) -> Vec<Collaborator> {
    let mut roster: Vec<Collaborator> = states
        .iter()
        .filter(|(id, _)| **id != local_id)
        .filter_map(|(id, state)| {
            let collaborator = collaborator_from_state(*id, state);
            if collaborator.is_none() {
                log::debug!("Skipping presence entry {id} without user metadata");
            }
            collaborator
        })
        .collect();
    roster.sort_by_key(|c| c.client_id);
    roster
}

pub type RosterCallback = Arc<dyn Fn(&[Collaborator]) + Send + Sync>;

/// Live roster subscription on an awareness channel.
///
/// Unsubscribes on [`PresenceTracker::unsubscribe`] or when dropped.
pub struct PresenceTracker {
    awareness: Weak<Awareness>,
    observer: Option<u64>,
    roster: Arc<Mutex<Vec<Collaborator>>>,
}

impl PresenceTracker {
    /// Start tracking `awareness`. On a destroyed channel this returns an
    /// inert tracker with an empty roster.
    pub fn subscribe<F>(awareness: &Arc<Awareness>, on_update: F) -> Self
    where
        F: Fn(&[Collaborator]) + Send + Sync + 'static,
    {
        let local_id = awareness.local_client_id();
        let roster = Arc::new(Mutex::new(build_roster(local_id, &awareness.get_states())));

        let cache = roster.clone();
        let callback: RosterCallback = Arc::new(on_update);
        let observer = awareness.on_update(Arc::new(move |_change, states| {
            let fresh = build_roster(local_id, states);
            *cache.lock().unwrap_or_else(PoisonError::into_inner) = fresh.clone();
            callback(&fresh);
        }));
        if observer.is_none() {
            log::debug!("Presence subscription on a destroyed awareness channel ignored");
        }

        Self {
            awareness: Arc::downgrade(awareness),
            observer,
            roster,
        }
    }

    /// Latest roster.
    pub fn roster(&self) -> Vec<Collaborator> {
        self.roster.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_subscribed(&self) -> bool {
        self.observer.is_some()
    }

    /// Stop receiving updates. Safe to call repeatedly.
    pub fn unsubscribe(&mut self) {
        if let Some(id) = self.observer.take() {
            if let Some(awareness) = self.awareness.upgrade() {
                awareness.unobserve(id);
            }
        }
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AwarenessEntry, AwarenessUpdate};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn states(entries: Vec<(ClientId, Value)>) -> AwarenessStates {
        entries.into_iter().collect::<HashMap<_, _>>()
    }

    fn remote(client_id: ClientId, clock: u32, state: Value) -> AwarenessUpdate {
        AwarenessUpdate {
            entries: vec![AwarenessEntry { client_id, clock, state: Some(state.to_string()) }],
        }
    }

    #[test]
    fn test_roster_excludes_local_client() {
        let roster = build_roster(
            1,
            &states(vec![
                (1, json!({"user": {"name": "Me"}})),
                (2, json!({"user": {"name": "Ada"}})),
                (3, json!({"user": {"name": "Grace"}})),
                (4, json!({"user": {}})),
            ]),
        );
        assert_eq!(roster.len(), 3);
        assert!(roster.iter().all(|c| c.client_id != 1));
    }

    #[test]
    fn test_fallback_name_and_idempotence() {
        assert_eq!(normalize_name(42, None), "User-42");
        assert_eq!(normalize_name(42, Some("")), "User-42");
        assert_eq!(normalize_name(42, Some(PLACEHOLDER_NAME)), "User-42");
        let once = normalize_name(42, None);
        assert_eq!(normalize_name(42, Some(&once)), once);
        assert_eq!(normalize_name(42, Some("Ada")), "Ada");
    }

    #[test]
    fn test_malformed_user_skipped() {
        let roster = build_roster(
            1,
            &states(vec![
                (2, json!({"cursor": {"anchor": 1, "head": 1}})),
                (3, json!({"user": "not an object"})),
                (4, json!(null)),
                (5, json!({"user": {"name": 7}})),
            ]),
        );
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].name, "User-5");
    }

    #[test]
    fn test_activity_requires_anchor_and_head() {
        let active = collaborator_from_state(
            2,
            &json!({"user": {"name": "Ada"}, "cursor": {"anchor": 3, "head": 9}}),
        )
        .unwrap();
        assert!(active.is_active);
        assert_eq!(active.selection, Some(SelectionRange { anchor: 3, head: 9 }));

        let partial = collaborator_from_state(2, &json!({"user": {}, "cursor": {"anchor": 3}})).unwrap();
        assert!(!partial.is_active);
        assert!(partial.selection.is_none());

        let idle = collaborator_from_state(2, &json!({"user": {}, "cursor": null})).unwrap();
        assert!(!idle.is_active);
    }

    #[test]
    fn test_color_explicit_or_stable() {
        let explicit = collaborator_from_state(2, &json!({"user": {"color": "#ff0000"}})).unwrap();
        assert_eq!(explicit.color, "#ff0000");

        let derived = collaborator_from_state(2, &json!({"user": {}})).unwrap();
        assert_eq!(derived.color, color_for_client(2));
        assert_eq!(color_for_client(2), color_for_client(2));
        assert_eq!(derived.color.len(), 7);
    }

    #[test]
    fn test_hsl_to_rgb_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 0.01);
        assert!(g.abs() < 0.01);
        assert!(b.abs() < 0.01);
    }

    #[test]
    fn test_tracker_follows_join_and_leave() {
        let awareness = Arc::new(Awareness::new(1));
        awareness.set_local_state(json!({"user": {"name": "Me"}}));
        let updates = Arc::new(AtomicUsize::new(0));
        let u = updates.clone();
        let tracker = PresenceTracker::subscribe(&awareness, move |_| {
            u.fetch_add(1, Ordering::SeqCst);
        });
        assert!(tracker.roster().is_empty());

        awareness.apply_update(&remote(2, 1, json!({"user": {"name": "Ada"}})));
        awareness.apply_update(&remote(3, 1, json!({"user": {}})));
        assert_eq!(tracker.roster().len(), 2);
        assert_eq!(tracker.roster()[1].name, "User-3");

        // Join immediately followed by leave leaves nothing behind.
        awareness.apply_update(&remote(4, 1, json!({"user": {}})));
        awareness.remove_client(4);
        awareness.remove_client(2);
        let roster = tracker.roster();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].client_id, 3);
        assert_eq!(updates.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_unsubscribe_and_drop_release_observer() {
        let awareness = Arc::new(Awareness::new(1));
        let mut tracker = PresenceTracker::subscribe(&awareness, |_| {});
        assert_eq!(awareness.observer_count(), 1);
        tracker.unsubscribe();
        tracker.unsubscribe();
        assert_eq!(awareness.observer_count(), 0);

        {
            let _scoped = PresenceTracker::subscribe(&awareness, |_| {});
            assert_eq!(awareness.observer_count(), 1);
        }
        assert_eq!(awareness.observer_count(), 0);
    }

    #[test]
    fn test_subscribe_to_destroyed_channel_is_noop() {
        let awareness = Arc::new(Awareness::new(1));
        awareness.destroy();
        let tracker = PresenceTracker::subscribe(&awareness, |_| panic!("must not fire"));
        assert!(!tracker.is_subscribed());
        assert!(tracker.roster().is_empty());
        drop(tracker);
    }
}
