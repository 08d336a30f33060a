//! Presence tracking for a channel.
//!
//! The server publishes the full member list as `presence_state` and
//! incremental changes as `presence_diff`. Both are folded into a map of
//! presence key to the list of metas currently tracked under that key;
//! each meta is identified by its `presence_ref`.
//!
//! Diffs that arrive before the first state of the current join attempt
//! are queued and applied once that state arrives.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::debug;

/// Presence key to tracked metas.
pub type PresenceMap = HashMap<String, Vec<Value>>;

const REF_KEY: &str = "presence_ref";

/// A member change produced by a state or diff sync.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceChange {
    /// Metas joined under `key`.
    Join {
        key: String,
        current: Vec<Value>,
        joined: Vec<Value>,
    },
    /// Metas left from under `key`.
    Leave {
        key: String,
        current: Vec<Value>,
        left: Vec<Value>,
    },
}

impl PresenceChange {
    /// Payload of the `presence` event dispatched for this change.
    #[must_use]
    pub fn to_payload(&self) -> Value {
        match self {
            PresenceChange::Join {
                key,
                current,
                joined,
            } => json!({
                "event": "join",
                "key": key,
                "currentPresences": current,
                "newPresences": joined,
            }),
            PresenceChange::Leave { key, current, left } => json!({
                "event": "leave",
                "key": key,
                "currentPresences": current,
                "leftPresences": left,
            }),
        }
    }
}

/// Presence tracker for a channel.
#[derive(Debug, Default)]
pub struct Presence {
    state: PresenceMap,
    pending_diffs: Vec<(PresenceMap, PresenceMap)>,
    join_ref: Option<String>,
}

impl Presence {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current presence state.
    #[must_use]
    pub fn state(&self) -> &PresenceMap {
        &self.state
    }

    /// Get the number of tracked keys.
    #[must_use]
    pub fn count(&self) -> usize {
        self.state.len()
    }

    /// Check if presence is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    /// Check if diffs must wait for a state sync of `channel_join_ref`.
    #[must_use]
    pub fn in_pending_sync(&self, channel_join_ref: Option<&str>) -> bool {
        self.join_ref.is_none() || self.join_ref.as_deref() != channel_join_ref
    }

    /// Apply a full `presence_state` payload received during `join_ref`.
    ///
    /// Queued diffs are applied afterwards.
    pub fn sync_state(&mut self, join_ref: Option<String>, raw: &Value) -> Vec<PresenceChange> {
        self.join_ref = join_ref;

        let incoming = transform_state(raw);
        let mut joins = PresenceMap::new();
        let mut leaves = PresenceMap::new();

        for (key, metas) in &self.state {
            if !incoming.contains_key(key) {
                leaves.insert(key.clone(), metas.clone());
            }
        }

        for (key, new_metas) in &incoming {
            match self.state.get(key) {
                Some(current_metas) => {
                    let joined: Vec<Value> = new_metas
                        .iter()
                        .filter(|m| !contains_ref(current_metas, m))
                        .cloned()
                        .collect();
                    let left: Vec<Value> = current_metas
                        .iter()
                        .filter(|m| !contains_ref(new_metas, m))
                        .cloned()
                        .collect();
                    if !joined.is_empty() {
                        joins.insert(key.clone(), joined);
                    }
                    if !left.is_empty() {
                        leaves.insert(key.clone(), left);
                    }
                }
                None => {
                    joins.insert(key.clone(), new_metas.clone());
                }
            }
        }

        let mut changes = self.apply_diff(joins, leaves);
        for (joins, leaves) in std::mem::take(&mut self.pending_diffs) {
            changes.extend(self.apply_diff(joins, leaves));
        }
        changes
    }

    /// Apply a `presence_diff` payload.
    ///
    /// Returns `None` if the diff was queued because no state of the
    /// current join attempt has been synced yet.
    pub fn sync_diff(
        &mut self,
        channel_join_ref: Option<&str>,
        raw: &Value,
    ) -> Option<Vec<PresenceChange>> {
        let joins = transform_state(&raw["joins"]);
        let leaves = transform_state(&raw["leaves"]);

        if self.in_pending_sync(channel_join_ref) {
            debug!("Queueing presence diff until state sync");
            self.pending_diffs.push((joins, leaves));
            return None;
        }
        Some(self.apply_diff(joins, leaves))
    }

    fn apply_diff(&mut self, joins: PresenceMap, leaves: PresenceMap) -> Vec<PresenceChange> {
        let mut changes = Vec::new();

        for (key, joined) in joins {
            let current = self.state.get(&key).cloned().unwrap_or_default();
            let mut metas: Vec<Value> = current
                .iter()
                .filter(|m| !contains_ref(&joined, m))
                .cloned()
                .collect();
            metas.extend(joined.iter().cloned());
            self.state.insert(key.clone(), metas);

            changes.push(PresenceChange::Join {
                key,
                current,
                joined,
            });
        }

        for (key, left) in leaves {
            let Some(metas) = self.state.get_mut(&key) else {
                continue;
            };
            metas.retain(|m| !contains_ref(&left, m));
            let current = metas.clone();
            if current.is_empty() {
                self.state.remove(&key);
            }

            changes.push(PresenceChange::Leave { key, current, left });
        }

        changes
    }
}

fn contains_ref(metas: &[Value], meta: &Value) -> bool {
    metas.iter().any(|m| m.get(REF_KEY) == meta.get(REF_KEY))
}

/// Normalize a raw server state into a [`PresenceMap`].
///
/// Accepts both `{key: {metas: [...]}}` and `{key: [...]}`. Server
/// `phx_ref` fields become `presence_ref`; `phx_ref_prev` is dropped.
fn transform_state(raw: &Value) -> PresenceMap {
    let Some(object) = raw.as_object() else {
        return PresenceMap::new();
    };

    object
        .iter()
        .map(|(key, presence)| {
            let metas = presence
                .get("metas")
                .unwrap_or(presence)
                .as_array()
                .map(|metas| metas.iter().map(transform_meta).collect())
                .unwrap_or_default();
            (key.clone(), metas)
        })
        .collect()
}

fn transform_meta(meta: &Value) -> Value {
    let Some(fields) = meta.as_object() else {
        return meta.clone();
    };

    let mut out: Map<String, Value> = fields.clone();
    if let Some(reference) = out.remove("phx_ref") {
        out.insert(REF_KEY.to_string(), reference);
    }
    out.remove("phx_ref_prev");
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(reference: &str, name: &str) -> Value {
        json!({"phx_ref": reference, "name": name})
    }

    #[test]
    fn test_sync_state_joins() {
        let mut presence = Presence::new();
        let changes = presence.sync_state(
            Some("1".into()),
            &json!({"alice": {"metas": [meta("a1", "Alice")]}}),
        );

        assert_eq!(presence.count(), 1);
        assert_eq!(
            presence.state()["alice"],
            vec![json!({"presence_ref": "a1", "name": "Alice"})]
        );
        assert_eq!(changes.len(), 1);
        assert!(matches!(&changes[0], PresenceChange::Join { key, current, .. } if key == "alice" && current.is_empty()));
    }

    #[test]
    fn test_sync_state_leaves_missing_keys() {
        let mut presence = Presence::new();
        presence.sync_state(
            Some("1".into()),
            &json!({
                "alice": {"metas": [meta("a1", "Alice")]},
                "bob": {"metas": [meta("b1", "Bob")]}
            }),
        );

        let changes = presence.sync_state(
            Some("1".into()),
            &json!({"alice": {"metas": [meta("a1", "Alice")]}}),
        );

        assert_eq!(presence.count(), 1);
        assert!(!presence.state().contains_key("bob"));
        assert_eq!(changes.len(), 1);
        assert!(matches!(&changes[0], PresenceChange::Leave { key, current, .. } if key == "bob" && current.is_empty()));
    }

    #[test]
    fn test_diff_queued_until_state() {
        let mut presence = Presence::new();
        let diff = json!({"joins": {"carol": {"metas": [meta("c1", "Carol")]}}, "leaves": {}});

        assert!(presence.sync_diff(Some("1"), &diff).is_none());
        assert!(presence.is_empty());

        let changes = presence.sync_state(Some("1".into()), &json!({}));
        assert_eq!(changes.len(), 1);
        assert!(presence.state().contains_key("carol"));

        let leave = json!({"joins": {}, "leaves": {"carol": {"metas": [meta("c1", "Carol")]}}});
        let changes = presence.sync_diff(Some("1"), &leave).unwrap();
        assert_eq!(changes.len(), 1);
        assert!(presence.is_empty());
    }

    #[test]
    fn test_diff_pending_after_rejoin() {
        let mut presence = Presence::new();
        presence.sync_state(Some("1".into()), &json!({}));
        assert!(!presence.in_pending_sync(Some("1")));
        assert!(presence.in_pending_sync(Some("5")));
    }

    #[test]
    fn test_join_keeps_other_metas() {
        let mut presence = Presence::new();
        presence.sync_state(
            Some("1".into()),
            &json!({"alice": {"metas": [meta("a1", "phone")]}}),
        );
        let diff = json!({"joins": {"alice": {"metas": [meta("a2", "laptop")]}}, "leaves": {}});
        let changes = presence.sync_diff(Some("1"), &diff).unwrap();

        assert_eq!(presence.state()["alice"].len(), 2);
        assert_eq!(
            changes[0].to_payload()["currentPresences"][0]["presence_ref"],
            "a1"
        );
        assert_eq!(changes[0].to_payload()["newPresences"][0]["presence_ref"], "a2");
    }
}
