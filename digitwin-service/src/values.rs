//! Latest-value store for digital twins.
//!
//! Keeps the last reported property and event value per `(thing, name)` and
//! the last action invocation per `(thing, action)` with its progress.
//! Last-writer-wins per key; history is out of scope.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use hub_core::{now_ms, RequestStatus};

/// Thing id of the values service Thing.
pub const VALUES_THING_ID: &str = "values";

/// Latest property or event value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueRecord {
    pub value: Value,
    pub updated_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// Latest invocation of one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Value,
    pub state: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Consumer that invoked the action.
    #[serde(default)]
    pub sender_id: String,
    pub requested_ms: i64,
    pub updated_ms: i64,
}

#[derive(Default)]
struct ThingValues {
    properties: HashMap<String, ValueRecord>,
    events: HashMap<String, ValueRecord>,
    actions: HashMap<String, ActionRecord>,
}

pub struct ValueStore {
    things: RwLock<HashMap<String, ThingValues>>,
    /// Upper bound on distinct action records kept per Thing; the stalest
    /// record is evicted when a new action name would exceed it.
    max_actions_per_thing: usize,
}

impl ValueStore {
    pub fn new(max_actions_per_thing: usize) -> Self {
        Self {
            things: RwLock::new(HashMap::new()),
            max_actions_per_thing,
        }
    }

    pub fn update_property(
        &self,
        dthing_id: &str,
        name: &str,
        value: Value,
        correlation_id: Option<String>,
    ) {
        let mut guard = self.things.write().expect("values lock poisoned");
        guard.entry(dthing_id.to_string()).or_default().properties.insert(
            name.to_string(),
            ValueRecord {
                value,
                updated_ms: now_ms(),
                correlation_id,
            },
        );
    }

    pub fn update_event(
        &self,
        dthing_id: &str,
        name: &str,
        value: Value,
        correlation_id: Option<String>,
    ) {
        let mut guard = self.things.write().expect("values lock poisoned");
        guard.entry(dthing_id.to_string()).or_default().events.insert(
            name.to_string(),
            ValueRecord {
                value,
                updated_ms: now_ms(),
                correlation_id,
            },
        );
    }

    /// Record a freshly forwarded action invocation as pending.
    pub fn record_action_request(
        &self,
        dthing_id: &str,
        name: &str,
        input: Value,
        correlation_id: Option<String>,
        sender_id: &str,
    ) {
        let now = now_ms();
        let mut guard = self.things.write().expect("values lock poisoned");
        let thing = guard.entry(dthing_id.to_string()).or_default();
        if !thing.actions.contains_key(name) && thing.actions.len() >= self.max_actions_per_thing
        {
            if let Some(stalest) = thing
                .actions
                .iter()
                .min_by_key(|(_, record)| record.updated_ms)
                .map(|(name, _)| name.clone())
            {
                thing.actions.remove(&stalest);
            }
        }
        thing.actions.insert(
            name.to_string(),
            ActionRecord {
                input,
                output: Value::Null,
                state: RequestStatus::Pending,
                correlation_id,
                sender_id: sender_id.to_string(),
                requested_ms: now,
                updated_ms: now,
            },
        );
    }

    /// Update the progress of the latest invocation of an action.
    pub fn update_action_status(
        &self,
        dthing_id: &str,
        name: &str,
        state: RequestStatus,
        output: Value,
        correlation_id: Option<String>,
    ) {
        let mut guard = self.things.write().expect("values lock poisoned");
        let thing = guard.entry(dthing_id.to_string()).or_default();
        match thing.actions.get_mut(name) {
            Some(record) => {
                record.state = state;
                record.output = output;
                record.updated_ms = now_ms();
                if correlation_id.is_some() {
                    record.correlation_id = correlation_id;
                }
            }
            None => {
                // status arriving for an invocation this runtime never saw
                // (agent restarted mid-flight); keep it queryable anyway
                let now = now_ms();
                thing.actions.insert(
                    name.to_string(),
                    ActionRecord {
                        input: Value::Null,
                        output,
                        state,
                        correlation_id,
                        sender_id: String::new(),
                        requested_ms: now,
                        updated_ms: now,
                    },
                );
            }
        }
    }

    pub fn read_property(&self, dthing_id: &str, name: &str) -> Option<ValueRecord> {
        self.things
            .read()
            .expect("values lock poisoned")
            .get(dthing_id)
            .and_then(|t| t.properties.get(name).cloned())
    }

    pub fn read_all_properties(&self, dthing_id: &str) -> HashMap<String, ValueRecord> {
        self.things
            .read()
            .expect("values lock poisoned")
            .get(dthing_id)
            .map(|t| t.properties.clone())
            .unwrap_or_default()
    }

    pub fn read_event(&self, dthing_id: &str, name: &str) -> Option<ValueRecord> {
        self.things
            .read()
            .expect("values lock poisoned")
            .get(dthing_id)
            .and_then(|t| t.events.get(name).cloned())
    }

    pub fn read_all_events(&self, dthing_id: &str) -> HashMap<String, ValueRecord> {
        self.things
            .read()
            .expect("values lock poisoned")
            .get(dthing_id)
            .map(|t| t.events.clone())
            .unwrap_or_default()
    }

    pub fn query_action(&self, dthing_id: &str, name: &str) -> Option<ActionRecord> {
        self.things
            .read()
            .expect("values lock poisoned")
            .get(dthing_id)
            .and_then(|t| t.actions.get(name).cloned())
    }

    pub fn query_all_actions(&self, dthing_id: &str) -> HashMap<String, ActionRecord> {
        self.things
            .read()
            .expect("values lock poisoned")
            .get(dthing_id)
            .map(|t| t.actions.clone())
            .unwrap_or_default()
    }

    /// Drop everything stored for a Thing; used when its TD is removed.
    pub fn remove_thing(&self, dthing_id: &str) {
        self.things
            .write()
            .expect("values lock poisoned")
            .remove(dthing_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn latest_value_wins() {
        let store = ValueStore::new(100);
        store.update_property("dtw:a1:thing1", "temperature", json!(20), None);
        store.update_property("dtw:a1:thing1", "temperature", json!(21), None);

        let record = store
            .read_property("dtw:a1:thing1", "temperature")
            .expect("value");
        assert_eq!(record.value, json!(21));
        assert_eq!(store.read_all_properties("dtw:a1:thing1").len(), 1);
    }

    #[test]
    fn events_are_kept_per_name() {
        let store = ValueStore::new(100);
        store.update_event("dtw:a1:thing1", "overheated", json!({"temp": 90}), None);
        store.update_event("dtw:a1:thing1", "cooled", json!({"temp": 20}), None);
        assert_eq!(store.read_all_events("dtw:a1:thing1").len(), 2);
        assert!(store.read_event("dtw:a1:thing1", "overheated").is_some());
        assert!(store.read_event("dtw:a1:thing1", "missing").is_none());
    }

    #[test]
    fn action_lifecycle_is_recorded() {
        let store = ValueStore::new(100);
        store.record_action_request(
            "dtw:a1:thing1",
            "toggle",
            json!(true),
            Some("c-1".to_string()),
            "alice",
        );
        let record = store.query_action("dtw:a1:thing1", "toggle").expect("record");
        assert_eq!(record.state, RequestStatus::Pending);
        assert_eq!(record.sender_id, "alice");

        store.update_action_status(
            "dtw:a1:thing1",
            "toggle",
            RequestStatus::Completed,
            json!("ok"),
            Some("c-1".to_string()),
        );
        let record = store.query_action("dtw:a1:thing1", "toggle").expect("record");
        assert_eq!(record.state, RequestStatus::Completed);
        assert_eq!(record.output, json!("ok"));
        assert_eq!(record.input, json!(true));
    }

    #[test]
    fn action_records_are_capped_per_thing() {
        let store = ValueStore::new(2);
        store.record_action_request("dtw:a1:thing1", "a", json!(1), None, "x");
        store.record_action_request("dtw:a1:thing1", "b", json!(2), None, "x");
        store.record_action_request("dtw:a1:thing1", "c", json!(3), None, "x");

        let actions = store.query_all_actions("dtw:a1:thing1");
        assert_eq!(actions.len(), 2);
        assert!(actions.contains_key("c"));
    }

    #[test]
    fn unknown_thing_reads_are_empty() {
        let store = ValueStore::new(100);
        assert!(store.read_property("dtw:a1:none", "x").is_none());
        assert!(store.read_all_properties("dtw:a1:none").is_empty());
        assert!(store.query_all_actions("dtw:a1:none").is_empty());
    }
}
