//! The digital-twin Thing Description directory.
//!
//! Stores one TD per digital-twin id. Agents publish TDs under their own
//! namespace; the directory prefixes the id with `dtw:<agent_id>:` and
//! replaces every Form with one pointing at the runtime's transports, so
//! consumers always address the hub rather than the device.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;
use tracing::{debug, info};

use hub_core::td::FormsHook;
use hub_core::thing_id::{make_dthing_id, validate_thing_id, DThingId};
use hub_core::{
    HubError, NotificationKind, NotificationMessage, Operation, ThingDescription,
};

/// Event emitted whenever a TD is stored or replaced; payload is the full
/// digital-twin TD JSON.
pub const EVENT_THING_UPDATED: &str = "ThingUpdated";
/// Event emitted when a TD is removed; payload is the digital-twin id.
pub const EVENT_THING_REMOVED: &str = "ThingRemoved";

/// Built-in agent id owning the directory and values Things.
pub const DIGITWIN_AGENT_ID: &str = "digitwin";
/// Thing id of the directory service Thing.
pub const DIRECTORY_THING_ID: &str = "directory";

/// Receives the directory's own events; the runtime routes them through the
/// notification path like any agent event.
pub type EventSink = Box<dyn Fn(NotificationMessage) + Send + Sync>;

pub struct DigitwinDirectory {
    tds: RwLock<HashMap<String, ThingDescription>>,
    forms_hook: RwLock<Option<FormsHook>>,
    event_sink: RwLock<Option<EventSink>>,
}

impl Default for DigitwinDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl DigitwinDirectory {
    pub fn new() -> Self {
        Self {
            tds: RwLock::new(HashMap::new()),
            forms_hook: RwLock::new(None),
            event_sink: RwLock::new(None),
        }
    }

    /// Install the transport manager's form factory. Stored TDs are stamped
    /// at update time, so install before agents publish.
    pub fn set_forms_hook(&self, hook: FormsHook) {
        *self.forms_hook.write().expect("directory lock poisoned") = Some(hook);
    }

    pub fn set_event_sink(&self, sink: EventSink) {
        *self.event_sink.write().expect("directory lock poisoned") = Some(sink);
    }

    /// Store or replace the TD an agent published.
    ///
    /// Returns the stored digital-twin TD and emits one `ThingUpdated`
    /// event per successful update.
    pub fn update_td(
        &self,
        agent_id: &str,
        td_json: Value,
    ) -> Result<ThingDescription, HubError> {
        let mut td: ThingDescription = serde_json::from_value(td_json)
            .map_err(|e| HubError::InvalidArgument(format!("malformed TD: {e}")))?;
        if td.id.is_empty() {
            return Err(HubError::InvalidArgument("TD has no id".to_string()));
        }
        validate_thing_id(&td.id)?;

        let dthing_id = make_dthing_id(agent_id, &td.id);
        td.id = dthing_id.clone();
        self.stamp_forms(&mut td);

        self.tds
            .write()
            .expect("directory lock poisoned")
            .insert(dthing_id.clone(), td.clone());
        info!(dthing_id = %dthing_id, agent_id, "TD updated");

        self.emit(NotificationMessage::new(
            NotificationKind::Event,
            DIRECTORY_THING_ID,
            EVENT_THING_UPDATED,
            serde_json::to_value(&td)?,
            DIGITWIN_AGENT_ID,
        ));
        Ok(td)
    }

    pub fn read_td(&self, dthing_id: &str) -> Result<ThingDescription, HubError> {
        self.tds
            .read()
            .expect("directory lock poisoned")
            .get(dthing_id)
            .cloned()
            .ok_or_else(|| HubError::NotFound(format!("TD '{dthing_id}'")))
    }

    /// Page through all stored TDs. Stable order by id.
    pub fn read_all_tds(&self, limit: usize, offset: usize) -> Vec<ThingDescription> {
        let guard = self.tds.read().expect("directory lock poisoned");
        let mut ids: Vec<&String> = guard.keys().collect();
        ids.sort();
        ids.into_iter()
            .skip(offset)
            .take(if limit == 0 { usize::MAX } else { limit })
            .filter_map(|id| guard.get(id).cloned())
            .collect()
    }

    pub fn remove_td(&self, dthing_id: &str) -> Result<(), HubError> {
        let removed = self
            .tds
            .write()
            .expect("directory lock poisoned")
            .remove(dthing_id);
        if removed.is_none() {
            return Err(HubError::NotFound(format!("TD '{dthing_id}'")));
        }
        info!(dthing_id, "TD removed");
        self.emit(NotificationMessage::new(
            NotificationKind::Event,
            DIRECTORY_THING_ID,
            EVENT_THING_REMOVED,
            Value::String(dthing_id.to_string()),
            DIGITWIN_AGENT_ID,
        ));
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.tds.read().expect("directory lock poisoned").len()
    }

    /// The agent owning a stored TD, derived from its digital-twin id.
    pub fn owning_agent(dthing_id: &str) -> Result<String, HubError> {
        Ok(DThingId::parse(dthing_id)?.agent_id)
    }

    fn emit(&self, notification: NotificationMessage) {
        if let Some(sink) = self
            .event_sink
            .read()
            .expect("directory lock poisoned")
            .as_ref()
        {
            sink(notification);
        } else {
            debug!(name = %notification.name, "directory event dropped: no sink installed");
        }
    }

    /// Replace every published Form with runtime-addressed ones. Without a
    /// hook installed the agent's own Forms are stripped: consumers must
    /// never see device-direct endpoints.
    fn stamp_forms(&self, td: &mut ThingDescription) {
        let guard = self.forms_hook.read().expect("directory lock poisoned");
        let hook = guard.as_ref();
        let dthing_id = td.id.clone();

        let build = |ops: &[Operation], name: &str| -> Vec<hub_core::Form> {
            match hook {
                Some(hook) => ops
                    .iter()
                    .map(|op| hook(op.as_str(), &dthing_id, name))
                    .collect(),
                None => Vec::new(),
            }
        };

        for (name, prop) in td.properties.iter_mut() {
            prop.forms = build(
                &[
                    Operation::ReadProperty,
                    Operation::WriteProperty,
                    Operation::ObserveProperty,
                ],
                name,
            );
        }
        for (name, event) in td.events.iter_mut() {
            event.forms = build(&[Operation::SubscribeEvent], name);
        }
        for (name, action) in td.actions.iter_mut() {
            action.forms = build(&[Operation::InvokeAction, Operation::QueryAction], name);
        }
        td.forms = build(&[Operation::ReadAllProperties], "");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_core::Form;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn sample_td() -> Value {
        json!({
            "id": "thing99",
            "title": "Multisensor",
            "properties": {"temperature": {"title": "Temperature",
                "forms": [{"href": "http://device.local/temp"}]}},
            "events": {"overheated": {"title": "Overheated"}},
            "actions": {"identify": {"title": "Identify"}}
        })
    }

    #[test]
    fn update_prefixes_id_and_emits_event() {
        let directory = DigitwinDirectory::new();
        let events: Arc<Mutex<Vec<NotificationMessage>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        directory.set_event_sink(Box::new(move |n| sink.lock().expect("lock").push(n)));

        let stored = directory.update_td("a1", sample_td()).expect("update");
        assert_eq!(stored.id, "dtw:a1:thing99");

        let emitted = events.lock().expect("lock");
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].name, EVENT_THING_UPDATED);
        assert_eq!(emitted[0].data["id"], "dtw:a1:thing99");
    }

    #[test]
    fn forms_point_at_the_runtime_not_the_agent() {
        let directory = DigitwinDirectory::new();
        directory.set_forms_hook(Arc::new(|op, dthing_id, name| {
            Form::new(op, format!("https://hub/{op}/{dthing_id}/{name}"))
        }));

        let stored = directory.update_td("a1", sample_td()).expect("update");
        let prop = &stored.properties["temperature"];
        assert!(prop
            .forms
            .iter()
            .all(|f| f.href.starts_with("https://hub/")));
        assert!(prop.forms.iter().any(|f| f.op == json!("readproperty")));
    }

    #[test]
    fn device_forms_are_stripped_without_a_hook() {
        let directory = DigitwinDirectory::new();
        let stored = directory.update_td("a1", sample_td()).expect("update");
        assert!(stored.properties["temperature"].forms.is_empty());
    }

    #[test]
    fn read_remove_round_trip() {
        let directory = DigitwinDirectory::new();
        directory.update_td("a1", sample_td()).expect("update");

        assert!(directory.read_td("dtw:a1:thing99").is_ok());
        assert_eq!(directory.read_all_tds(0, 0).len(), 1);

        directory.remove_td("dtw:a1:thing99").expect("remove");
        assert!(matches!(
            directory.read_td("dtw:a1:thing99"),
            Err(HubError::NotFound(_))
        ));
        assert!(directory.remove_td("dtw:a1:thing99").is_err());
    }

    #[test]
    fn pagination_is_stable() {
        let directory = DigitwinDirectory::new();
        for i in 0..5 {
            directory
                .update_td("a1", json!({"id": format!("thing{i}"), "title": "t"}))
                .expect("update");
        }
        let first = directory.read_all_tds(2, 0);
        let second = directory.read_all_tds(2, 2);
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_ne!(first[0].id, second[0].id);
    }

    #[test]
    fn malformed_td_is_rejected() {
        let directory = DigitwinDirectory::new();
        assert!(directory.update_td("a1", json!("not a td")).is_err());
        assert!(directory.update_td("a1", json!({"title": "no id"})).is_err());
    }
}
