//! The `digitwin/directory` and `digitwin/values` built-in service Things.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use authn_service::{AuthnStore, ClientType};
use authz_service::AuthzService;
use hub_core::{
    HubError, Operation, RequestMessage, ResponseMessage, ServiceHandler, ThingDescription,
};

use crate::directory::{
    DigitwinDirectory, DIGITWIN_AGENT_ID, DIRECTORY_THING_ID, EVENT_THING_REMOVED,
    EVENT_THING_UPDATED,
};
use crate::values::{ValueStore, VALUES_THING_ID};

pub struct DigitwinHandler {
    directory: Arc<DigitwinDirectory>,
    values: Arc<ValueStore>,
    authz: Arc<AuthzService>,
    store: Arc<AuthnStore>,
}

impl DigitwinHandler {
    pub fn new(
        directory: Arc<DigitwinDirectory>,
        values: Arc<ValueStore>,
        authz: Arc<AuthzService>,
        store: Arc<AuthnStore>,
    ) -> Self {
        Self {
            directory,
            values,
            authz,
            store,
        }
    }

    fn check(&self, sender: &str, operation: Operation, dthing_id: &str) -> Result<(), HubError> {
        if self.authz.has_permission(sender, operation, dthing_id) {
            Ok(())
        } else {
            Err(HubError::Forbidden(format!(
                "'{sender}' may not {operation} on '{dthing_id}'"
            )))
        }
    }

    fn directory_dthing_id() -> String {
        hub_core::thing_id::make_dthing_id(DIGITWIN_AGENT_ID, DIRECTORY_THING_ID)
    }

    fn handle_directory(&self, request: &RequestMessage) -> Result<Value, HubError> {
        let sender = request.sender_id.as_str();
        match (request.operation, request.name.as_str()) {
            (Operation::UpdateTd, _) | (Operation::InvokeAction, "updateTD") => {
                let profile = self.store.get_profile(sender)?;
                if !matches!(profile.client_type, ClientType::Agent | ClientType::Service) {
                    return Err(HubError::Forbidden(format!(
                        "'{sender}' is not an agent and cannot publish TDs"
                    )));
                }
                let stored = self.directory.update_td(sender, request.input.clone())?;
                Ok(serde_json::to_value(stored)?)
            }
            (Operation::ReadTd, _) | (Operation::InvokeAction, "readTD") => {
                let (dthing_id, _) = parse_target(request)?;
                self.check(sender, Operation::ReadTd, &dthing_id)?;
                Ok(serde_json::to_value(self.directory.read_td(&dthing_id)?)?)
            }
            (Operation::ReadAllTds, _) | (Operation::InvokeAction, "readAllTDs") => {
                let p: PageParams = if request.input.is_null() {
                    PageParams::default()
                } else {
                    parse(request)?
                };
                self.check(sender, Operation::ReadAllTds, &Self::directory_dthing_id())?;
                Ok(serde_json::to_value(
                    self.directory.read_all_tds(p.limit, p.offset),
                )?)
            }
            (Operation::RemoveTd, _) | (Operation::InvokeAction, "removeTD") => {
                let (dthing_id, _) = parse_target(request)?;
                let profile = self.store.get_profile(sender)?;
                let owner = DigitwinDirectory::owning_agent(&dthing_id)?;
                if profile.role != "admin" && owner != sender {
                    return Err(HubError::Forbidden(format!(
                        "'{sender}' may not remove TD '{dthing_id}'"
                    )));
                }
                self.directory.remove_td(&dthing_id)?;
                self.values.remove_thing(&dthing_id);
                Ok(Value::Null)
            }
            (op, name) => Err(HubError::NotFound(format!(
                "digitwin/directory has no operation '{op}' '{name}'"
            ))),
        }
    }

    fn handle_values(&self, request: &RequestMessage) -> Result<Value, HubError> {
        let sender = request.sender_id.as_str();
        let action = match (request.operation, request.name.as_str()) {
            (Operation::QueryAction, _) => "queryAction",
            (Operation::QueryAllActions, _) => "queryAllActions",
            (Operation::InvokeAction, name) => name,
            (op, name) => {
                return Err(HubError::NotFound(format!(
                    "digitwin/values has no operation '{op}' '{name}'"
                )))
            }
        };
        match action {
            "readProperty" => {
                let (dthing_id, name) = parse_target(request)?;
                self.check(sender, Operation::ReadProperty, &dthing_id)?;
                let record = self
                    .values
                    .read_property(&dthing_id, &name)
                    .ok_or_else(|| {
                        HubError::NotFound(format!("no value for '{dthing_id}' '{name}'"))
                    })?;
                Ok(serde_json::to_value(record)?)
            }
            "readAllProperties" => {
                let (dthing_id, _) = parse_target(request)?;
                self.check(sender, Operation::ReadAllProperties, &dthing_id)?;
                Ok(serde_json::to_value(self.values.read_all_properties(&dthing_id))?)
            }
            "readEvent" => {
                let (dthing_id, name) = parse_target(request)?;
                self.check(sender, Operation::SubscribeEvent, &dthing_id)?;
                let record = self.values.read_event(&dthing_id, &name).ok_or_else(|| {
                    HubError::NotFound(format!("no event for '{dthing_id}' '{name}'"))
                })?;
                Ok(serde_json::to_value(record)?)
            }
            "readAllEvents" => {
                let (dthing_id, _) = parse_target(request)?;
                self.check(sender, Operation::SubscribeAllEvents, &dthing_id)?;
                Ok(serde_json::to_value(self.values.read_all_events(&dthing_id))?)
            }
            "queryAction" => {
                let (dthing_id, name) = parse_target(request)?;
                self.check(sender, Operation::QueryAction, &dthing_id)?;
                let record = self.values.query_action(&dthing_id, &name).ok_or_else(|| {
                    HubError::NotFound(format!("no invocation of '{dthing_id}' '{name}'"))
                })?;
                Ok(serde_json::to_value(record)?)
            }
            "queryAllActions" => {
                let (dthing_id, _) = parse_target(request)?;
                self.check(sender, Operation::QueryAllActions, &dthing_id)?;
                Ok(serde_json::to_value(self.values.query_all_actions(&dthing_id))?)
            }
            other => Err(HubError::NotFound(format!(
                "digitwin/values has no action '{other}'"
            ))),
        }
    }
}

#[async_trait]
impl ServiceHandler for DigitwinHandler {
    fn agent_id(&self) -> &str {
        DIGITWIN_AGENT_ID
    }

    fn self_authorizing(&self) -> bool {
        true
    }

    async fn handle_request(&self, request: &RequestMessage) -> ResponseMessage {
        let result = match request.thing_id.as_str() {
            DIRECTORY_THING_ID => self.handle_directory(request),
            VALUES_THING_ID => self.handle_values(request),
            other => Err(HubError::NotFound(format!(
                "digitwin has no thing '{other}'"
            ))),
        };
        match result {
            Ok(output) => ResponseMessage::completed(request, DIGITWIN_AGENT_ID, output),
            Err(err) => ResponseMessage::failed(request, DIGITWIN_AGENT_ID, &err),
        }
    }

    fn thing_descriptions(&self) -> Vec<ThingDescription> {
        let mut directory = ThingDescription::new(DIRECTORY_THING_ID, "Digital twin directory");
        directory
            .add_action("readTD", "Read one Thing Description")
            .add_action("readAllTDs", "Page through Thing Descriptions")
            .add_action("updateTD", "Publish a Thing Description")
            .add_action("removeTD", "Remove a Thing Description")
            .add_event(EVENT_THING_UPDATED, "A TD was stored or replaced")
            .add_event(EVENT_THING_REMOVED, "A TD was removed");

        let mut values = ThingDescription::new(VALUES_THING_ID, "Digital twin values");
        values
            .add_action("readProperty", "Latest property value")
            .add_action("readAllProperties", "All latest property values")
            .add_action("readEvent", "Latest event value")
            .add_action("readAllEvents", "All latest event values")
            .add_action("queryAction", "Latest action invocation")
            .add_action("queryAllActions", "All latest action invocations");
        vec![directory, values]
    }
}

fn parse<T: serde::de::DeserializeOwned>(request: &RequestMessage) -> Result<T, HubError> {
    serde_json::from_value(request.input.clone()).map_err(|e| {
        HubError::InvalidArgument(format!(
            "bad input for '{}' on '{}': {e}",
            request.name, request.thing_id
        ))
    })
}

/// Accept either a bare digital-twin id string or `{dthing_id, name}`.
fn parse_target(request: &RequestMessage) -> Result<(String, String), HubError> {
    match &request.input {
        Value::String(dthing_id) => Ok((dthing_id.clone(), String::new())),
        Value::Object(_) => {
            let p: TargetParams = parse(request)?;
            Ok((p.dthing_id, p.name))
        }
        _ => Err(HubError::InvalidArgument(format!(
            "'{}' requires a target thing id",
            request.name
        ))),
    }
}

#[derive(Deserialize)]
struct TargetParams {
    dthing_id: String,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize, Default)]
struct PageParams {
    #[serde(default)]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use authn_service::{ClientProfile, HashAlgorithm};
    use serde_json::json;
    use tempfile::tempdir;

    struct Fixture {
        handler: DigitwinHandler,
        values: Arc<ValueStore>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(
            AuthnStore::open(dir.path().join("authn.json"), HashAlgorithm::Argon2id)
                .expect("open"),
        );
        for (id, client_type, role) in [
            ("admin1", ClientType::Service, "admin"),
            ("a1", ClientType::Agent, "agent"),
            ("v", ClientType::Consumer, "viewer"),
        ] {
            store
                .add(&ClientProfile {
                    role: role.to_string(),
                    ..ClientProfile::new(id, client_type)
                })
                .expect("seed");
        }
        let authz = Arc::new(AuthzService::open(store.clone(), None).expect("authz"));
        let values = Arc::new(ValueStore::new(100));
        let handler = DigitwinHandler::new(
            Arc::new(DigitwinDirectory::new()),
            values.clone(),
            authz,
            store,
        );
        Fixture {
            handler,
            values,
            _dir: dir,
        }
    }

    fn request(op: Operation, thing: &str, name: &str, input: Value, sender: &str) -> RequestMessage {
        RequestMessage::new(op, thing, name, input, sender).with_correlation("c-1")
    }

    #[tokio::test]
    async fn agent_publishes_viewer_reads() {
        let fx = fixture();
        let td = json!({"id": "thing1", "title": "Sensor"});
        let resp = fx
            .handler
            .handle_request(&request(Operation::UpdateTd, "directory", "", td, "a1"))
            .await;
        assert!(!resp.is_failed(), "{:?}", resp.error);
        assert_eq!(resp.output["id"], "dtw:a1:thing1");

        let resp = fx
            .handler
            .handle_request(&request(
                Operation::ReadTd,
                "directory",
                "",
                json!("dtw:a1:thing1"),
                "v",
            ))
            .await;
        assert!(!resp.is_failed());
        assert_eq!(resp.output["id"], "dtw:a1:thing1");
    }

    #[tokio::test]
    async fn consumers_cannot_publish_tds() {
        let fx = fixture();
        let resp = fx
            .handler
            .handle_request(&request(
                Operation::UpdateTd,
                "directory",
                "",
                json!({"id": "thing1", "title": "Fake"}),
                "v",
            ))
            .await;
        assert!(resp.is_failed());
        assert_eq!(
            resp.error.as_ref().map(|e| e.kind.as_str()),
            Some("Forbidden")
        );
    }

    #[tokio::test]
    async fn remove_is_owner_or_admin_only() {
        let fx = fixture();
        fx.handler
            .handle_request(&request(
                Operation::UpdateTd,
                "directory",
                "",
                json!({"id": "thing1", "title": "Sensor"}),
                "a1",
            ))
            .await;

        let resp = fx
            .handler
            .handle_request(&request(
                Operation::RemoveTd,
                "directory",
                "",
                json!("dtw:a1:thing1"),
                "v",
            ))
            .await;
        assert!(resp.is_failed());

        let resp = fx
            .handler
            .handle_request(&request(
                Operation::RemoveTd,
                "directory",
                "",
                json!("dtw:a1:thing1"),
                "admin1",
            ))
            .await;
        assert!(!resp.is_failed(), "{:?}", resp.error);
    }

    #[tokio::test]
    async fn value_queries_check_the_target_thing() {
        let fx = fixture();
        fx.values
            .update_property("dtw:a1:thing1", "temperature", json!(21), None);

        let resp = fx
            .handler
            .handle_request(&request(
                Operation::InvokeAction,
                "values",
                "readProperty",
                json!({"dthing_id": "dtw:a1:thing1", "name": "temperature"}),
                "v",
            ))
            .await;
        assert!(!resp.is_failed(), "{:?}", resp.error);
        assert_eq!(resp.output["value"], json!(21));

        let resp = fx
            .handler
            .handle_request(&request(
                Operation::InvokeAction,
                "values",
                "readProperty",
                json!({"dthing_id": "dtw:a1:thing1", "name": "missing"}),
                "v",
            ))
            .await;
        assert!(resp.is_failed());
        assert_eq!(
            resp.error.as_ref().map(|e| e.kind.as_str()),
            Some("NotFound")
        );
    }
}
