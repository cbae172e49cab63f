//! The `authz/admin` built-in service Thing.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use hub_core::{
    HubError, Operation, RequestMessage, ResponseMessage, ServiceHandler, ThingDescription,
};

use crate::models::ThingPermission;
use crate::service::AuthzService;

/// Built-in agent id of the authorization service.
pub const AUTHZ_AGENT_ID: &str = "authz";
/// Thing id of the permission-management surface.
pub const ADMIN_THING_ID: &str = "admin";

pub struct AuthzHandler {
    service: Arc<AuthzService>,
}

impl AuthzHandler {
    pub fn new(service: Arc<AuthzService>) -> Self {
        Self { service }
    }

    fn handle_admin(&self, request: &RequestMessage) -> Result<Value, HubError> {
        let sender = request.sender_id.as_str();
        match request.name.as_str() {
            "setPermissions" => {
                let perm: ThingPermission = parse(request)?;
                self.service.set_permissions(sender, perm)?;
                Ok(Value::Null)
            }
            "getPermissions" => {
                let p: DThingIdParams = parse(request)?;
                let perm = self.service.get_permissions_checked(sender, &p.dthing_id)?;
                Ok(serde_json::to_value(perm)?)
            }
            "setRole" => {
                let p: SetRoleParams = parse(request)?;
                self.service.set_client_role(sender, &p.client_id, &p.role)?;
                Ok(Value::Null)
            }
            "registerRole" => {
                let p: RegisterRoleParams = parse(request)?;
                let mut operations = Vec::with_capacity(p.operations.len());
                for op in &p.operations {
                    operations.push(op.parse::<Operation>()?);
                }
                self.service.register_role(sender, &p.role, operations)?;
                Ok(Value::Null)
            }
            other => Err(HubError::NotFound(format!(
                "authz/admin has no action '{other}'"
            ))),
        }
    }
}

#[async_trait]
impl ServiceHandler for AuthzHandler {
    fn agent_id(&self) -> &str {
        AUTHZ_AGENT_ID
    }

    fn self_authorizing(&self) -> bool {
        true
    }

    async fn handle_request(&self, request: &RequestMessage) -> ResponseMessage {
        let result = match request.thing_id.as_str() {
            ADMIN_THING_ID => self.handle_admin(request),
            other => Err(HubError::NotFound(format!("authz has no thing '{other}'"))),
        };
        match result {
            Ok(output) => ResponseMessage::completed(request, AUTHZ_AGENT_ID, output),
            Err(err) => ResponseMessage::failed(request, AUTHZ_AGENT_ID, &err),
        }
    }

    fn thing_descriptions(&self) -> Vec<ThingDescription> {
        let mut admin = ThingDescription::new(ADMIN_THING_ID, "Authorization administration");
        admin
            .add_action("setPermissions", "Set per-Thing role permissions")
            .add_action("getPermissions", "Read per-Thing role permissions")
            .add_action("setRole", "Assign a role to a client")
            .add_action("registerRole", "Register a custom role");
        vec![admin]
    }
}

fn parse<T: DeserializeOwned>(request: &RequestMessage) -> Result<T, HubError> {
    serde_json::from_value(request.input.clone()).map_err(|e| {
        HubError::InvalidArgument(format!(
            "bad input for '{}' on '{}': {e}",
            request.name, request.thing_id
        ))
    })
}

#[derive(Deserialize)]
struct DThingIdParams {
    dthing_id: String,
}

#[derive(Deserialize)]
struct SetRoleParams {
    client_id: String,
    role: String,
}

#[derive(Deserialize)]
struct RegisterRoleParams {
    role: String,
    operations: Vec<String>,
}
