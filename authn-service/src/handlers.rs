//! The `authn/admin` and `authn/user` built-in service Things.
//!
//! Thin dispatch layer translating action requests into [`AuthnService`]
//! calls. Access rules live in the service: admin actions check the sender's
//! role, user actions are scoped to the authenticated sender.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use hub_core::{
    HubError, Operation, RequestMessage, ResponseMessage, ServiceHandler, ThingDescription,
};

use crate::models::ClientProfile;
use crate::service::AuthnService;

/// Built-in agent id of the authentication service.
pub const AUTHN_AGENT_ID: &str = "authn";
/// Thing id of the administration surface.
pub const ADMIN_THING_ID: &str = "admin";
/// Thing id of the self-service surface.
pub const USER_THING_ID: &str = "user";

pub struct AuthnHandler {
    service: Arc<AuthnService>,
}

impl AuthnHandler {
    pub fn new(service: Arc<AuthnService>) -> Self {
        Self { service }
    }

    fn handle_admin(&self, request: &RequestMessage) -> Result<Value, HubError> {
        let sender = request.sender_id.as_str();
        match request.name.as_str() {
            "addAgent" => {
                let p: AddAgentParams = parse(request)?;
                let token =
                    self.service
                        .add_agent(sender, &p.agent_id, &p.display_name, &p.public_key)?;
                Ok(json!({ "token": token }))
            }
            "addService" => {
                let p: AddServiceParams = parse(request)?;
                let token = self.service.add_service(
                    sender,
                    &p.service_id,
                    &p.display_name,
                    &p.public_key,
                )?;
                Ok(json!({ "token": token }))
            }
            "addConsumer" => {
                let p: AddConsumerParams = parse(request)?;
                let token = self.service.add_consumer(
                    sender,
                    &p.client_id,
                    &p.display_name,
                    p.password.as_deref(),
                    p.public_key.as_deref(),
                    &p.role,
                )?;
                Ok(json!({ "token": token }))
            }
            "getProfile" => {
                let p: ClientIdParams = parse(request)?;
                let profile = self.service.get_client_profile(sender, &p.client_id)?;
                Ok(serde_json::to_value(profile)?)
            }
            "getProfiles" => {
                let profiles = self.service.get_profiles(sender)?;
                Ok(serde_json::to_value(profiles)?)
            }
            "count" => Ok(json!(self.service.count(sender)?)),
            "removeClient" => {
                let p: ClientIdParams = parse(request)?;
                self.service.remove_client(sender, &p.client_id)?;
                Ok(Value::Null)
            }
            "updateClient" => {
                let p: UpdateClientParams = parse(request)?;
                self.service.update_client(sender, &p.profile)?;
                Ok(Value::Null)
            }
            "setPassword" => {
                let p: SetPasswordParams = parse(request)?;
                self.service
                    .set_client_password(sender, &p.client_id, &p.password)?;
                Ok(Value::Null)
            }
            other => Err(HubError::NotFound(format!(
                "authn/admin has no action '{other}'"
            ))),
        }
    }

    fn handle_user(&self, request: &RequestMessage) -> Result<Value, HubError> {
        let sender = request.sender_id.as_str();
        // refreshtoken arrives both as a session operation and as an action
        if request.operation == Operation::RefreshToken {
            let p: RefreshParams = parse(request)?;
            let token = self.service.refresh_token(sender, &p.token)?;
            return Ok(json!({ "token": token }));
        }
        match request.name.as_str() {
            "getProfile" => Ok(serde_json::to_value(self.service.get_profile(sender)?)?),
            "newToken" => {
                let p: PasswordParams = parse(request)?;
                let token = self.service.new_token(sender, &p.password)?;
                Ok(json!({ "token": token }))
            }
            "refreshToken" => {
                let p: RefreshParams = parse(request)?;
                let token = self.service.refresh_token(sender, &p.token)?;
                Ok(json!({ "token": token }))
            }
            "updateName" => {
                let p: NameParams = parse(request)?;
                self.service.update_name(sender, &p.display_name)?;
                Ok(Value::Null)
            }
            "updatePassword" => {
                let p: PasswordParams = parse(request)?;
                self.service.update_password(sender, &p.password)?;
                Ok(Value::Null)
            }
            "updatePubKey" => {
                let p: PubKeyParams = parse(request)?;
                self.service.update_public_key(sender, &p.public_key)?;
                Ok(Value::Null)
            }
            "logout" => {
                self.service.logout(sender);
                Ok(Value::Null)
            }
            other => Err(HubError::NotFound(format!(
                "authn/user has no action '{other}'"
            ))),
        }
    }
}

#[async_trait]
impl ServiceHandler for AuthnHandler {
    fn agent_id(&self) -> &str {
        AUTHN_AGENT_ID
    }

    fn self_authorizing(&self) -> bool {
        true
    }

    async fn handle_request(&self, request: &RequestMessage) -> ResponseMessage {
        let result = match request.thing_id.as_str() {
            ADMIN_THING_ID => self.handle_admin(request),
            USER_THING_ID => self.handle_user(request),
            other => Err(HubError::NotFound(format!("authn has no thing '{other}'"))),
        };
        match result {
            Ok(output) => ResponseMessage::completed(request, AUTHN_AGENT_ID, output),
            Err(err) => ResponseMessage::failed(request, AUTHN_AGENT_ID, &err),
        }
    }

    fn thing_descriptions(&self) -> Vec<ThingDescription> {
        let mut admin = ThingDescription::new(ADMIN_THING_ID, "Authentication administration");
        admin
            .add_action("addAgent", "Register an agent")
            .add_action("addService", "Register a service")
            .add_action("addConsumer", "Register a consumer")
            .add_action("getProfile", "Read a client profile")
            .add_action("getProfiles", "List client profiles")
            .add_action("count", "Count clients")
            .add_action("removeClient", "Remove a client")
            .add_action("updateClient", "Update a client profile")
            .add_action("setPassword", "Set a client password");

        let mut user = ThingDescription::new(USER_THING_ID, "Authentication self-service");
        user.add_action("getProfile", "Read own profile")
            .add_action("newToken", "Issue a token from a password")
            .add_action("refreshToken", "Refresh a valid token")
            .add_action("updateName", "Change display name")
            .add_action("updatePassword", "Change password")
            .add_action("updatePubKey", "Replace public key")
            .add_action("logout", "Close own connections");
        vec![admin, user]
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
struct AddAgentParams {
    agent_id: String,
    #[serde(default)]
    display_name: String,
    public_key: String,
}

#[derive(Deserialize)]
struct AddServiceParams {
    service_id: String,
    #[serde(default)]
    display_name: String,
    public_key: String,
}

#[derive(Deserialize)]
struct AddConsumerParams {
    client_id: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    public_key: Option<String>,
    #[serde(default)]
    role: String,
}

#[derive(Deserialize)]
struct ClientIdParams {
    client_id: String,
}

#[derive(Deserialize)]
struct UpdateClientParams {
    profile: ClientProfile,
}

#[derive(Deserialize)]
struct SetPasswordParams {
    client_id: String,
    password: String,
}

#[derive(Deserialize)]
struct PasswordParams {
    password: String,
}

#[derive(Deserialize)]
struct RefreshParams {
    token: String,
}

#[derive(Deserialize)]
struct NameParams {
    display_name: String,
}

#[derive(Deserialize)]
struct PubKeyParams {
    public_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeyKind, KeyPair};
    use crate::models::{ClientProfile, ClientType};
    use crate::password::HashAlgorithm;
    use crate::store::AuthnStore;
    use crate::token::{TokenIssuer, TokenValidity};
    use tempfile::tempdir;

    fn handler() -> (AuthnHandler, tempfile::TempDir) {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(
            AuthnStore::open(dir.path().join("authn.json"), HashAlgorithm::Argon2id)
                .expect("open"),
        );
        let signing = KeyPair::new_key(KeyKind::EcdsaP256);
        let issuer =
            Arc::new(TokenIssuer::new(&signing, TokenValidity::default()).expect("issuer"));
        store
            .add(&ClientProfile {
                role: "admin".to_string(),
                ..ClientProfile::new("admin1", ClientType::Service)
            })
            .expect("seed admin");
        let service = Arc::new(AuthnService::new(store, issuer));
        (AuthnHandler::new(service), dir)
    }

    fn invoke(thing: &str, name: &str, input: Value, sender: &str) -> RequestMessage {
        RequestMessage::new(Operation::InvokeAction, thing, name, input, sender)
            .with_correlation("c-1")
    }

    #[tokio::test]
    async fn add_consumer_and_self_service_round_trip() {
        let (handler, _dir) = handler();
        let pem = KeyPair::new_key(KeyKind::Ed25519)
            .export_public()
            .expect("pem");

        let resp = handler
            .handle_request(&invoke(
                "admin",
                "addConsumer",
                json!({"client_id": "alice", "display_name": "Alice",
                       "password": "hunter2hunter", "public_key": pem, "role": "viewer"}),
                "admin1",
            ))
            .await;
        assert!(!resp.is_failed(), "{:?}", resp.error);

        let resp = handler
            .handle_request(&invoke(
                "user",
                "newToken",
                json!({"password": "hunter2hunter"}),
                "alice",
            ))
            .await;
        assert!(!resp.is_failed());
        let token = resp.output["token"].as_str().expect("token").to_string();

        let resp = handler
            .handle_request(&invoke("user", "refreshToken", json!({"token": token}), "alice"))
            .await;
        assert!(!resp.is_failed());

        let resp = handler
            .handle_request(&invoke("user", "getProfile", Value::Null, "alice"))
            .await;
        assert_eq!(resp.output["client_id"], "alice");
        assert_eq!(resp.output["role"], "viewer");
    }

    #[tokio::test]
    async fn admin_actions_rejected_for_plain_consumers() {
        let (handler, _dir) = handler();
        let resp = handler
            .handle_request(&invoke("admin", "getProfiles", Value::Null, "nobody"))
            .await;
        assert!(resp.is_failed());
        assert_eq!(
            resp.error.as_ref().map(|e| e.kind.as_str()),
            Some("Forbidden")
        );
    }

    #[tokio::test]
    async fn unknown_thing_and_action_fail_cleanly() {
        let (handler, _dir) = handler();
        let resp = handler
            .handle_request(&invoke("nothing", "x", Value::Null, "admin1"))
            .await;
        assert!(resp.is_failed());

        let resp = handler
            .handle_request(&invoke("admin", "frobnicate", Value::Null, "admin1"))
            .await;
        assert!(resp.is_failed());
        assert_eq!(
            resp.error.as_ref().map(|e| e.kind.as_str()),
            Some("NotFound")
        );
    }
}
