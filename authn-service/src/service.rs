//! Administration and self-service operations on client identities.

use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use hub_core::HubError;

use crate::keys::KeyPair;
use crate::models::{AuthInfo, ClientProfile, ClientType};
use crate::store::AuthnStore;
use crate::token::TokenIssuer;

/// Default role for consumers added without one.
const DEFAULT_CONSUMER_ROLE: &str = "viewer";

/// Installed by the runtime; closes every live connection of a client.
pub type ConnectionCloser = Box<dyn Fn(&str) + Send + Sync>;

pub struct AuthnService {
    store: Arc<AuthnStore>,
    issuer: Arc<TokenIssuer>,
    connection_closer: RwLock<Option<ConnectionCloser>>,
}

impl AuthnService {
    pub fn new(store: Arc<AuthnStore>, issuer: Arc<TokenIssuer>) -> Self {
        Self {
            store,
            issuer,
            connection_closer: RwLock::new(None),
        }
    }

    /// Install the hook that force-closes a client's connections. Wired by
    /// the runtime once the transport manager exists.
    pub fn set_connection_closer(&self, closer: ConnectionCloser) {
        *self
            .connection_closer
            .write()
            .expect("closer lock poisoned") = Some(closer);
    }

    pub fn store(&self) -> &Arc<AuthnStore> {
        &self.store
    }

    pub fn issuer(&self) -> &Arc<TokenIssuer> {
        &self.issuer
    }

    fn close_connections(&self, client_id: &str) {
        if let Some(closer) = self
            .connection_closer
            .read()
            .expect("closer lock poisoned")
            .as_ref()
        {
            closer(client_id);
        }
    }

    /// Admin operations require the admin or service role.
    fn require_admin(&self, sender_id: &str) -> Result<(), HubError> {
        let profile = self
            .store
            .get_profile(sender_id)
            .map_err(|_| HubError::Forbidden(format!("unknown sender '{sender_id}'")))?;
        match profile.role.as_str() {
            "admin" | "service" => Ok(()),
            other => Err(HubError::Forbidden(format!(
                "sender '{sender_id}' with role '{other}' is not an administrator"
            ))),
        }
    }

    fn add_client(
        &self,
        profile: ClientProfile,
        password: Option<&str>,
    ) -> Result<Option<String>, HubError> {
        if self.store.get_profile(&profile.client_id).is_ok() {
            return Err(HubError::AlreadyExists(format!(
                "client '{}'",
                profile.client_id
            )));
        }
        if !profile.public_key.is_empty() {
            KeyPair::import_public(&profile.public_key)?;
        }
        self.store.add(&profile)?;
        if let Some(password) = password {
            self.store.set_password(&profile.client_id, password)?;
        }
        info!(client_id = %profile.client_id, client_type = %profile.client_type.as_str(),
            role = %profile.role, "client added");

        if profile.public_key.is_empty() {
            return Ok(None);
        }
        let token = self
            .issuer
            .create_token(&AuthInfo::from_profile(&profile), profile.token_validity_days)?;
        Ok(Some(token))
    }

    // --- admin operations ---

    /// Register an agent and issue its first token.
    pub fn add_agent(
        &self,
        sender_id: &str,
        agent_id: &str,
        display_name: &str,
        public_key_pem: &str,
    ) -> Result<String, HubError> {
        self.require_admin(sender_id)?;
        if public_key_pem.is_empty() {
            return Err(HubError::InvalidArgument(
                "agents require a public key".to_string(),
            ));
        }
        let profile = ClientProfile {
            display_name: display_name.to_string(),
            public_key: public_key_pem.to_string(),
            role: "agent".to_string(),
            ..ClientProfile::new(agent_id, ClientType::Agent)
        };
        self.add_client(profile, None)
            .map(|token| token.unwrap_or_default())
    }

    /// Register a service and issue its first token.
    pub fn add_service(
        &self,
        sender_id: &str,
        service_id: &str,
        display_name: &str,
        public_key_pem: &str,
    ) -> Result<String, HubError> {
        self.require_admin(sender_id)?;
        if public_key_pem.is_empty() {
            return Err(HubError::InvalidArgument(
                "services require a public key".to_string(),
            ));
        }
        let profile = ClientProfile {
            display_name: display_name.to_string(),
            public_key: public_key_pem.to_string(),
            role: "service".to_string(),
            ..ClientProfile::new(service_id, ClientType::Service)
        };
        self.add_client(profile, None)
            .map(|token| token.unwrap_or_default())
    }

    /// Register a consumer. A token is only issued when a public key is
    /// supplied; password-only consumers obtain tokens through `login`.
    pub fn add_consumer(
        &self,
        sender_id: &str,
        consumer_id: &str,
        display_name: &str,
        password: Option<&str>,
        public_key_pem: Option<&str>,
        role: &str,
    ) -> Result<Option<String>, HubError> {
        self.require_admin(sender_id)?;
        let role = if role.is_empty() {
            DEFAULT_CONSUMER_ROLE
        } else {
            role
        };
        let profile = ClientProfile {
            display_name: display_name.to_string(),
            public_key: public_key_pem.unwrap_or_default().to_string(),
            role: role.to_string(),
            ..ClientProfile::new(consumer_id, ClientType::Consumer)
        };
        self.add_client(profile, password)
    }

    pub fn get_client_profile(
        &self,
        sender_id: &str,
        client_id: &str,
    ) -> Result<ClientProfile, HubError> {
        self.require_admin(sender_id)?;
        self.store.get_profile(client_id)
    }

    pub fn get_profiles(&self, sender_id: &str) -> Result<Vec<ClientProfile>, HubError> {
        self.require_admin(sender_id)?;
        Ok(self.store.list_profiles())
    }

    pub fn count(&self, sender_id: &str) -> Result<usize, HubError> {
        self.require_admin(sender_id)?;
        Ok(self.store.count())
    }

    pub fn remove_client(&self, sender_id: &str, client_id: &str) -> Result<(), HubError> {
        self.require_admin(sender_id)?;
        self.store.remove(client_id)?;
        self.close_connections(client_id);
        info!(client_id, "client removed");
        Ok(())
    }

    /// Replace an existing client's profile.
    pub fn update_client(
        &self,
        sender_id: &str,
        profile: &ClientProfile,
    ) -> Result<(), HubError> {
        self.require_admin(sender_id)?;
        // must already exist; add_* is the path for new clients
        self.store.get_profile(&profile.client_id)?;
        if !profile.public_key.is_empty() {
            KeyPair::import_public(&profile.public_key)?;
        }
        self.store.add(profile)
    }

    pub fn set_client_password(
        &self,
        sender_id: &str,
        client_id: &str,
        new_password: &str,
    ) -> Result<(), HubError> {
        self.require_admin(sender_id)?;
        self.store.set_password(client_id, new_password)
    }

    // --- user operations, scoped to the authenticated sender ---

    pub fn get_profile(&self, client_id: &str) -> Result<ClientProfile, HubError> {
        self.store.get_profile(client_id)
    }

    /// Issue a fresh token against the current password. Requires a public
    /// key on file, since tokens bind the subject key.
    pub fn new_token(&self, client_id: &str, password: &str) -> Result<String, HubError> {
        let profile = self.store.verify_password(client_id, password)?;
        if profile.public_key.is_empty() {
            return Err(HubError::InvalidArgument(format!(
                "client '{client_id}' has no public key on file"
            )));
        }
        self.issuer
            .create_token(&AuthInfo::from_profile(&profile), profile.token_validity_days)
    }

    /// Reissue a token on proof of a current, still-valid one.
    pub fn refresh_token(&self, client_id: &str, old_token: &str) -> Result<String, HubError> {
        self.issuer
            .validate_token(client_id, old_token, None, None)?;
        // reissue from the stored profile so role and key changes take effect
        let profile = self.store.get_profile(client_id)?;
        if profile.public_key.is_empty() {
            return Err(HubError::InvalidArgument(format!(
                "client '{client_id}' has no public key on file"
            )));
        }
        self.issuer
            .create_token(&AuthInfo::from_profile(&profile), profile.token_validity_days)
    }

    pub fn update_name(&self, client_id: &str, new_name: &str) -> Result<(), HubError> {
        self.store.set_display_name(client_id, new_name)
    }

    pub fn update_password(&self, client_id: &str, new_password: &str) -> Result<(), HubError> {
        self.store.set_password(client_id, new_password)
    }

    /// Replace the client's public key.
    ///
    /// Takes effect immediately: existing connections are forced closed and
    /// the client must reconnect with a token bound to the new key.
    pub fn update_public_key(
        &self,
        client_id: &str,
        public_key_pem: &str,
    ) -> Result<(), HubError> {
        KeyPair::import_public(public_key_pem)?;
        self.store.set_public_key(client_id, public_key_pem)?;
        warn!(client_id, "public key changed; closing existing connections");
        self.close_connections(client_id);
        Ok(())
    }

    /// Tokens are stateless, so logout just drops the client's connections.
    pub fn logout(&self, client_id: &str) {
        self.close_connections(client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyKind;
    use crate::password::HashAlgorithm;
    use crate::token::TokenValidity;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct Fixture {
        service: AuthnService,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(
            AuthnStore::open(dir.path().join("authn.json"), HashAlgorithm::Argon2id)
                .expect("open"),
        );
        let signing = KeyPair::new_key(KeyKind::EcdsaP256);
        let issuer =
            Arc::new(TokenIssuer::new(&signing, TokenValidity::default()).expect("issuer"));
        let service = AuthnService::new(store.clone(), issuer);

        // seed the administrator
        let admin = ClientProfile {
            role: "admin".to_string(),
            ..ClientProfile::new("admin1", ClientType::Service)
        };
        store.add(&admin).expect("seed admin");
        Fixture { service, _dir: dir }
    }

    fn client_key_pem() -> String {
        KeyPair::new_key(KeyKind::Ed25519)
            .export_public()
            .expect("pem")
    }

    #[test]
    fn add_agent_issues_token() {
        let fx = fixture();
        let token = fx
            .service
            .add_agent("admin1", "a1", "Test agent", &client_key_pem())
            .expect("add agent");
        assert!(!token.is_empty());
        assert_eq!(fx.service.get_profile("a1").expect("profile").role, "agent");
    }

    #[test]
    fn duplicate_add_fails_with_already_exists() {
        let fx = fixture();
        fx.service
            .add_agent("admin1", "a1", "Test agent", &client_key_pem())
            .expect("add agent");
        let err = fx
            .service
            .add_agent("admin1", "a1", "Test agent", &client_key_pem())
            .expect_err("must fail");
        assert_eq!(err.kind(), "AlreadyExists");
    }

    #[test]
    fn non_admin_sender_is_forbidden() {
        let fx = fixture();
        fx.service
            .add_consumer("admin1", "eve", "Eve", None, Some(&client_key_pem()), "viewer")
            .expect("add consumer");
        let err = fx
            .service
            .add_agent("eve", "a2", "Sneaky", &client_key_pem())
            .expect_err("must fail");
        assert_eq!(err.kind(), "Forbidden");
    }

    #[test]
    fn password_login_and_refresh_flow() {
        let fx = fixture();
        fx.service
            .add_consumer(
                "admin1",
                "alice",
                "Alice",
                Some("hunter2hunter"),
                Some(&client_key_pem()),
                "viewer",
            )
            .expect("add consumer");

        let token = fx
            .service
            .new_token("alice", "hunter2hunter")
            .expect("new token");
        let refreshed = fx.service.refresh_token("alice", &token).expect("refresh");
        assert!(!refreshed.is_empty());

        let err = fx
            .service
            .new_token("alice", "wrong-password")
            .expect_err("must fail");
        assert_eq!(err.kind(), "InvalidCredentials");
    }

    #[test]
    fn password_only_consumer_gets_no_token() {
        let fx = fixture();
        let token = fx
            .service
            .add_consumer("admin1", "bob", "Bob", Some("hunter2hunter"), None, "viewer")
            .expect("add consumer");
        assert!(token.is_none());

        let err = fx
            .service
            .new_token("bob", "hunter2hunter")
            .expect_err("must fail");
        assert_eq!(err.kind(), "InvalidArgument");
    }

    #[test]
    fn update_public_key_closes_connections() {
        let fx = fixture();
        fx.service
            .add_consumer("admin1", "alice", "Alice", None, Some(&client_key_pem()), "viewer")
            .expect("add consumer");

        let closed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = closed.clone();
        fx.service.set_connection_closer(Box::new(move |client_id| {
            sink.lock().expect("lock").push(client_id.to_string());
        }));

        fx.service
            .update_public_key("alice", &client_key_pem())
            .expect("update key");
        assert_eq!(closed.lock().expect("lock").as_slice(), ["alice"]);
    }
}
