//! Connect-time authentication for transports.

use std::sync::Arc;

use authn_service::{AuthInfo, AuthnService};
use hub_core::HubError;

use crate::transport::SessionAuth;

/// The runtime's [`SessionAuth`]: delegates to the client store and the
/// token issuer owned by the authentication service.
pub struct HubSessionAuth {
    authn: Arc<AuthnService>,
}

impl HubSessionAuth {
    pub fn new(authn: Arc<AuthnService>) -> Arc<Self> {
        Arc::new(Self { authn })
    }
}

impl SessionAuth for HubSessionAuth {
    fn authenticate_token(
        &self,
        client_id: &str,
        token: &str,
        nonce: Option<&str>,
        signed_nonce: Option<&str>,
    ) -> Result<AuthInfo, HubError> {
        if client_id.is_empty() {
            // bearer-style transport: the token's own claim is the identity
            return self.authn.issuer().validate_bearer(token);
        }
        self.authn
            .issuer()
            .validate_token(client_id, token, signed_nonce, nonce)
    }

    fn login_with_password(&self, client_id: &str, password: &str) -> Result<String, HubError> {
        self.authn.new_token(client_id, password)
    }

    fn refresh_token(&self, client_id: &str, token: &str) -> Result<String, HubError> {
        self.authn.refresh_token(client_id, token)
    }
}
