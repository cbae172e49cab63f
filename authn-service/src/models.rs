//! Client identity model.

use hub_core::{now_ms, HubError};
use serde::{Deserialize, Serialize};

/// What kind of client a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    /// Owns and publishes Things; typically a device binding.
    Agent,
    /// Long-running client that both owns Things and uses others.
    Service,
    /// Uses Things: humans, UIs, scripts.
    Consumer,
}

impl ClientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientType::Agent => "agent",
            ClientType::Service => "service",
            ClientType::Consumer => "consumer",
        }
    }

    /// Default token validity when the record does not override it.
    pub fn default_validity_days(&self) -> u32 {
        match self {
            ClientType::Agent => 90,
            ClientType::Service => 365,
            ClientType::Consumer => 30,
        }
    }
}

/// The full stored identity of a client, password hash included.
/// Only the [`crate::AuthnStore`] holds these; everything that leaves the
/// store is a [`ClientProfile`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    pub client_id: String,
    pub client_type: ClientType,
    #[serde(default)]
    pub display_name: String,
    /// PEM encoded public key; empty for password-only consumers.
    #[serde(default)]
    pub public_key: String,
    /// Encoded password hash; empty if key-only.
    #[serde(default)]
    pub password_hash: String,
    #[serde(default)]
    pub role: String,
    /// 0 means use the default for the client type.
    #[serde(default)]
    pub token_validity_days: u32,
    pub updated_ms: i64,
}

impl ClientRecord {
    pub fn new(client_id: impl Into<String>, client_type: ClientType) -> Self {
        Self {
            client_id: client_id.into(),
            client_type,
            display_name: String::new(),
            public_key: String::new(),
            password_hash: String::new(),
            role: String::new(),
            token_validity_days: 0,
            updated_ms: now_ms(),
        }
    }

    /// A record with neither a password hash nor a public key exists only
    /// for role assignment and cannot authenticate.
    pub fn can_authenticate(&self) -> bool {
        !self.password_hash.is_empty() || !self.public_key.is_empty()
    }

    pub fn profile(&self) -> ClientProfile {
        ClientProfile {
            client_id: self.client_id.clone(),
            client_type: self.client_type,
            display_name: self.display_name.clone(),
            public_key: self.public_key.clone(),
            role: self.role.clone(),
            token_validity_days: self.token_validity_days,
            updated_ms: self.updated_ms,
        }
    }
}

/// A client's public profile: the record without its password hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientProfile {
    pub client_id: String,
    pub client_type: ClientType,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub token_validity_days: u32,
    #[serde(default)]
    pub updated_ms: i64,
}

impl ClientProfile {
    pub fn new(client_id: impl Into<String>, client_type: ClientType) -> Self {
        Self {
            client_id: client_id.into(),
            client_type,
            display_name: String::new(),
            public_key: String::new(),
            role: String::new(),
            token_validity_days: 0,
            updated_ms: 0,
        }
    }
}

/// Authenticated sender snapshot a validated token resolves to.
/// Trusted by the caller for the lifetime of one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthInfo {
    pub client_id: String,
    pub client_type: ClientType,
    pub role: String,
    pub public_key: String,
}

impl AuthInfo {
    pub fn from_profile(profile: &ClientProfile) -> Self {
        Self {
            client_id: profile.client_id.clone(),
            client_type: profile.client_type,
            role: profile.role.clone(),
            public_key: profile.public_key.clone(),
        }
    }

    /// All of client id, client type, role and public key are required to
    /// issue a token.
    pub fn validate_for_token(&self) -> Result<(), HubError> {
        if self.client_id.is_empty() {
            return Err(HubError::InvalidArgument("client id is empty".to_string()));
        }
        if self.role.is_empty() {
            return Err(HubError::InvalidArgument(format!(
                "client '{}' has no role",
                self.client_id
            )));
        }
        if self.public_key.is_empty() {
            return Err(HubError::InvalidArgument(format!(
                "client '{}' has no public key",
                self.client_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_validity_per_type() {
        assert_eq!(ClientType::Agent.default_validity_days(), 90);
        assert_eq!(ClientType::Service.default_validity_days(), 365);
        assert_eq!(ClientType::Consumer.default_validity_days(), 30);
    }

    #[test]
    fn profile_strips_password_hash() {
        let mut record = ClientRecord::new("alice", ClientType::Consumer);
        record.password_hash = "$argon2id$secret".to_string();
        let encoded = serde_json::to_string(&record.profile()).expect("encode");
        assert!(!encoded.contains("argon2id"));
    }

    #[test]
    fn role_only_records_cannot_authenticate() {
        let record = ClientRecord::new("ghost", ClientType::Consumer);
        assert!(!record.can_authenticate());
    }
}
