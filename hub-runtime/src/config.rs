//! Runtime configuration.
//!
//! Loaded from `hiveot.toml` in the working directory, overridable with
//! `HIVEOT__`-prefixed environment variables (`HIVEOT__HTTP__LISTEN_ADDR=...`).

use std::path::PathBuf;

use serde::Deserialize;

use authn_service::{HashAlgorithm, KeyKind, TokenValidity};
use hub_core::HubError;

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Directory holding all persisted state.
    #[serde(default = "default_stores_dir")]
    pub stores_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
    /// Append one log line per routed request.
    #[serde(default)]
    pub request_log: bool,
    /// Append one log line per routed notification.
    #[serde(default)]
    pub notification_log: bool,
    #[serde(default)]
    pub password_algorithm: HashAlgorithm,
    #[serde(default = "default_signing_key_kind")]
    pub signing_key_kind: KeyKind,
    #[serde(default = "default_token_validity")]
    pub token_validity: TokenValidity,
    /// Deadline for forwarded requests, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_actions_per_thing")]
    pub max_actions_per_thing: usize,
    /// Administrator client created on first start.
    #[serde(default = "default_admin_client_id")]
    pub admin_client_id: String,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Base URL advertised in rewritten TD Forms.
    #[serde(default = "default_public_url")]
    pub public_url: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            listen_addr: default_listen_addr(),
            public_url: default_public_url(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stores_dir: default_stores_dir(),
            log_level: default_log_level(),
            log_json: false,
            request_log: false,
            notification_log: false,
            password_algorithm: HashAlgorithm::default(),
            signing_key_kind: default_signing_key_kind(),
            token_validity: default_token_validity(),
            request_timeout_ms: default_request_timeout_ms(),
            max_actions_per_thing: default_max_actions_per_thing(),
            admin_client_id: default_admin_client_id(),
            http: HttpConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn load() -> Result<Self, HubError> {
        hub_core::config::load("hiveot")
    }

    pub fn authn_dir(&self) -> PathBuf {
        self.stores_dir.join("authn")
    }

    pub fn authz_dir(&self) -> PathBuf {
        self.stores_dir.join("authz")
    }

    pub fn password_file(&self) -> PathBuf {
        self.authn_dir().join("hub.passwd")
    }

    pub fn signing_key_file(&self) -> PathBuf {
        self.authn_dir().join("hub.key")
    }

    pub fn signing_pub_file(&self) -> PathBuf {
        self.authn_dir().join("hub.pub")
    }

    pub fn acl_file(&self) -> PathBuf {
        self.authz_dir().join("authz.acl")
    }

    pub fn admin_key_file(&self) -> PathBuf {
        self.authn_dir().join(format!("{}.key", self.admin_client_id))
    }

    pub fn admin_pub_file(&self) -> PathBuf {
        self.authn_dir().join(format!("{}.pub", self.admin_client_id))
    }

    pub fn admin_token_file(&self) -> PathBuf {
        self.authn_dir()
            .join(format!("{}.token", self.admin_client_id))
    }
}

fn default_stores_dir() -> PathBuf {
    PathBuf::from("stores")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_signing_key_kind() -> KeyKind {
    KeyKind::EcdsaP256
}

fn default_token_validity() -> TokenValidity {
    TokenValidity::default()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_actions_per_thing() -> usize {
    100
}

fn default_admin_client_id() -> String {
    "launcher".to_string()
}

fn default_true() -> bool {
    true
}

fn default_listen_addr() -> String {
    "127.0.0.1:8444".to_string()
}

fn default_public_url() -> String {
    "https://127.0.0.1:8444".to_string()
}
