//! Shared harness for the cross-crate workflow tests: an assembled hub
//! runtime on temporary stores, driven through the embedded transport.

use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use authn_service::{KeyKind, KeyPair};
use hub_core::{Operation, RequestMessage, ResponseMessage};
use hub_runtime::config::HttpConfig;
use hub_runtime::{EmbeddedClient, Runtime, RuntimeConfig};

/// A running hub on temporary storage; dropped state disappears with it.
pub struct TestHub {
    pub runtime: Runtime,
    _dir: TempDir,
}

impl TestHub {
    /// Assemble and start a hub with the embedded transport only.
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    /// Same, with a configuration tweak applied before startup.
    pub async fn start_with(tweak: impl FnOnce(&mut RuntimeConfig)) -> Self {
        hub_core::observability::try_init_tracing("info");
        let dir = TempDir::new().expect("tempdir");
        let mut config = RuntimeConfig {
            stores_dir: dir.path().to_path_buf(),
            http: HttpConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        };
        tweak(&mut config);
        let runtime = Runtime::new(config).expect("assemble runtime");
        runtime.start().await.expect("start runtime");
        Self { runtime, _dir: dir }
    }

    /// Connect the bootstrap administrator.
    pub fn admin(&self) -> EmbeddedClient {
        let token = self.runtime.issue_token("launcher").expect("admin token");
        self.runtime
            .embedded()
            .connect("launcher", &token)
            .expect("admin connect")
    }

    /// Connect any provisioned client by issuing it a fresh token.
    pub fn connect(&self, client_id: &str) -> EmbeddedClient {
        let token = self.runtime.issue_token(client_id).expect("token");
        self.runtime
            .embedded()
            .connect(client_id, &token)
            .expect("connect")
    }
}

/// A generated client key pair with its public PEM.
pub fn fresh_key() -> (KeyPair, String) {
    let key = KeyPair::new_key(KeyKind::Ed25519);
    let pem = key.export_public().expect("public pem");
    (key, pem)
}

/// Invoke an action on a Thing through a connected client and return the
/// immediate response.
pub async fn invoke(
    client: &EmbeddedClient,
    dthing_id: &str,
    name: &str,
    input: Value,
) -> ResponseMessage {
    let request = RequestMessage::new(Operation::InvokeAction, dthing_id, name, input, "");
    client.send_request(request).await
}

/// Register a consumer with a password, public key and role via the
/// administration Thing.
pub async fn add_consumer(
    admin: &EmbeddedClient,
    client_id: &str,
    password: &str,
    public_key_pem: &str,
    role: &str,
) {
    let response = invoke(
        admin,
        "dtw:authn:admin",
        "addConsumer",
        json!({
            "client_id": client_id,
            "display_name": client_id,
            "password": password,
            "public_key": public_key_pem,
            "role": role,
        }),
    )
    .await;
    assert!(!response.is_failed(), "addConsumer failed: {:?}", response.error);
}

/// Register an agent via the administration Thing, returning its token.
pub async fn add_agent(admin: &EmbeddedClient, agent_id: &str, public_key_pem: &str) -> String {
    let response = invoke(
        admin,
        "dtw:authn:admin",
        "addAgent",
        json!({
            "agent_id": agent_id,
            "display_name": agent_id,
            "public_key": public_key_pem,
        }),
    )
    .await;
    assert!(!response.is_failed(), "addAgent failed: {:?}", response.error);
    response.output["token"].as_str().expect("token").to_string()
}

/// Default window to wait for an asynchronous delivery in tests.
pub const DELIVERY_WINDOW: Duration = Duration::from_secs(2);
