//! Runtime assembly.
//!
//! Owns every component as a value, wires the callback cycle between router
//! and transport manager in two phases, and drives startup and shutdown.

use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use authn_service::{
    AuthInfo, AuthnHandler, AuthnService, AuthnStore, ClientProfile, ClientType, KeyKind,
    KeyPair, TokenIssuer,
};
use authz_service::{AuthzHandler, AuthzService};
use digitwin_service::directory::DIGITWIN_AGENT_ID;
use digitwin_service::{DigitwinDirectory, DigitwinHandler, ValueStore};
use hub_core::{HubError, ServiceHandler};

use crate::config::RuntimeConfig;
use crate::router::Router;
use crate::session::HubSessionAuth;
use crate::transport::embedded::EmbeddedTransport;
use crate::transport::http_sse::HttpSseTransport;
use crate::transport::manager::TransportManager;
use crate::transport::SessionAuth;

pub struct Runtime {
    config: RuntimeConfig,
    store: Arc<AuthnStore>,
    issuer: Arc<TokenIssuer>,
    authn: Arc<AuthnService>,
    authz: Arc<AuthzService>,
    directory: Arc<DigitwinDirectory>,
    values: Arc<ValueStore>,
    router: Arc<Router>,
    manager: Arc<TransportManager>,
    embedded: Arc<EmbeddedTransport>,
    cancel: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    /// Build and wire every component. Fatal errors here (unreadable
    /// signing key, unparseable password file) abort startup.
    pub fn new(config: RuntimeConfig) -> Result<Self, HubError> {
        fs::create_dir_all(config.authn_dir())?;
        fs::create_dir_all(config.authz_dir())?;

        let signing_key = if config.signing_key_file().exists() {
            KeyPair::load_from_file(&config.signing_key_file())?
        } else {
            let key = KeyPair::new_key(config.signing_key_kind);
            key.save_to_file(&config.signing_key_file())?;
            key.save_public_to_file(&config.signing_pub_file())?;
            info!(path = %config.signing_key_file().display(), "signing key generated");
            key
        };

        let store = Arc::new(AuthnStore::open(
            config.password_file(),
            config.password_algorithm,
        )?);
        let issuer = Arc::new(TokenIssuer::new(&signing_key, config.token_validity)?);
        let authn = Arc::new(AuthnService::new(store.clone(), issuer.clone()));
        let authz = Arc::new(AuthzService::open(store.clone(), Some(config.acl_file()))?);
        let directory = Arc::new(DigitwinDirectory::new());
        let values = Arc::new(ValueStore::new(config.max_actions_per_thing));

        bootstrap_admin(&config, &store, &issuer)?;

        let handlers: Vec<Arc<dyn ServiceHandler>> = vec![
            Arc::new(AuthnHandler::new(authn.clone())),
            Arc::new(AuthzHandler::new(authz.clone())),
            Arc::new(DigitwinHandler::new(
                directory.clone(),
                values.clone(),
                authz.clone(),
                store.clone(),
            )),
        ];
        let router = Router::new(
            store.clone(),
            authz.clone(),
            directory.clone(),
            values.clone(),
            handlers,
            Duration::from_millis(config.request_timeout_ms),
            config.request_log,
            config.notification_log,
        );

        // phase two: the transport manager is installed into the router,
        // transports get the router's handlers and the session authenticator
        let manager = TransportManager::new();
        router.install_transport_manager(manager.clone());

        let session_auth: Arc<dyn SessionAuth> = HubSessionAuth::new(authn.clone());
        let embedded =
            EmbeddedTransport::new(router.clone(), manager.clone(), session_auth.clone());
        manager.add_transport(embedded.clone());
        if config.http.enabled {
            manager.add_transport(HttpSseTransport::new(
                router.clone(),
                manager.clone(),
                session_auth,
                &config.http.listen_addr,
                &config.http.public_url,
            ));
        }

        directory.set_forms_hook(manager.forms_hook());
        {
            let router = router.clone();
            directory.set_event_sink(Box::new(move |notification| {
                let router = router.clone();
                tokio::spawn(async move {
                    router
                        .handle_notification(notification, DIGITWIN_AGENT_ID)
                        .await;
                });
            }));
        }
        {
            let manager = manager.clone();
            authn.set_connection_closer(Box::new(move |client_id| {
                manager.close_client_connections(client_id);
            }));
        }

        Ok(Self {
            config,
            store,
            issuer,
            authn,
            authz,
            directory,
            values,
            router,
            manager,
            embedded,
            cancel: CancellationToken::new(),
            watcher: Mutex::new(None),
        })
    }

    /// Start the watcher, publish the built-in service TDs and bring the
    /// transports up.
    pub async fn start(&self) -> Result<(), HubError> {
        *self.watcher.lock().expect("watcher lock poisoned") =
            Some(self.store.spawn_watcher(self.cancel.child_token()));

        for handler in self.router.service_handlers() {
            for td in handler.thing_descriptions() {
                self.directory
                    .update_td(handler.agent_id(), serde_json::to_value(&td)?)?;
            }
        }

        self.manager.start_transports().await?;
        info!("hub runtime started");
        Ok(())
    }

    /// Stop transports, drain in-flight requests as timed out, stop the
    /// watcher.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.manager.stop_transports().await;
        self.router.drain_pending().await;
        let handle = self.watcher.lock().expect("watcher lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("hub runtime stopped");
    }

    /// Issue a token for an existing client with a public key on file.
    /// Administrative shortcut used by the launcher and the test harnesses.
    pub fn issue_token(&self, client_id: &str) -> Result<String, HubError> {
        let profile = self.store.get_profile(client_id)?;
        self.issuer
            .create_token(&AuthInfo::from_profile(&profile), profile.token_validity_days)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn embedded(&self) -> &Arc<EmbeddedTransport> {
        &self.embedded
    }

    pub fn store(&self) -> &Arc<AuthnStore> {
        &self.store
    }

    pub fn authn(&self) -> &Arc<AuthnService> {
        &self.authn
    }

    pub fn authz(&self) -> &Arc<AuthzService> {
        &self.authz
    }

    pub fn directory(&self) -> &Arc<DigitwinDirectory> {
        &self.directory
    }

    pub fn values(&self) -> &Arc<ValueStore> {
        &self.values
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn transport_manager(&self) -> &Arc<TransportManager> {
        &self.manager
    }
}

/// First start creates the administrator the hub is managed through, with a
/// generated key pair and a bootstrap token on disk.
fn bootstrap_admin(
    config: &RuntimeConfig,
    store: &Arc<AuthnStore>,
    issuer: &Arc<TokenIssuer>,
) -> Result<(), HubError> {
    if store.get_profile(&config.admin_client_id).is_ok() {
        return Ok(());
    }

    let key = KeyPair::new_key(KeyKind::Ed25519);
    key.save_to_file(&config.admin_key_file())?;
    key.save_public_to_file(&config.admin_pub_file())?;

    let profile = ClientProfile {
        display_name: "Hub launcher".to_string(),
        public_key: key.export_public()?,
        role: "admin".to_string(),
        ..ClientProfile::new(&config.admin_client_id, ClientType::Service)
    };
    store.add(&profile)?;

    let token = issuer.create_token(&AuthInfo::from_profile(&profile), 0)?;
    fs::write(config.admin_token_file(), token)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(
            config.admin_token_file(),
            fs::Permissions::from_mode(0o600),
        )?;
    }
    info!(client_id = %config.admin_client_id, "administrator bootstrapped");
    Ok(())
}
