//! Connection tracking and notification fan-out across all transports.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use hub_core::td::FormsHook;
use hub_core::{Form, HubError, NotificationMessage};

use super::{Connection, Transport};

/// Owns every live [`Connection`] and the set of running transports.
/// Everything else refers to clients by id only.
#[derive(Default)]
pub struct TransportManager {
    connections: RwLock<HashMap<String, Arc<dyn Connection>>>,
    /// client id -> connection ids, insertion ordered
    by_client: RwLock<HashMap<String, Vec<String>>>,
    transports: RwLock<Vec<Arc<dyn Transport>>>,
}

impl TransportManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_transport(&self, transport: Arc<dyn Transport>) {
        self.transports
            .write()
            .expect("transports lock poisoned")
            .push(transport);
    }

    pub async fn start_transports(&self) -> Result<(), HubError> {
        let transports: Vec<_> = self
            .transports
            .read()
            .expect("transports lock poisoned")
            .clone();
        for transport in transports {
            transport.start().await?;
            info!(protocol = transport.protocol(), "transport started");
        }
        Ok(())
    }

    pub async fn stop_transports(&self) {
        let transports: Vec<_> = self
            .transports
            .read()
            .expect("transports lock poisoned")
            .clone();
        for transport in transports {
            transport.stop().await;
        }
        self.close_all_connections();
    }

    /// Register a connection after a successful handshake.
    pub fn add_connection(&self, connection: Arc<dyn Connection>) {
        let connection_id = connection.connection_id().to_string();
        let client_id = connection.client_id().to_string();
        debug!(client_id, connection_id, protocol = connection.protocol(),
            "connection added");
        self.connections
            .write()
            .expect("connections lock poisoned")
            .insert(connection_id.clone(), connection);
        self.by_client
            .write()
            .expect("connections lock poisoned")
            .entry(client_id)
            .or_default()
            .push(connection_id);
    }

    /// Drop a connection on disconnect. Safe to call twice.
    pub fn remove_connection(&self, connection_id: &str) {
        let removed = self
            .connections
            .write()
            .expect("connections lock poisoned")
            .remove(connection_id);
        if let Some(connection) = removed {
            let mut by_client = self.by_client.write().expect("connections lock poisoned");
            if let Some(ids) = by_client.get_mut(connection.client_id()) {
                ids.retain(|id| id != connection_id);
                if ids.is_empty() {
                    by_client.remove(connection.client_id());
                }
            }
            debug!(client_id = connection.client_id(), connection_id, "connection removed");
        }
    }

    pub fn get_connection(&self, connection_id: &str) -> Option<Arc<dyn Connection>> {
        self.connections
            .read()
            .expect("connections lock poisoned")
            .get(connection_id)
            .cloned()
    }

    /// Any live connection of the client; the most recent one wins so a
    /// reconnecting agent takes over from its stale session.
    pub fn get_connection_by_client_id(&self, client_id: &str) -> Option<Arc<dyn Connection>> {
        let by_client = self.by_client.read().expect("connections lock poisoned");
        let connection_id = by_client.get(client_id)?.last()?;
        self.connections
            .read()
            .expect("connections lock poisoned")
            .get(connection_id)
            .cloned()
    }

    /// Force-close every connection of a client (key rotation, removal).
    pub fn close_client_connections(&self, client_id: &str) {
        let ids: Vec<String> = self
            .by_client
            .read()
            .expect("connections lock poisoned")
            .get(client_id)
            .cloned()
            .unwrap_or_default();
        if !ids.is_empty() {
            warn!(client_id, connections = ids.len(), "force-closing client connections");
        }
        for id in ids {
            if let Some(connection) = self.get_connection(&id) {
                connection.close();
            }
            self.remove_connection(&id);
        }
    }

    pub fn close_all_connections(&self) {
        let ids: Vec<String> = self
            .connections
            .read()
            .expect("connections lock poisoned")
            .keys()
            .cloned()
            .collect();
        for id in ids {
            if let Some(connection) = self.get_connection(&id) {
                connection.close();
            }
            self.remove_connection(&id);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .read()
            .expect("connections lock poisoned")
            .len()
    }

    /// Fan a notification out to every subscribed connection, once each.
    /// A failed delivery is the subscriber's problem, not the caller's.
    pub async fn send_notification(&self, notification: &NotificationMessage) {
        let targets: Vec<Arc<dyn Connection>> = {
            let connections = self.connections.read().expect("connections lock poisoned");
            connections
                .values()
                .filter(|c| c.subscriptions().matches(notification))
                .cloned()
                .collect()
        };
        for connection in targets {
            if let Err(e) = connection.send_notification(notification.clone()).await {
                debug!(client_id = connection.client_id(),
                    connection_id = connection.connection_id(), error = %e,
                    "notification delivery failed");
            }
        }
    }

    /// Build the directory's form factory from the first transport able to
    /// produce externally addressable Forms.
    pub fn forms_hook(self: &Arc<Self>) -> FormsHook {
        let manager = Arc::clone(self);
        Arc::new(move |operation: &str, dthing_id: &str, name: &str| -> Form {
            let transports = manager
                .transports
                .read()
                .expect("transports lock poisoned")
                .clone();
            transports
                .iter()
                .find_map(|t| t.form_for(operation, dthing_id, name))
                .unwrap_or_else(|| Form::new(operation, format!("urn:hiveot:{dthing_id}")))
        })
    }
}
