//! In-process transport.
//!
//! Agents and consumers running inside the hub process (built-in services,
//! plugins, the integration tests) connect here: no wire, no serialization,
//! just a channel per connection. Authentication is the same token check
//! every other transport performs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use hub_core::{HubError, NotificationMessage, RequestMessage, ResponseMessage};

use crate::router::Router;
use crate::transport::manager::TransportManager;
use crate::transport::{Connection, SessionAuth, Subscriptions, Transport};

/// Messages delivered to an embedded client.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// A request forwarded to this client in its role as agent.
    Request(RequestMessage),
    /// A correlated reply to a request this client sent.
    Response(ResponseMessage),
    /// A subscribed notification.
    Notification(NotificationMessage),
}

const CHANNEL_CAPACITY: usize = 64;

pub struct EmbeddedTransport {
    router: Arc<Router>,
    manager: Arc<TransportManager>,
    auth: Arc<dyn SessionAuth>,
}

impl EmbeddedTransport {
    pub fn new(
        router: Arc<Router>,
        manager: Arc<TransportManager>,
        auth: Arc<dyn SessionAuth>,
    ) -> Arc<Self> {
        Arc::new(Self {
            router,
            manager,
            auth,
        })
    }

    /// Authenticate with a token and open an in-process connection.
    pub fn connect(&self, client_id: &str, token: &str) -> Result<EmbeddedClient, HubError> {
        let auth = self.auth.authenticate_token(client_id, token, None, None)?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let connection = Arc::new(EmbeddedConnection {
            connection_id: Uuid::new_v4().to_string(),
            client_id: auth.client_id.clone(),
            tx,
            subscriptions: Subscriptions::default(),
            closed: AtomicBool::new(false),
        });
        self.manager.add_connection(connection.clone());
        Ok(EmbeddedClient {
            connection,
            rx,
            router: Arc::clone(&self.router),
            manager: Arc::clone(&self.manager),
        })
    }

    /// Password login followed by a token connect, as a convenience for
    /// in-process consumers.
    pub fn connect_with_password(
        &self,
        client_id: &str,
        password: &str,
    ) -> Result<(EmbeddedClient, String), HubError> {
        let token = self.auth.login_with_password(client_id, password)?;
        let client = self.connect(client_id, &token)?;
        Ok((client, token))
    }
}

#[async_trait]
impl Transport for EmbeddedTransport {
    fn protocol(&self) -> &'static str {
        "embedded"
    }

    async fn start(&self) -> Result<(), HubError> {
        Ok(())
    }

    async fn stop(&self) {}
}

struct EmbeddedConnection {
    connection_id: String,
    client_id: String,
    tx: mpsc::Sender<ClientMessage>,
    subscriptions: Subscriptions,
    closed: AtomicBool,
}

impl EmbeddedConnection {
    async fn deliver(&self, message: ClientMessage) -> Result<(), HubError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HubError::DeliveryFailed(format!(
                "connection '{}' is closed",
                self.connection_id
            )));
        }
        self.tx
            .send(message)
            .await
            .map_err(|_| HubError::DeliveryFailed(format!("client '{}' gone", self.client_id)))
    }
}

#[async_trait]
impl Connection for EmbeddedConnection {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn protocol(&self) -> &'static str {
        "embedded"
    }

    async fn send_request(&self, request: RequestMessage) -> Result<(), HubError> {
        self.deliver(ClientMessage::Request(request)).await
    }

    async fn send_response(&self, response: ResponseMessage) -> Result<(), HubError> {
        self.deliver(ClientMessage::Response(response)).await
    }

    async fn send_notification(
        &self,
        notification: NotificationMessage,
    ) -> Result<(), HubError> {
        self.deliver(ClientMessage::Notification(notification)).await
    }

    fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// An in-process client session: send requests, publish as an agent, and
/// receive whatever the hub delivers.
pub struct EmbeddedClient {
    connection: Arc<EmbeddedConnection>,
    rx: mpsc::Receiver<ClientMessage>,
    router: Arc<Router>,
    manager: Arc<TransportManager>,
}

impl std::fmt::Debug for EmbeddedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedClient").finish_non_exhaustive()
    }
}

impl EmbeddedClient {
    pub fn client_id(&self) -> &str {
        &self.connection.client_id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection.connection_id
    }

    pub fn is_closed(&self) -> bool {
        self.connection.closed.load(Ordering::Acquire)
    }

    /// Send a request into the hub; the immediate response is returned and
    /// any correlated final reply arrives via [`EmbeddedClient::recv`].
    pub async fn send_request(&self, mut request: RequestMessage) -> ResponseMessage {
        request.sender_id = self.connection.client_id.clone();
        self.router
            .handle_request(request, Some(&self.connection.connection_id))
            .await
    }

    /// Reply to a request this client received in its role as agent.
    pub async fn send_response(&self, response: ResponseMessage) {
        self.router
            .handle_response(response, &self.connection.client_id)
            .await;
    }

    /// Publish a property, event or action-status notification.
    pub async fn publish(&self, notification: NotificationMessage) {
        self.router
            .handle_notification(notification, &self.connection.client_id)
            .await;
    }

    /// Receive the next message delivered to this connection.
    pub async fn recv(&mut self) -> Option<ClientMessage> {
        self.rx.recv().await
    }

    /// Receive with a timeout; `None` on timeout or closed connection.
    pub async fn recv_timeout(&mut self, timeout: std::time::Duration) -> Option<ClientMessage> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn disconnect(self) {
        self.connection.close();
        self.manager
            .remove_connection(&self.connection.connection_id);
    }
}

impl Drop for EmbeddedClient {
    fn drop(&mut self) {
        self.connection.close();
        self.manager
            .remove_connection(&self.connection.connection_id);
    }
}
