//! The message switchboard.
//!
//! Every inbound request, response and notification passes through here.
//! The router resolves the digital-twin target, checks authorization,
//! rewrites identities so agents only ever see their local namespace,
//! dispatches built-in service Things synchronously, forwards everything
//! else to the owning agent and pairs responses back to their originators
//! by correlation id. Stateless apart from the pending-request set.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};

use authn_service::{AuthnStore, ClientType};
use authz_service::AuthzService;
use digitwin_service::{DigitwinDirectory, ValueStore};
use hub_core::thing_id::{make_dthing_id, DThingId};
use hub_core::{
    now_ms, HubError, NotificationKind, NotificationMessage, Operation, RequestMessage,
    RequestStatus, ResponseMessage, ServiceHandler,
};

use crate::transport::manager::TransportManager;

/// Sender id stamped on responses synthesized by the router itself.
pub const ROUTER_SENDER_ID: &str = "hub";

/// Bookkeeping for an in-flight request-response pair.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub correlation_id: String,
    /// Consumer the reply belongs to.
    pub sender_id: String,
    /// Reply sink: the originating connection. A reconnect within the
    /// deadline does not receive the reply.
    pub connection_id: String,
    pub dthing_id: String,
    pub operation: Operation,
    pub name: String,
    pub deadline_ms: i64,
}

pub struct Router {
    store: Arc<AuthnStore>,
    authz: Arc<AuthzService>,
    directory: Arc<DigitwinDirectory>,
    values: Arc<ValueStore>,
    handlers: HashMap<String, Arc<dyn ServiceHandler>>,
    pending: DashMap<String, PendingRequest>,
    transports: OnceLock<Arc<TransportManager>>,
    request_timeout: Duration,
    request_log: bool,
    notification_log: bool,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<AuthnStore>,
        authz: Arc<AuthzService>,
        directory: Arc<DigitwinDirectory>,
        values: Arc<ValueStore>,
        handlers: Vec<Arc<dyn ServiceHandler>>,
        request_timeout: Duration,
        request_log: bool,
        notification_log: bool,
    ) -> Arc<Self> {
        let handlers = handlers
            .into_iter()
            .map(|h| (h.agent_id().to_string(), h))
            .collect();
        Arc::new(Self {
            store,
            authz,
            directory,
            values,
            handlers,
            pending: DashMap::new(),
            transports: OnceLock::new(),
            request_timeout,
            request_log,
            notification_log,
        })
    }

    /// Second phase of construction: the transport manager is built with the
    /// router's handlers, then installed here before `start()`.
    pub fn install_transport_manager(&self, manager: Arc<TransportManager>) {
        if self.transports.set(manager).is_err() {
            warn!("transport manager installed twice; keeping the first");
        }
    }

    pub fn service_handlers(&self) -> impl Iterator<Item = &Arc<dyn ServiceHandler>> {
        self.handlers.values()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn manager(&self) -> Result<&Arc<TransportManager>, HubError> {
        self.transports
            .get()
            .ok_or_else(|| HubError::InternalError("transport manager not installed".to_string()))
    }

    /// Handle one request from an authenticated sender.
    ///
    /// `origin_connection_id` is the connection the request arrived on; it
    /// anchors subscription state and the reply sink for forwarded requests.
    /// The returned response is immediate: final for built-ins, local reads
    /// and failures, a pending acknowledgement for forwarded requests whose
    /// real reply arrives on the originating connection.
    pub async fn handle_request(
        self: &Arc<Self>,
        mut request: RequestMessage,
        origin_connection_id: Option<&str>,
    ) -> ResponseMessage {
        if self.request_log {
            info!(target: "hub::reqlog", sender = %request.sender_id,
                operation = %request.operation, thing = %request.thing_id,
                name = %request.name, correlation = ?request.correlation_id, "request");
        }
        if request.sender_id.is_empty() {
            return ResponseMessage::failed(
                &request,
                ROUTER_SENDER_ID,
                &HubError::InvalidArgument("request has no authenticated sender".to_string()),
            );
        }

        if request.operation.is_subscription() {
            return self.handle_subscription(&request, origin_connection_id);
        }

        let dt = match DThingId::parse(&request.thing_id) {
            Ok(dt) => dt,
            Err(e) => return ResponseMessage::failed(&request, ROUTER_SENDER_ID, &e),
        };

        // built-in service things are dispatched synchronously
        if let Some(handler) = self.handlers.get(&dt.agent_id) {
            if !handler.self_authorizing()
                && !self.authz.has_permission(
                    &request.sender_id,
                    request.operation,
                    &request.thing_id,
                )
            {
                return self.forbidden(&request);
            }
            let mut local = request.clone();
            local.thing_id = dt.thing_id.clone();
            let mut response = handler.handle_request(&local).await;
            response.thing_id = request.thing_id.clone();
            return response;
        }

        if !self
            .authz
            .has_permission(&request.sender_id, request.operation, &request.thing_id)
        {
            return self.forbidden(&request);
        }

        // the digital twin answers reads from its own stored state
        if request.operation.is_read() {
            return self.serve_read(&request);
        }

        self.forward_to_agent(&mut request, dt, origin_connection_id)
            .await
    }

    fn forbidden(&self, request: &RequestMessage) -> ResponseMessage {
        let err = HubError::Forbidden(format!(
            "'{}' may not {} on '{}'",
            request.sender_id, request.operation, request.thing_id
        ));
        debug!(sender = %request.sender_id, operation = %request.operation,
            thing = %request.thing_id, "request denied");
        ResponseMessage::failed(request, ROUTER_SENDER_ID, &err)
    }

    /// Subscription-class operations change state on the originating
    /// connection and are acknowledged immediately.
    fn handle_subscription(
        &self,
        request: &RequestMessage,
        origin_connection_id: Option<&str>,
    ) -> ResponseMessage {
        if !self
            .authz
            .has_permission(&request.sender_id, request.operation, &request.thing_id)
        {
            return self.forbidden(request);
        }

        let connection = origin_connection_id
            .and_then(|id| self.transports.get().and_then(|m| m.get_connection(id)));
        let Some(connection) = connection else {
            return ResponseMessage::failed(
                request,
                ROUTER_SENDER_ID,
                &HubError::InvalidArgument(
                    "subscription requires an originating connection".to_string(),
                ),
            );
        };

        let subs = connection.subscriptions();
        let thing = request.thing_id.as_str();
        match request.operation {
            Operation::SubscribeEvent => subs.subscribe_event(thing, &request.name),
            Operation::SubscribeAllEvents => subs.subscribe_event(thing, ""),
            Operation::UnsubscribeEvent => subs.unsubscribe_event(thing, &request.name),
            Operation::UnsubscribeAllEvents => subs.unsubscribe_event(thing, ""),
            Operation::ObserveProperty => subs.observe(thing, &request.name),
            Operation::ObserveAllProperties => subs.observe(thing, ""),
            Operation::UnobserveProperty => subs.unobserve(thing, &request.name),
            Operation::UnobserveAllProperties => subs.unobserve(thing, ""),
            _ => unreachable!("not a subscription operation"),
        }
        ResponseMessage::completed(request, ROUTER_SENDER_ID, Value::Null)
    }

    /// Read-class operations answered from the twin's stored state.
    fn serve_read(&self, request: &RequestMessage) -> ResponseMessage {
        let thing = request.thing_id.as_str();
        let name = request.name.as_str();
        let result: Result<Value, HubError> = match request.operation {
            Operation::ReadProperty => self
                .values
                .read_property(thing, name)
                .ok_or_else(|| HubError::NotFound(format!("no value for '{thing}' '{name}'")))
                .and_then(|record| Ok(serde_json::to_value(record)?)),
            Operation::ReadAllProperties => {
                serde_json::to_value(self.values.read_all_properties(thing)).map_err(Into::into)
            }
            Operation::QueryAction => self
                .values
                .query_action(thing, name)
                .ok_or_else(|| {
                    HubError::NotFound(format!("no invocation of '{thing}' '{name}'"))
                })
                .and_then(|record| Ok(serde_json::to_value(record)?)),
            Operation::QueryAllActions => {
                serde_json::to_value(self.values.query_all_actions(thing)).map_err(Into::into)
            }
            Operation::ReadTd => self
                .directory
                .read_td(thing)
                .and_then(|td| Ok(serde_json::to_value(td)?)),
            Operation::ReadAllTds => Err(HubError::InvalidArgument(
                "address readalltds to the directory service".to_string(),
            )),
            _ => unreachable!("not a read operation"),
        };
        match result {
            Ok(output) => ResponseMessage::completed(request, ROUTER_SENDER_ID, output),
            Err(err) => ResponseMessage::failed(request, ROUTER_SENDER_ID, &err),
        }
    }

    async fn forward_to_agent(
        self: &Arc<Self>,
        request: &mut RequestMessage,
        dt: DThingId,
        origin_connection_id: Option<&str>,
    ) -> ResponseMessage {
        let manager = match self.manager() {
            Ok(manager) => manager,
            Err(e) => return ResponseMessage::failed(request, ROUTER_SENDER_ID, &e),
        };
        let Some(connection) = manager.get_connection_by_client_id(&dt.agent_id) else {
            return ResponseMessage::failed(
                request,
                ROUTER_SENDER_ID,
                &HubError::AgentNotConnected(dt.agent_id.clone()),
            );
        };

        let correlation_id = request.ensure_correlation_id();

        // the agent sees its local thing id, never the twin namespace
        let mut agent_request = request.clone();
        agent_request.thing_id = dt.thing_id.clone();

        if request.operation.expects_reply() {
            self.pending.insert(
                correlation_id.clone(),
                PendingRequest {
                    correlation_id: correlation_id.clone(),
                    sender_id: request.sender_id.clone(),
                    connection_id: origin_connection_id.unwrap_or_default().to_string(),
                    dthing_id: request.thing_id.clone(),
                    operation: request.operation,
                    name: request.name.clone(),
                    deadline_ms: now_ms() + self.request_timeout.as_millis() as i64,
                },
            );
            self.spawn_deadline(correlation_id.clone());
        }
        if request.operation == Operation::InvokeAction {
            self.values.record_action_request(
                &request.thing_id,
                &request.name,
                request.input.clone(),
                Some(correlation_id.clone()),
                &request.sender_id,
            );
        }

        if let Err(e) = connection.send_request(agent_request).await {
            self.pending.remove(&correlation_id);
            return ResponseMessage::failed(
                request,
                ROUTER_SENDER_ID,
                &HubError::DeliveryFailed(format!("to agent '{}': {e}", dt.agent_id)),
            );
        }
        ResponseMessage::pending(request, ROUTER_SENDER_ID)
    }

    fn spawn_deadline(self: &Arc<Self>, correlation_id: String) {
        let router = Arc::clone(self);
        let timeout = self.request_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            router.expire_pending(&correlation_id).await;
        });
    }

    /// Synthesize a timeout response for a pending request still registered.
    async fn expire_pending(&self, correlation_id: &str) {
        let Some((_, pending)) = self.pending.remove(correlation_id) else {
            return;
        };
        warn!(correlation_id, thing = %pending.dthing_id, name = %pending.name,
            "pending request expired");

        let err = HubError::Timeout(format!(
            "no response from '{}' within {:?}",
            pending.dthing_id, self.request_timeout
        ));
        if pending.operation == Operation::InvokeAction {
            self.values.update_action_status(
                &pending.dthing_id,
                &pending.name,
                RequestStatus::Failed,
                Value::Null,
                Some(pending.correlation_id.clone()),
            );
        }
        let response = ResponseMessage {
            correlation_id: pending.correlation_id,
            operation: pending.operation,
            thing_id: pending.dthing_id,
            name: pending.name,
            status: RequestStatus::Failed,
            output: Value::Null,
            error: Some((&err).into()),
            sender_id: ROUTER_SENDER_ID.to_string(),
            updated: now_ms(),
        };
        self.deliver_response(&pending.connection_id, response).await;
    }

    /// Drain every pending request as timed out; used at shutdown.
    pub async fn drain_pending(&self) {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.expire_pending(&key).await;
        }
    }

    /// Handle a response sent by an agent.
    ///
    /// At-most-once delivery: the reply reaches the originator iff the
    /// pending entry is still registered; late responses are dropped.
    pub async fn handle_response(&self, mut response: ResponseMessage, sender_id: &str) {
        response.sender_id = sender_id.to_string();
        response.thing_id = self.to_twin_namespace(&response.thing_id, sender_id);

        if response.operation == Operation::InvokeAction {
            self.values.update_action_status(
                &response.thing_id,
                &response.name,
                response.status,
                response.output.clone(),
                Some(response.correlation_id.clone()),
            );
        }

        match self.pending.remove(&response.correlation_id) {
            Some((_, pending)) => {
                self.deliver_response(&pending.connection_id, response).await;
            }
            None => {
                warn!(correlation_id = %response.correlation_id, sender_id,
                    "late response dropped");
            }
        }
    }

    async fn deliver_response(&self, connection_id: &str, response: ResponseMessage) {
        let Some(manager) = self.transports.get() else {
            return;
        };
        let Some(connection) = manager.get_connection(connection_id) else {
            warn!(correlation_id = %response.correlation_id,
                "originator connection gone; response dropped");
            return;
        };
        if let Err(e) = connection.send_response(response).await {
            warn!(connection_id, error = %e, "response delivery failed");
        }
    }

    /// Handle a notification published by an agent: record the value, then
    /// fan out to subscribed connections.
    pub async fn handle_notification(
        &self,
        mut notification: NotificationMessage,
        sender_id: &str,
    ) {
        // only agents and services (and the built-in services) may publish
        let is_builtin = self.handlers.contains_key(sender_id);
        if !is_builtin {
            match self.store.get_profile(sender_id) {
                Ok(profile)
                    if matches!(
                        profile.client_type,
                        ClientType::Agent | ClientType::Service
                    ) => {}
                _ => {
                    warn!(sender_id, "notification from non-agent dropped");
                    return;
                }
            }
        }

        notification.sender_id = sender_id.to_string();
        notification.thing_id = self.to_twin_namespace(&notification.thing_id, sender_id);
        if self.notification_log {
            info!(target: "hub::notiflog", sender = %notification.sender_id,
                kind = ?notification.kind, thing = %notification.thing_id,
                name = %notification.name, "notification");
        }

        match notification.kind {
            NotificationKind::Property => self.values.update_property(
                &notification.thing_id,
                &notification.name,
                notification.data.clone(),
                notification.correlation_id.clone(),
            ),
            NotificationKind::Event => self.values.update_event(
                &notification.thing_id,
                &notification.name,
                notification.data.clone(),
                notification.correlation_id.clone(),
            ),
            NotificationKind::ActionStatus => self.values.update_action_status(
                &notification.thing_id,
                &notification.name,
                notification.status.unwrap_or(RequestStatus::Completed),
                notification.data.clone(),
                notification.correlation_id.clone(),
            ),
        }

        if let Ok(manager) = self.manager() {
            manager.send_notification(&notification).await;
        }
    }

    /// Re-apply the twin prefix to an id an agent reported in its local
    /// namespace. Ids already in the sender's own twin namespace pass
    /// through; anything else is prefixed with the sender, so an agent can
    /// never speak for another agent's Things.
    fn to_twin_namespace(&self, thing_id: &str, sender_id: &str) -> String {
        match DThingId::parse(thing_id) {
            Ok(dt) if dt.agent_id == sender_id => thing_id.to_string(),
            _ => make_dthing_id(sender_id, thing_id),
        }
    }
}
