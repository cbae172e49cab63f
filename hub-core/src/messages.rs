//! Typed message envelopes exchanged between transports and the router.
//!
//! Three kinds flow through the hub: requests (consumer to agent or built-in
//! service), responses (agent back to consumer, paired by correlation id) and
//! notifications (agent to subscribers).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::HubError;
use crate::operations::Operation;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Progress of a request that expects a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Error payload carried in a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseError {
    /// Stable error kind from the hub taxonomy.
    pub kind: String,
    pub message: String,
}

impl From<&HubError> for ResponseError {
    fn from(err: &HubError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// A request from a consumer, agent or service.
///
/// `thing_id` is the digital-twin id (`dtw:<agent>:<thing>`) on the consumer
/// side; the router strips the prefix before forwarding so the owning agent
/// only ever sees its local thing id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessage {
    pub operation: Operation,
    pub thing_id: String,
    /// Affordance name; empty for "all" style operations.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Authenticated sender; stamped by the transport, never client-supplied.
    #[serde(default)]
    pub sender_id: String,
    pub created: i64,
}

impl RequestMessage {
    pub fn new(
        operation: Operation,
        thing_id: impl Into<String>,
        name: impl Into<String>,
        input: Value,
        sender_id: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            thing_id: thing_id.into(),
            name: name.into(),
            input,
            correlation_id: None,
            sender_id: sender_id.into(),
            created: now_ms(),
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Correlation id, generating a fresh one when the caller omitted it.
    pub fn ensure_correlation_id(&mut self) -> String {
        if let Some(cid) = &self.correlation_id {
            return cid.clone();
        }
        let cid = Uuid::new_v4().to_string();
        self.correlation_id = Some(cid.clone());
        cid
    }
}

/// A reply to a request, paired by correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub correlation_id: String,
    pub operation: Operation,
    pub thing_id: String,
    #[serde(default)]
    pub name: String,
    pub status: RequestStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
    #[serde(default)]
    pub sender_id: String,
    pub updated: i64,
}

impl ResponseMessage {
    /// A completed reply to `request` with the given output.
    pub fn completed(request: &RequestMessage, sender_id: &str, output: Value) -> Self {
        Self {
            correlation_id: request.correlation_id.clone().unwrap_or_default(),
            operation: request.operation,
            thing_id: request.thing_id.clone(),
            name: request.name.clone(),
            status: RequestStatus::Completed,
            output,
            error: None,
            sender_id: sender_id.to_string(),
            updated: now_ms(),
        }
    }

    /// A pending acknowledgement for a request forwarded to an agent.
    pub fn pending(request: &RequestMessage, sender_id: &str) -> Self {
        Self {
            status: RequestStatus::Pending,
            ..Self::completed(request, sender_id, Value::Null)
        }
    }

    /// A failed reply carrying the error kind and message.
    pub fn failed(request: &RequestMessage, sender_id: &str, err: &HubError) -> Self {
        Self {
            status: RequestStatus::Failed,
            error: Some(ResponseError::from(err)),
            ..Self::completed(request, sender_id, Value::Null)
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == RequestStatus::Failed
    }
}

/// What a notification reports about a Thing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    /// Property value changed.
    Property,
    /// Event emitted.
    Event,
    /// Action status changed (pending, running, completed, failed).
    ActionStatus,
}

/// One-way message from an agent, fanned out to subscribed connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub kind: NotificationKind,
    pub thing_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Action state; only present for [`NotificationKind::ActionStatus`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RequestStatus>,
    #[serde(default)]
    pub sender_id: String,
    pub created: i64,
}

impl NotificationMessage {
    pub fn new(
        kind: NotificationKind,
        thing_id: impl Into<String>,
        name: impl Into<String>,
        data: Value,
        sender_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            thing_id: thing_id.into(),
            name: name.into(),
            data,
            correlation_id: None,
            status: None,
            sender_id: sender_id.into(),
            created: now_ms(),
        }
    }
}
