//! Error taxonomy shared by every hub component.
//!
//! The router converts these into failed responses for reply-bearing
//! requests; fire-and-forget operations log and drop.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the hub core.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
pub enum HubError {
    /// Missing or empty required field, malformed key, unknown role or client type.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown client or Thing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate add of an existing client.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Wrong password, or no password set for the client.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Signature check failed, claim missing, or algorithm not allowed.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// Token expiry is in the past.
    #[error("token expired: {0}")]
    TokenExpired(String),

    /// Token was issued for a different client.
    #[error("token mismatch: {0}")]
    TokenMismatch(String),

    /// Sender is not permitted to perform the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Forwarding target has no live connection.
    #[error("agent not connected: {0}")]
    AgentNotConnected(String),

    /// Transport send failed after acceptance.
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),

    /// A pending request's deadline expired.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Persistence write failure or invariant violation.
    #[error("internal error: {0}")]
    InternalError(String),
}

impl HubError {
    /// Short machine-readable kind, stable on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            HubError::InvalidArgument(_) => "InvalidArgument",
            HubError::NotFound(_) => "NotFound",
            HubError::AlreadyExists(_) => "AlreadyExists",
            HubError::InvalidCredentials(_) => "InvalidCredentials",
            HubError::InvalidToken(_) => "InvalidToken",
            HubError::TokenExpired(_) => "TokenExpired",
            HubError::TokenMismatch(_) => "TokenMismatch",
            HubError::Forbidden(_) => "Forbidden",
            HubError::AgentNotConnected(_) => "AgentNotConnected",
            HubError::DeliveryFailed(_) => "DeliveryFailed",
            HubError::Timeout(_) => "Timeout",
            HubError::InternalError(_) => "InternalError",
        }
    }
}

impl From<std::io::Error> for HubError {
    fn from(err: std::io::Error) -> Self {
        HubError::InternalError(err.to_string())
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        HubError::InternalError(format!("json: {err}"))
    }
}

impl From<config::ConfigError> for HubError {
    fn from(err: config::ConfigError) -> Self {
        HubError::InvalidArgument(format!("configuration: {err}"))
    }
}
