//! Transport abstraction.
//!
//! The router only ever sees these traits: a [`Transport`] listens on some
//! wire protocol and authenticates connecting clients through the injected
//! [`SessionAuth`]; each authenticated session is a [`Connection`] able to
//! deliver typed messages. Everything protocol-specific stays behind them.

pub mod embedded;
pub mod http_sse;
pub mod manager;

use std::sync::RwLock;

use async_trait::async_trait;

use authn_service::AuthInfo;
use hub_core::{
    Form, HubError, NotificationKind, NotificationMessage, RequestMessage, ResponseMessage,
};

/// Authenticates connecting clients. Implemented by the runtime as a façade
/// over the client store and the token issuer.
pub trait SessionAuth: Send + Sync {
    /// Validate a token presented at connect time. An empty `client_id`
    /// means the transport has no identity channel of its own and the
    /// token's subject claim is authoritative.
    fn authenticate_token(
        &self,
        client_id: &str,
        token: &str,
        nonce: Option<&str>,
        signed_nonce: Option<&str>,
    ) -> Result<AuthInfo, HubError>;

    /// Exchange a password for a fresh token.
    fn login_with_password(&self, client_id: &str, password: &str) -> Result<String, HubError>;

    /// Reissue a token on proof of a current one.
    fn refresh_token(&self, client_id: &str, token: &str) -> Result<String, HubError>;
}

/// One authenticated session on some wire protocol.
///
/// A client may hold many connections; each carries its own subscription
/// state and each receives a matching notification exactly once.
#[async_trait]
pub trait Connection: Send + Sync {
    fn connection_id(&self) -> &str;
    fn client_id(&self) -> &str;
    fn protocol(&self) -> &'static str;

    /// Deliver a request to the agent behind this connection.
    async fn send_request(&self, request: RequestMessage) -> Result<(), HubError>;

    /// Deliver a response to the consumer behind this connection.
    async fn send_response(&self, response: ResponseMessage) -> Result<(), HubError>;

    /// Deliver a notification to a subscriber.
    async fn send_notification(&self, notification: NotificationMessage)
        -> Result<(), HubError>;

    fn subscriptions(&self) -> &Subscriptions;

    /// Force the connection closed; further sends fail.
    fn close(&self);
}

/// A wire protocol listener managed by the transport manager.
#[async_trait]
pub trait Transport: Send + Sync {
    fn protocol(&self) -> &'static str;

    async fn start(&self) -> Result<(), HubError>;

    async fn stop(&self);

    /// The Form consumers use to reach an affordance over this transport,
    /// if it is externally addressable.
    fn form_for(&self, _operation: &str, _dthing_id: &str, _name: &str) -> Option<Form> {
        None
    }
}

/// Per-connection subscription and observation state.
///
/// A pattern pair `(thing, name)` matches a notification when each non-empty
/// part equals the notification's; an empty part means "all".
#[derive(Default)]
pub struct Subscriptions {
    events: RwLock<Vec<(String, String)>>,
    observations: RwLock<Vec<(String, String)>>,
}

impl Subscriptions {
    pub fn subscribe_event(&self, dthing_id: &str, name: &str) {
        push_unique(&self.events, dthing_id, name);
    }

    pub fn unsubscribe_event(&self, dthing_id: &str, name: &str) {
        remove_matching(&self.events, dthing_id, name);
    }

    pub fn observe(&self, dthing_id: &str, name: &str) {
        push_unique(&self.observations, dthing_id, name);
    }

    pub fn unobserve(&self, dthing_id: &str, name: &str) {
        remove_matching(&self.observations, dthing_id, name);
    }

    /// Whether this connection should receive the notification. Event and
    /// action-status notifications follow event subscriptions; property
    /// notifications follow observations.
    pub fn matches(&self, notification: &NotificationMessage) -> bool {
        let table = match notification.kind {
            NotificationKind::Property => &self.observations,
            NotificationKind::Event | NotificationKind::ActionStatus => &self.events,
        };
        table
            .read()
            .expect("subscriptions lock poisoned")
            .iter()
            .any(|(thing, name)| {
                (thing.is_empty() || thing == &notification.thing_id)
                    && (name.is_empty() || name == &notification.name)
            })
    }
}

fn push_unique(table: &RwLock<Vec<(String, String)>>, dthing_id: &str, name: &str) {
    let mut guard = table.write().expect("subscriptions lock poisoned");
    let entry = (dthing_id.to_string(), name.to_string());
    if !guard.contains(&entry) {
        guard.push(entry);
    }
}

fn remove_matching(table: &RwLock<Vec<(String, String)>>, dthing_id: &str, name: &str) {
    table
        .write()
        .expect("subscriptions lock poisoned")
        .retain(|(thing, n)| !(thing == dthing_id && (name.is_empty() || n == name)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(thing: &str, name: &str) -> NotificationMessage {
        NotificationMessage::new(NotificationKind::Event, thing, name, json!(1), "a1")
    }

    fn property(thing: &str, name: &str) -> NotificationMessage {
        NotificationMessage::new(NotificationKind::Property, thing, name, json!(1), "a1")
    }

    #[test]
    fn empty_patterns_match_everything() {
        let subs = Subscriptions::default();
        subs.subscribe_event("dtw:a1:thing1", "");
        assert!(subs.matches(&event("dtw:a1:thing1", "overheated")));
        assert!(subs.matches(&event("dtw:a1:thing1", "cooled")));
        assert!(!subs.matches(&event("dtw:a1:thing2", "overheated")));
    }

    #[test]
    fn events_and_observations_are_separate() {
        let subs = Subscriptions::default();
        subs.subscribe_event("dtw:a1:thing1", "");
        assert!(!subs.matches(&property("dtw:a1:thing1", "temperature")));
        subs.observe("dtw:a1:thing1", "temperature");
        assert!(subs.matches(&property("dtw:a1:thing1", "temperature")));
        assert!(!subs.matches(&property("dtw:a1:thing1", "humidity")));
    }

    #[test]
    fn unsubscribe_removes_entries() {
        let subs = Subscriptions::default();
        subs.subscribe_event("dtw:a1:thing1", "overheated");
        subs.subscribe_event("dtw:a1:thing1", "cooled");
        subs.unsubscribe_event("dtw:a1:thing1", "overheated");
        assert!(!subs.matches(&event("dtw:a1:thing1", "overheated")));
        assert!(subs.matches(&event("dtw:a1:thing1", "cooled")));

        // empty name clears everything for the thing
        subs.unsubscribe_event("dtw:a1:thing1", "");
        assert!(!subs.matches(&event("dtw:a1:thing1", "cooled")));
    }

    #[test]
    fn duplicate_subscriptions_collapse() {
        let subs = Subscriptions::default();
        subs.subscribe_event("dtw:a1:thing1", "e");
        subs.subscribe_event("dtw:a1:thing1", "e");
        subs.unsubscribe_event("dtw:a1:thing1", "e");
        assert!(!subs.matches(&event("dtw:a1:thing1", "e")));
    }
}
