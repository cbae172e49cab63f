//! The interface built-in service Things expose to the router.

use async_trait::async_trait;

use crate::messages::{RequestMessage, ResponseMessage};
use crate::td::ThingDescription;

/// A built-in service the router dispatches to synchronously instead of
/// forwarding over a transport. One handler per built-in agent id; the
/// handler multiplexes its own Things by the request's thing id.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    /// The agent id this handler serves (e.g. `authn`, `authz`, `digitwin`).
    fn agent_id(&self) -> &str;

    /// Handlers that enforce their own access rules (admin-role checks,
    /// self-scoped user operations) are dispatched without the router's
    /// role-table check.
    fn self_authorizing(&self) -> bool {
        false
    }

    /// Handle one request addressed to this service and build the response.
    async fn handle_request(&self, request: &RequestMessage) -> ResponseMessage;

    /// Thing Descriptions this service publishes into the directory at startup.
    fn thing_descriptions(&self) -> Vec<ThingDescription> {
        Vec::new()
    }
}
