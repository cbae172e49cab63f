//! hub-runtime: the switchboard of the HiveOT hub.
//!
//! The router authenticates, authorizes and rewrites every message flowing
//! between consumers and agents, dispatches to the built-in service Things,
//! and correlates responses back to their originators. The transport manager
//! fronts any number of wire protocols behind one connection interface; an
//! embedded in-process transport and an HTTP + SSE transport ship here.

pub mod config;
pub mod router;
pub mod runtime;
pub mod session;
pub mod transport;

pub use config::RuntimeConfig;
pub use router::{PendingRequest, Router};
pub use runtime::Runtime;
pub use session::HubSessionAuth;
pub use transport::embedded::{ClientMessage, EmbeddedClient, EmbeddedTransport};
pub use transport::manager::TransportManager;
pub use transport::{Connection, SessionAuth, Subscriptions, Transport};
