//! authz-service: role and per-Thing authorization for the HiveOT hub.
//!
//! Holds the role-to-operations table and the per-Thing allow/deny lists,
//! answers `has_permission` for every routed message, and exposes the
//! `authz/admin` built-in service Thing.

pub mod acl;
pub mod handlers;
pub mod models;
pub mod service;

pub use handlers::AuthzHandler;
pub use models::{builtin_roles, ThingPermission};
pub use service::AuthzService;
