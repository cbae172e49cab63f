//! authn-service: client identity, credentials and tokens for the HiveOT hub.
//!
//! Owns the file-backed client store, asymmetric keys, password hashing and
//! JWS token issuance, and exposes the `authn/admin` and `authn/user`
//! built-in service Things.

pub mod handlers;
pub mod keys;
pub mod models;
pub mod password;
pub mod service;
pub mod store;
pub mod token;

pub use handlers::AuthnHandler;
pub use keys::{KeyKind, KeyPair};
pub use models::{AuthInfo, ClientProfile, ClientRecord, ClientType};
pub use password::HashAlgorithm;
pub use service::AuthnService;
pub use store::AuthnStore;
pub use token::{TokenIssuer, TokenValidity};
