//! hub-core: Shared foundation for the HiveOT hub runtime.
//!
//! Message envelopes, the operations vocabulary, digital-twin identifier
//! handling, the Thing Description model and the error taxonomy used by every
//! hub service crate.

pub mod config;
pub mod error;
pub mod handler;
pub mod messages;
pub mod observability;
pub mod operations;
pub mod td;
pub mod thing_id;

pub use error::HubError;
pub use handler::ServiceHandler;
pub use messages::{
    now_ms, NotificationKind, NotificationMessage, RequestMessage, RequestStatus, ResponseError,
    ResponseMessage,
};
pub use operations::Operation;
pub use td::{Form, InteractionAffordance, ThingDescription};
pub use thing_id::DThingId;
