//! digitwin-service: the directory of digital-twin Thing Descriptions and
//! the latest-value store, with the `digitwin/directory` and
//! `digitwin/values` built-in service Things.

pub mod directory;
pub mod handlers;
pub mod values;

pub use directory::{DigitwinDirectory, EVENT_THING_REMOVED, EVENT_THING_UPDATED};
pub use handlers::DigitwinHandler;
pub use values::{ActionRecord, ValueRecord, ValueStore};
