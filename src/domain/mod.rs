//! Domain types shared by the broker, stream manager and registry
//!
//! Message envelopes, identifiers and versions.

mod id;
mod message;
mod version;

pub use id::{StreamId, generate_correlation_id};
pub use message::{MESSAGE_VERSION, Message, MessageKind};
pub use version::Version;
