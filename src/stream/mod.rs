//! Managed binary streams
//!
//! Large payloads travel outside message bodies: a message carries only a
//! [`StreamId`](crate::domain::StreamId), the [`StreamManager`] owns the stream.

mod config;
mod manager;
mod pipe;

pub use config::StreamConfig;
pub use manager::StreamManager;
pub use pipe::{Stream, StreamMode};
