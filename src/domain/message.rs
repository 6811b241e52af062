//! Message envelope
//!
//! A [`Message`] is immutable once built. Payload bytes are shared behind an
//! `Arc`, so cloning a message for the waiter table or the deferred dispatch
//! queue never copies the payload.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::id::{StreamId, generate_correlation_id};
use super::version::Version;
use crate::error::{BrokerError, BrokerResult};

/// Version of the envelope layout written by [`Message::to_json`]
pub const MESSAGE_VERSION: Version = Version::new(4, 0);

/// Whether a message is an original publish or a reply to one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Publish,
    Reply,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Publish => write!(f, "Publish"),
            Self::Reply => write!(f, "Reply"),
        }
    }
}

/// Immutable message envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: String,
    correlation_id: String,
    kind: MessageKind,
    topic: String,
    action: String,
    payload: Arc<[u8]>,
    stream_id: Option<StreamId>,
}

impl Message {
    /// Build a publish message with a freshly generated correlation id
    pub fn new(topic: impl Into<String>, action: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self::with_id(generate_correlation_id(), topic, action, payload)
    }

    /// Build a publish message with a caller-chosen correlation id
    pub fn with_id(
        id: impl Into<String>,
        topic: impl Into<String>,
        action: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        let id = id.into();
        Self {
            correlation_id: id.clone(),
            id,
            kind: MessageKind::Publish,
            topic: topic.into(),
            action: action.into(),
            payload: Arc::from(payload.into()),
            stream_id: None,
        }
    }

    /// Build a publish message whose payload is `value` serialized as JSON
    pub fn json<T: Serialize>(topic: impl Into<String>, action: impl Into<String>, value: &T) -> BrokerResult<Self> {
        let bytes = serde_json::to_vec(value).map_err(|e| BrokerError::InvalidState(format!("payload: {}", e)))?;
        Ok(Self::new(topic, action, bytes))
    }

    /// Build the reply answering `correlation_id`
    pub fn reply(
        correlation_id: impl Into<String>,
        topic: impl Into<String>,
        action: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: generate_correlation_id(),
            correlation_id: correlation_id.into(),
            kind: MessageKind::Reply,
            topic: topic.into(),
            action: action.into(),
            payload: Arc::from(payload.into()),
            stream_id: None,
        }
    }

    /// Attach a stream reference; the message never owns the stream
    pub fn with_stream(mut self, stream_id: StreamId) -> Self {
        self.stream_id = Some(stream_id);
        self
    }

    /// This message's own id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Id linking a reply to its request; equal to `id()` for publishes
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload as UTF-8 text, if it is valid UTF-8
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Decode the payload as JSON into `T`
    pub fn payload_json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }

    pub fn stream_id(&self) -> Option<&StreamId> {
        self.stream_id.as_ref()
    }

    /// Render the message as the engine's JSON envelope
    ///
    /// JSON payloads are embedded as values; anything else is carried as a string.
    pub fn to_json(&self) -> BrokerResult<String> {
        let payload = match serde_json::from_slice::<Value>(&self.payload) {
            Ok(value) => value,
            Err(_) => Value::String(String::from_utf8_lossy(&self.payload).into_owned()),
        };
        let envelope = Envelope {
            header: Header {
                id: self.id.clone(),
                message_type: self.kind,
                version: MESSAGE_VERSION,
                message_description: Description {
                    topic: self.topic.clone(),
                    action: self.action.clone(),
                    reply_to_id: match self.kind {
                        MessageKind::Reply => Some(self.correlation_id.clone()),
                        MessageKind::Publish => None,
                    },
                },
            },
            payload,
            stream_id: self.stream_id.clone(),
        };
        serde_json::to_string(&envelope).map_err(|e| BrokerError::InvalidState(format!("envelope: {}", e)))
    }

    /// Parse the engine's JSON envelope
    pub fn from_json(text: &str) -> BrokerResult<Self> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| BrokerError::InvalidState(format!("envelope: {}", e)))?;
        let header = envelope.header;

        let correlation_id = match (header.message_type, header.message_description.reply_to_id) {
            (MessageKind::Reply, Some(reply_to)) => reply_to,
            (MessageKind::Reply, None) => {
                return Err(BrokerError::InvalidState(format!(
                    "reply {} is missing replyToId",
                    header.id
                )));
            }
            (MessageKind::Publish, _) => header.id.clone(),
        };
        let payload = match envelope.payload {
            Value::Null => Vec::new(),
            Value::String(s) => s.into_bytes(),
            other => other.to_string().into_bytes(),
        };

        Ok(Self {
            id: header.id,
            correlation_id,
            kind: header.message_type,
            topic: header.message_description.topic,
            action: header.message_description.action,
            payload: Arc::from(payload),
            stream_id: envelope.stream_id,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    header: Header,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "streamId", default, skip_serializing_if = "Option::is_none")]
    stream_id: Option<StreamId>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    id: String,
    #[serde(rename = "messageType")]
    message_type: MessageKind,
    version: Version,
    #[serde(rename = "messageDescription")]
    message_description: Description,
}

#[derive(Debug, Serialize, Deserialize)]
struct Description {
    topic: String,
    action: String,
    #[serde(rename = "replyToId", default, skip_serializing_if = "Option::is_none")]
    reply_to_id: Option<String>,
}
