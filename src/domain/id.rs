//! Identifier generation
//!
//! Correlation ids and stream ids are UUIDv7 strings, so they sort by creation
//! time and are never handed out twice within a process.

/// Generate a fresh correlation id for a message
pub fn generate_correlation_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Stream identifier wrapper for type-safe id handling
///
/// Format: `stream-{uuidv7}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(String);

impl StreamId {
    /// Allocate a new, never-before-seen stream id
    pub fn generate() -> Self {
        Self(format!("stream-{}", uuid::Uuid::now_v7()))
    }

    /// Get the full id string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for StreamId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for StreamId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self(s))
    }
}
