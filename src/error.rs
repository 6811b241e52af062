//! Error taxonomy for the broker, stream manager and module registry

use std::time::Duration;

use thiserror::Error;

use crate::domain::{StreamId, Version};

/// Errors returned by the broker substrate
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Duplicate registration: module {module} already subscribed to {topic}:{action}")]
    DuplicateRegistration { topic: String, action: String, module: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timed out after {timeout:?} waiting for reply to {correlation_id}")]
    Timeout { correlation_id: String, timeout: Duration },

    #[error("Stream closed: {0}")]
    Closed(StreamId),

    #[error("Version mismatch: {module} requires {dependency} >= {required}, found {actual}")]
    VersionMismatch {
        module: String,
        dependency: String,
        required: Version,
        actual: Version,
    },

    #[error("Dependency cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    #[error("Module {module} failed: {reason}")]
    ModuleFailed { module: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Coarse error classes callers can branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidState,
    NotFound,
    Timeout,
    Closed,
    VersionMismatch,
    CycleDetected,
    ModuleFailed,
    Config,
}

impl BrokerError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidState(_) | Self::DuplicateRegistration { .. } => ErrorKind::InvalidState,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Closed(_) => ErrorKind::Closed,
            Self::VersionMismatch { .. } => ErrorKind::VersionMismatch,
            Self::CycleDetected(_) => ErrorKind::CycleDetected,
            Self::ModuleFailed { .. } => ErrorKind::ModuleFailed,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

/// Result alias used across the crate
pub type BrokerResult<T> = Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_registration_is_invalid_state() {
        let err = BrokerError::DuplicateRegistration {
            topic: "Navigation".to_string(),
            action: "StartNavigation".to_string(),
            module: "aasb.navigation".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(err.to_string().contains("Navigation:StartNavigation"));
    }

    #[test]
    fn test_cycle_message_lists_path() {
        let err = BrokerError::CycleDetected(vec!["a".to_string(), "b".to_string(), "a".to_string()]);
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn test_timeout_kind() {
        let err = BrokerError::Timeout {
            correlation_id: "abc".to_string(),
            timeout: Duration::from_millis(10),
        };
        assert!(err.is_timeout());
    }
}
