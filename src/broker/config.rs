//! Broker configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Where `publish` runs subscriber handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchMode {
    /// Handlers run on the publishing thread before `publish` returns
    #[default]
    Inline,
    /// Handlers run on a single dispatcher task, in FIFO order
    Deferred,
}

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Default reply timeout in milliseconds for send-and-wait
    #[serde(rename = "reply-timeout-ms", default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,

    /// Handler dispatch mode
    #[serde(default)]
    pub dispatch: DispatchMode,
}

fn default_reply_timeout_ms() -> u64 {
    debug!("default_reply_timeout_ms: called");
    500
}

impl Default for BrokerConfig {
    fn default() -> Self {
        debug!("BrokerConfig::default: called");
        Self {
            reply_timeout_ms: 500,
            dispatch: DispatchMode::Inline,
        }
    }
}

impl BrokerConfig {
    /// Get the default reply timeout as a Duration
    pub fn reply_timeout(&self) -> Duration {
        debug!(reply_timeout_ms = %self.reply_timeout_ms, "BrokerConfig::reply_timeout: called");
        Duration::from_millis(self.reply_timeout_ms)
    }

    /// Config with deferred dispatch and default timeouts
    pub fn deferred() -> Self {
        Self {
            dispatch: DispatchMode::Deferred,
            ..Default::default()
        }
    }
}
