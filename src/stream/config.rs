//! Stream manager configuration

use serde::{Deserialize, Serialize};

/// Stream buffer sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Buffer capacity in bytes when the opener gives no size hint
    #[serde(rename = "default-capacity")]
    pub default_capacity: usize,

    /// Upper bound on any stream's buffer capacity
    #[serde(rename = "max-capacity")]
    pub max_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            default_capacity: 64 * 1024,
            max_capacity: 16 * 1024 * 1024,
        }
    }
}

impl StreamConfig {
    /// Capacity for a stream opened with `size_hint`
    pub fn capacity_for(&self, size_hint: usize) -> usize {
        let wanted = if size_hint == 0 {
            self.default_capacity
        } else {
            size_hint
        };
        wanted.clamp(1, self.max_capacity.max(1))
    }
}
