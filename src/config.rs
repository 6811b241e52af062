//! EngineBus configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::broker::BrokerConfig;
use crate::registry::ActionEnablement;
use crate::stream::StreamConfig;

/// Main EngineBus configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker dispatch and reply timeout
    pub broker: BrokerConfig,

    /// Stream buffer sizing
    pub streams: StreamConfig,

    /// Per-module action enablement
    pub modules: ModulesConfig,
}

impl Config {
    /// Validate configuration before use
    pub fn validate(&self) -> Result<()> {
        if self.broker.reply_timeout_ms == 0 {
            return Err(eyre::eyre!("broker.reply-timeout-ms must be greater than zero"));
        }
        if self.streams.default_capacity == 0 || self.streams.max_capacity == 0 {
            return Err(eyre::eyre!("stream capacities must be greater than zero"));
        }
        if self.streams.default_capacity > self.streams.max_capacity {
            return Err(eyre::eyre!(
                "streams.default-capacity ({}) exceeds streams.max-capacity ({})",
                self.streams.default_capacity,
                self.streams.max_capacity
            ));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .enginebus.yml
        let local_config = PathBuf::from(".enginebus.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/enginebus/enginebus.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("enginebus").join("enginebus.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Which conditional module actions are switched on
///
/// ```yaml
/// modules:
///   default-enabled: true
///   Navigation:
///     ShowAlternativeRoutes: false
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulesConfig {
    /// Answer for actions not listed below
    #[serde(rename = "default-enabled")]
    pub default_enabled: bool,

    /// Module name -> action name -> enabled
    #[serde(flatten)]
    pub actions: HashMap<String, HashMap<String, bool>>,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            default_enabled: true,
            actions: HashMap::new(),
        }
    }
}

impl ModulesConfig {
    /// Set one module action explicitly
    pub fn set(&mut self, module: &str, action: &str, enabled: bool) {
        self.actions
            .entry(module.to_string())
            .or_default()
            .insert(action.to_string(), enabled);
    }
}

impl ActionEnablement for ModulesConfig {
    fn is_action_enabled(&self, module: &str, action: &str) -> bool {
        self.actions
            .get(module)
            .and_then(|actions| actions.get(action))
            .copied()
            .unwrap_or(self.default_enabled)
    }
}
