//! Module descriptors and the module trait

use serde::{Deserialize, Serialize};

use super::context::ModuleContext;
use crate::domain::Version;

/// A declared dependency on another module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Name of the module depended on
    pub name: String,

    /// Lowest acceptable version of that module
    #[serde(rename = "min-version")]
    pub min_version: Version,

    /// Optional dependencies may be absent or failed; a version mismatch still fails
    #[serde(default)]
    pub optional: bool,
}

impl Dependency {
    pub fn required(name: impl Into<String>, min_version: Version) -> Self {
        Self {
            name: name.into(),
            min_version,
            optional: false,
        }
    }

    pub fn optional(name: impl Into<String>, min_version: Version) -> Self {
        Self {
            name: name.into(),
            min_version,
            optional: true,
        }
    }
}

/// Static declaration of a feature module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub name: String,
    pub version: Version,

    /// Lowest broker message-interface version the module works with
    #[serde(rename = "min-broker-version", default)]
    pub min_broker_version: Version,

    #[serde(default)]
    pub dependencies: Vec<Dependency>,

    /// Actions the module turns on or off according to runtime configuration
    #[serde(default)]
    pub actions: Vec<String>,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            min_broker_version: Version::default(),
            dependencies: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn depends_on(mut self, name: impl Into<String>, min_version: Version) -> Self {
        self.dependencies.push(Dependency::required(name, min_version));
        self
    }

    pub fn optionally_depends_on(mut self, name: impl Into<String>, min_version: Version) -> Self {
        self.dependencies.push(Dependency::optional(name, min_version));
        self
    }

    pub fn requires_broker(mut self, min_version: Version) -> Self {
        self.min_broker_version = min_version;
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.actions.push(action.into());
        self
    }

    /// Names of every declared dependency, required or optional
    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().map(|d| d.name.as_str())
    }

    /// Whether `action` is one of the conditionally enabled actions
    pub fn declares_action(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a == action)
    }
}

/// A feature module managed by the engine registry
///
/// Hooks run on the thread that starts or shuts down the registry, one module
/// at a time, in dependency order. Errors (and panics) mark only this module
/// as failed.
pub trait EngineModule: Send {
    /// Runs right after construction, before dependency and version checks
    fn pre_register(&mut self, _ctx: &ModuleContext) -> eyre::Result<()> {
        Ok(())
    }

    /// Runs exactly once, after every dependency is live
    ///
    /// Subscriptions made through `ctx` become reachable only if this returns `Ok`.
    fn post_register(&mut self, ctx: &mut ModuleContext) -> eyre::Result<()>;

    /// Runs at teardown, once the module's handlers are removed and none is still running
    fn shutdown(&mut self) -> eyre::Result<()> {
        Ok(())
    }
}
