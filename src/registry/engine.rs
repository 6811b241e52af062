//! EngineRegistry - dependency-ordered module lifecycle
//!
//! Startup:
//! 1. Build the dependency graph from every declaration; a cycle aborts startup
//! 2. Walk the modules in topological order, one at a time:
//!    `Unregistered -> Registering` (construct, pre-register), then dependency
//!    and version checks, then the post-register hook, then `Registered`
//! 3. Any failure moves only that module to `Failed`; dependents that require
//!    it fail in turn, everything else carries on
//!
//! Teardown walks the registered modules in reverse order. Each module is
//! retired before its shutdown hook runs: its handlers are removed, calls
//! already in progress are waited out, and deliveries from older snapshots
//! skip it. Streams and the broker close last.
//!
//! Modules get a publish-only broker handle; subscribing goes through the
//! context's staging so that a failed module never leaves a handler behind.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::context::ModuleContext;
use super::descriptor::{EngineModule, ModuleDescriptor};
use super::enablement::ActionEnablement;
use super::graph::topological_sort;
use crate::broker::{BROKER_VERSION, BrokerHandle, MessageBroker};
use crate::config::Config;
use crate::domain::Version;
use crate::error::{BrokerError, BrokerResult};
use crate::stream::StreamManager;

/// Name under which the broker itself is registered
pub const BROKER_MODULE: &str = "MessageBroker";

/// Lifecycle state of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModuleState {
    Unregistered,
    Registering,
    Registered,
    Failed,
}

impl std::fmt::Display for ModuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unregistered => "unregistered",
            Self::Registering => "registering",
            Self::Registered => "registered",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Point-in-time report for one module
#[derive(Debug, Clone, Serialize)]
pub struct ModuleStatus {
    pub name: String,
    pub version: Version,
    pub state: ModuleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

type ModuleFactory = Box<dyn FnOnce() -> eyre::Result<Box<dyn EngineModule>> + Send>;

/// A module descriptor plus the constructor for its implementation
pub struct ModuleDeclaration {
    descriptor: ModuleDescriptor,
    factory: ModuleFactory,
}

impl ModuleDeclaration {
    /// Declare a module built lazily by `factory`; a factory error fails the module
    pub fn new<M, F>(descriptor: ModuleDescriptor, factory: F) -> Self
    where
        M: EngineModule + 'static,
        F: FnOnce() -> eyre::Result<M> + Send + 'static,
    {
        Self {
            descriptor,
            factory: Box::new(move || factory().map(|m| Box::new(m) as Box<dyn EngineModule>)),
        }
    }

    /// Declare an already constructed module
    pub fn from_module<M>(descriptor: ModuleDescriptor, module: M) -> Self
    where
        M: EngineModule + 'static,
    {
        Self::new(descriptor, move || Ok(module))
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }
}

impl std::fmt::Debug for ModuleDeclaration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleDeclaration")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

struct ModuleEntry {
    descriptor: ModuleDescriptor,
    state: ModuleState,
    module: Option<Box<dyn EngineModule>>,
    error: Option<BrokerError>,
}

impl ModuleEntry {
    fn status(&self) -> ModuleStatus {
        ModuleStatus {
            name: self.descriptor.name.clone(),
            version: self.descriptor.version,
            state: self.state,
            error: self.error.as_ref().map(|e| e.to_string()),
        }
    }
}

/// Owns the broker, the stream manager and every module
pub struct EngineRegistry {
    broker: MessageBroker,
    streams: Arc<StreamManager>,
    enablement: Arc<dyn ActionEnablement>,
    /// Registration order; index 0 is the broker itself
    entries: Vec<ModuleEntry>,
    index: HashMap<String, usize>,
    shut_down: bool,
}

impl EngineRegistry {
    /// Build the broker and stream manager from `config`, then register `declarations`
    pub fn start(config: &Config, declarations: Vec<ModuleDeclaration>) -> BrokerResult<Self> {
        let broker = MessageBroker::new(config.broker.clone())?;
        let streams = Arc::new(StreamManager::new(config.streams.clone()));
        Self::start_with(broker, streams, Arc::new(config.modules.clone()), declarations)
    }

    /// Register `declarations` against an existing broker and stream manager
    ///
    /// Fails only with `CycleDetected`; per-module failures are reported
    /// through [`state`](Self::state) and [`states`](Self::states).
    pub fn start_with(
        broker: MessageBroker,
        streams: Arc<StreamManager>,
        enablement: Arc<dyn ActionEnablement>,
        declarations: Vec<ModuleDeclaration>,
    ) -> BrokerResult<Self> {
        debug!(count = declarations.len(), "EngineRegistry::start_with: called");

        let mut declarations = dedup_declarations(declarations);
        let descriptors: Vec<ModuleDescriptor> = declarations.iter().map(|d| d.descriptor.clone()).collect();
        let order = topological_sort(&descriptors).map_err(|cycle| {
            warn!(cycle = %cycle.join(" -> "), "Dependency cycle detected, no module registered");
            BrokerError::CycleDetected(cycle)
        })?;

        let mut registry = Self {
            broker,
            streams,
            enablement,
            entries: Vec::with_capacity(declarations.len() + 1),
            index: HashMap::new(),
            shut_down: false,
        };
        registry.push_entry(ModuleEntry {
            descriptor: ModuleDescriptor::new(BROKER_MODULE, BROKER_VERSION),
            state: ModuleState::Registered,
            module: None,
            error: None,
        });

        let mut factories: Vec<Option<ModuleFactory>> = Vec::with_capacity(declarations.len());
        for declaration in declarations.drain(..) {
            factories.push(Some(declaration.factory));
        }

        for idx in order {
            let entry_idx = registry.push_entry(ModuleEntry {
                descriptor: descriptors[idx].clone(),
                state: ModuleState::Unregistered,
                module: None,
                error: None,
            });
            if let Some(factory) = factories[idx].take() {
                registry.register(entry_idx, factory);
            }
        }

        let registered = registry
            .entries
            .iter()
            .filter(|e| e.state == ModuleState::Registered)
            .count();
        info!(
            registered,
            failed = registry.entries.len() - registered,
            "Engine registry started"
        );
        Ok(registry)
    }

    fn push_entry(&mut self, entry: ModuleEntry) -> usize {
        let idx = self.entries.len();
        self.index.insert(entry.descriptor.name.clone(), idx);
        self.entries.push(entry);
        idx
    }

    /// Run one module through its lifecycle
    fn register(&mut self, idx: usize, factory: ModuleFactory) {
        let descriptor = self.entries[idx].descriptor.clone();
        let name = descriptor.name.clone();
        self.entries[idx].state = ModuleState::Registering;
        debug!(module = %name, version = %descriptor.version, "EngineRegistry::register: registering");

        let live_dependencies = self.live_dependencies(&descriptor);
        let mut ctx = ModuleContext::new(
            descriptor.clone(),
            self.broker.handle().publish_only(),
            self.streams.clone(),
            self.enablement.clone(),
            live_dependencies,
        );

        let result = guarded(&name, "constructor", factory)
            .and_then(|mut module| {
                guarded(&name, "pre-register", || module.pre_register(&ctx))?;
                Ok(module)
            })
            .and_then(|module| {
                self.check_dependencies(&descriptor)?;
                Ok(module)
            })
            .and_then(|mut module| {
                guarded(&name, "post-register", || module.post_register(&mut ctx))?;
                self.commit(&name, &mut ctx)?;
                Ok(module)
            });

        let entry = &mut self.entries[idx];
        match result {
            Ok(module) => {
                entry.module = Some(module);
                entry.state = ModuleState::Registered;
                info!(module = %name, version = %descriptor.version, "Module registered");
            }
            Err(e) => {
                self.broker.retire_module(&name);
                warn!(module = %name, error = %e, "Module failed");
                entry.error = Some(e);
                entry.state = ModuleState::Failed;
            }
        }
    }

    /// Versions of dependencies that are registered
    fn live_dependencies(&self, descriptor: &ModuleDescriptor) -> HashMap<String, Version> {
        descriptor
            .dependency_names()
            .filter_map(|dep| {
                let entry = &self.entries[*self.index.get(dep)?];
                (entry.state == ModuleState::Registered).then(|| (dep.to_string(), entry.descriptor.version))
            })
            .collect()
    }

    /// Check the broker version and every declared dependency
    fn check_dependencies(&self, descriptor: &ModuleDescriptor) -> BrokerResult<()> {
        if BROKER_VERSION < descriptor.min_broker_version {
            return Err(BrokerError::VersionMismatch {
                module: descriptor.name.clone(),
                dependency: BROKER_MODULE.to_string(),
                required: descriptor.min_broker_version,
                actual: BROKER_VERSION,
            });
        }

        for dep in &descriptor.dependencies {
            let Some(&dep_idx) = self.index.get(&dep.name) else {
                if dep.optional {
                    debug!(module = %descriptor.name, dependency = %dep.name, "Optional dependency absent");
                    continue;
                }
                return Err(BrokerError::NotFound(format!(
                    "module {} required by {}",
                    dep.name, descriptor.name
                )));
            };

            let entry = &self.entries[dep_idx];
            if entry.state != ModuleState::Registered {
                if dep.optional {
                    debug!(module = %descriptor.name, dependency = %dep.name, state = %entry.state, "Optional dependency not live");
                    continue;
                }
                return Err(BrokerError::ModuleFailed {
                    module: descriptor.name.clone(),
                    reason: format!("required dependency {} is {}", dep.name, entry.state),
                });
            }

            if !entry.descriptor.version.satisfies(&dep.min_version) {
                return Err(BrokerError::VersionMismatch {
                    module: descriptor.name.clone(),
                    dependency: dep.name.clone(),
                    required: dep.min_version,
                    actual: entry.descriptor.version,
                });
            }
        }

        Ok(())
    }

    /// Make the staged subscriptions reachable
    fn commit(&self, name: &str, ctx: &mut ModuleContext) -> BrokerResult<()> {
        let staged = ctx.take_staged();
        debug!(module = %name, count = staged.len(), "EngineRegistry::commit: called");
        for (slot, handler) in staged {
            self.broker.subscriptions().subscribe(slot, name, handler)?;
        }
        Ok(())
    }

    /// The broker owned by this registry
    pub fn broker(&self) -> &MessageBroker {
        &self.broker
    }

    pub fn handle(&self) -> BrokerHandle {
        self.broker.handle()
    }

    pub fn streams(&self) -> &Arc<StreamManager> {
        &self.streams
    }

    pub fn state(&self, name: &str) -> Option<ModuleState> {
        self.index.get(name).map(|&idx| self.entries[idx].state)
    }

    /// Why a module failed, if it did
    pub fn error(&self, name: &str) -> Option<&BrokerError> {
        self.index.get(name).and_then(|&idx| self.entries[idx].error.as_ref())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.state(name) == Some(ModuleState::Registered)
    }

    /// Status of every module in registration order
    pub fn states(&self) -> Vec<ModuleStatus> {
        self.entries.iter().map(ModuleEntry::status).collect()
    }

    /// Module names in registration order, broker first
    pub fn registration_order(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.descriptor.name.as_str()).collect()
    }

    /// Tear every module down in reverse registration order; idempotent
    ///
    /// Blocks while a module's handlers are still running, so it must not be
    /// called from inside a handler.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        info!("Engine registry shutting down");

        for entry in self.entries.iter_mut().skip(1).rev() {
            let Some(mut module) = entry.module.take() else {
                continue;
            };
            let name = entry.descriptor.name.clone();

            let removed = self.broker.retire_module(&name);
            debug!(module = %name, removed, "EngineRegistry::shutdown: module retired");

            if let Err(e) = guarded(&name, "shutdown", || module.shutdown()) {
                warn!(module = %name, error = %e, "Module shutdown failed");
            }
            drop(module);
            entry.state = ModuleState::Unregistered;
        }

        self.streams.close_all();
        self.broker.shutdown();
        if let Some(entry) = self.entries.first_mut() {
            entry.state = ModuleState::Unregistered;
        }
        info!("Engine registry shut down");
    }
}

impl Drop for EngineRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Keep the first declaration of each name; the broker's name is reserved
fn dedup_declarations(declarations: Vec<ModuleDeclaration>) -> Vec<ModuleDeclaration> {
    let mut seen = std::collections::HashSet::new();
    seen.insert(BROKER_MODULE.to_string());

    declarations
        .into_iter()
        .filter(|d| {
            let fresh = seen.insert(d.descriptor.name.clone());
            if !fresh {
                warn!(module = %d.descriptor.name, "Duplicate module declaration ignored");
            }
            fresh
        })
        .collect()
}

/// Run module code, turning errors and panics into `ModuleFailed`
fn guarded<T>(module: &str, stage: &str, f: impl FnOnce() -> eyre::Result<T>) -> BrokerResult<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(BrokerError::ModuleFailed {
            module: module.to_string(),
            reason: format!("{} failed: {:#}", stage, e),
        }),
        Err(_) => Err(BrokerError::ModuleFailed {
            module: module.to_string(),
            reason: format!("{} panicked", stage),
        }),
    }
}
