//! EngineBus - in-process message broker for independently built engine modules
//!
//! Feature modules exchange topic/action-addressed messages through a single
//! broker owned by the engine registry. Large binary payloads travel through
//! managed streams referenced by id.
//!
//! # Core Concepts
//!
//! - **Publish/Subscribe**: Handlers on a (topic, action) slot run in registration order
//! - **Send-and-Wait**: A request suspends until its correlated reply or a timeout
//! - **Best-Effort Replies**: A reply nobody waits for is dropped, never an error
//! - **Ordered Lifecycle**: Modules register in dependency order and tear down in reverse
//!
//! # Modules
//!
//! - [`broker`] - Message broker, subscription table and broker handle
//! - [`stream`] - Stream manager for out-of-band binary payloads
//! - [`registry`] - Module descriptors, dependency graph and lifecycle
//! - [`domain`] - Messages, versions and identifiers
//! - [`config`] - Configuration types and loading
//! - [`error`] - Error taxonomy
//! - [`logging`] - Tracing subscriber setup

pub mod broker;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod registry;
pub mod stream;

// Re-export commonly used types
pub use broker::{
    ACTION_ANY, BROKER_VERSION, BrokerConfig, BrokerHandle, BrokerMetrics, DispatchMode, MessageBroker,
    MessageHandler, Slot, Subscriber, SubscriptionTable,
};
pub use config::{Config, ModulesConfig};
pub use domain::{MESSAGE_VERSION, Message, MessageKind, StreamId, Version, generate_correlation_id};
pub use error::{BrokerError, BrokerResult, ErrorKind};
pub use registry::{
    ActionEnablement, AllEnabled, BROKER_MODULE, Dependency, EngineModule, EngineRegistry, ModuleContext,
    ModuleDeclaration, ModuleDescriptor, ModuleState, ModuleStatus, topological_sort, validate_dependency_graph,
};
pub use stream::{Stream, StreamConfig, StreamManager, StreamMode};
