//! Engine service registry
//!
//! Feature modules declare a name, a version, the broker version they need,
//! their dependencies and the actions they conditionally enable. The registry
//! orders them by dependency, runs their lifecycle hooks, and tears them down
//! in reverse.

mod context;
mod descriptor;
mod enablement;
mod engine;
mod graph;

pub use context::ModuleContext;
pub use descriptor::{Dependency, EngineModule, ModuleDescriptor};
pub use enablement::{ActionEnablement, AllEnabled};
pub use engine::{BROKER_MODULE, EngineRegistry, ModuleDeclaration, ModuleState, ModuleStatus};
pub use graph::{topological_sort, validate_dependency_graph};
