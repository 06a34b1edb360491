// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
    pub mod logging;
    pub mod task;
}

pub mod broker;   // Path-addressed publish/subscribe transport
pub mod instance; // Addressable instances and route tables
pub mod unit;     // Concurrent units launched from entry points
pub mod process;  // Worker processes and their unit managers
pub mod cluster;  // Orchestrator and cluster declarations

pub mod active;
pub mod capability;

// Re-exports for convenience
pub use async_trait::async_trait;
pub use crate::core::config::{ClusterConfig, ProcessConfig, UnitConfig};
pub use crate::core::errors::{ClusterError, Result};
pub use crate::core::logging::init_tracing;

pub use broker::{address, Broker, Envelope, LocalBroker, Subscription};
pub use capability::{capability_routes, Capability};
pub use cluster::{ClusterSetup, Orchestrator, Role};
pub use instance::{Completion, Hooks, Instance, InstanceRef, InstanceSetup, Route, RouteSetup, RouteTable};
pub use process::{CommandLauncher, ProcessDescriptor, ProcessLauncher, ProcessManager, ProcessSetup};
pub use unit::{ConcurrentUnit, EntryRegistry, Side, UnitBoot, UnitContext, UnitState, GLOBAL_ENTRIES};
