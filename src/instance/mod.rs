//! Addressable instances: identity, key/value store, route table,
//! lifecycle hooks and the outbound publish primitive shared by every
//! component of the cluster.

pub mod hooks;
pub mod instance;
pub mod routes;

pub use hooks::Hooks;
pub use instance::{Instance, InstanceRef, InstanceSetup};
pub use routes::{Completion, Route, RouteController, RouteSetup, RouteTable};

pub(crate) use instance::panic_message;
