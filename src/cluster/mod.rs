//! Cluster bring-up: the orchestrator and its static declaration.

pub mod orchestrator;

pub use orchestrator::{ClusterSetup, Orchestrator, Role};
