//! Worker processes: the launcher used by the controller and the manager
//! that hosts units inside a worker.

pub mod launcher;
pub mod manager;

pub use launcher::{
    announce_online, CommandLauncher, ProcessDescriptor, ProcessEvent, ProcessEventKind, ProcessLauncher,
    ONLINE_MARKER, PROCESS_TAG_ENV,
};
pub use manager::{ProcessManager, ProcessSetup, UnitDecl};
