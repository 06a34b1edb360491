//! Concurrent units: tokio tasks launched from registered entry points.

pub mod entry;
pub mod unit;

pub use entry::{current_boot, EntryRegistry, UnitBoot, UnitContext, UnitEntry, GLOBAL_ENTRIES};
pub use unit::{ConcurrentUnit, Side, UnitEvent, UnitState};
