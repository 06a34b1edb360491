//! Process-scoped registry of the instances that represent this process.
//!
//! Populated once at bring-up and read through [`get`] / [`orchestrator`],
//! so code deep inside a unit can publish on behalf of the process without
//! holding a handle to the orchestrator.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::broker::{Broker, Envelope};
use crate::instance::InstanceRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActiveRole {
    Orchestrator,
    ProcessManager,
    Messenger,
}

/// Publish-only view of an installed instance
#[derive(Clone)]
pub struct ActiveHandle {
    instance: InstanceRef,
    broker: Arc<dyn Broker>,
}

impl ActiveHandle {
    pub fn new(instance: InstanceRef, broker: Arc<dyn Broker>) -> Self {
        Self { instance, broker }
    }

    pub fn instance(&self) -> &InstanceRef {
        &self.instance
    }

    pub fn publish<T: Serialize + ?Sized>(&self, path: &str, data: &T) {
        match Envelope::encode(path, self.instance.id.clone(), data) {
            Ok(envelope) => self.broker.publish(envelope),
            Err(e) => debug!(instance = %self.instance.tag_name, path = path, error = %e, "Dropping unserializable payload"),
        }
    }
}

impl std::fmt::Debug for ActiveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveHandle")
            .field("instance", &self.instance)
            .finish()
    }
}

lazy_static::lazy_static! {
    static ref ACTIVE: DashMap<ActiveRole, ActiveHandle> = DashMap::new();
}

/// Install `handle` for `role`. The first install wins; later ones return false.
pub fn install(role: ActiveRole, handle: ActiveHandle) -> bool {
    match ACTIVE.entry(role) {
        Entry::Occupied(existing) => {
            debug!(role = ?role, active = %existing.get().instance.tag_name, "Role already installed");
            false
        }
        Entry::Vacant(slot) => {
            debug!(role = ?role, instance = %handle.instance.tag_name, "Installed active instance");
            slot.insert(handle);
            true
        }
    }
}

pub fn get(role: ActiveRole) -> Option<ActiveHandle> {
    ACTIVE.get(&role).map(|handle| handle.value().clone())
}

/// The orchestrator of this process, once one has been built
pub fn orchestrator() -> Option<ActiveHandle> {
    get(ActiveRole::Orchestrator)
}
