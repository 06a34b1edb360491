use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::broker::Broker;
use crate::instance::{InstanceRef, InstanceSetup};

use super::unit::{ConcurrentUnit, Side};

/// One-shot blob handed to a spawned unit at boot: its tag, the store
/// snapshot of the requesting unit and the identity of the requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitBoot {
    pub tag_name: String,
    pub file_path: String,
    pub store: HashMap<String, Value>,
    pub parent: InstanceRef,
}

tokio::task_local! {
    static UNIT_BOOT: UnitBoot;
}

/// Boot blob of the unit whose entry point is running on this task, if any
pub fn current_boot() -> Option<UnitBoot> {
    UNIT_BOOT.try_with(|boot| boot.clone()).ok()
}

/// Run `future` with `boot` visible through [`current_boot`]
pub(crate) fn with_boot<F: Future>(boot: UnitBoot, future: F) -> impl Future<Output = F::Output> {
    UNIT_BOOT.scope(boot, future)
}

/// What an entry point receives when its unit is spawned.
#[derive(Clone)]
pub struct UnitContext {
    pub boot: UnitBoot,
    pub broker: Arc<dyn Broker>,
}

impl UnitContext {
    /// Build the spawned-side unit for this context.
    ///
    /// Unlike [`ConcurrentUnit::new`] this works from any task, including
    /// ones the entry point spawned itself.
    pub fn unit(&self, setup: InstanceSetup) -> ConcurrentUnit {
        ConcurrentUnit::with_side(setup, self.broker.clone(), Side::Spawned(self.boot.clone()))
    }
}

pub type UnitEntry = Arc<dyn Fn(UnitContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Entry points a requesting unit can launch, keyed by `file_path`.
#[derive(Clone, Default)]
pub struct EntryRegistry {
    entries: Arc<DashMap<String, UnitEntry>>,
}

impl EntryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&self, name: impl Into<String>, entry: F)
    where
        F: Fn(UnitContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let entry: UnitEntry = Arc::new(move |ctx| entry(ctx).boxed());
        self.entries.insert(name.into(), entry);
    }

    pub fn get(&self, name: &str) -> Option<UnitEntry> {
        self.entries.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl std::fmt::Debug for EntryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryRegistry")
            .field("entries", &self.names())
            .finish()
    }
}

lazy_static::lazy_static! {
    pub static ref GLOBAL_ENTRIES: EntryRegistry = EntryRegistry::new();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot() -> UnitBoot {
        UnitBoot {
            tag_name: "worker".to_string(),
            file_path: "./worker-entry".to_string(),
            store: HashMap::new(),
            parent: InstanceRef {
                id: "p".to_string(),
                tag_name: "api".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_boot_is_task_scoped() {
        assert!(current_boot().is_none());
        let seen = with_boot(boot(), async { current_boot() }).await;
        assert_eq!(seen.unwrap().tag_name, "worker");
        assert!(current_boot().is_none());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = EntryRegistry::new();
        registry.register("./worker-entry", |_ctx| async { anyhow::Ok(()) });
        assert!(registry.contains("./worker-entry"));
        assert!(registry.get("./missing").is_none());
        assert_eq!(registry.names(), vec!["./worker-entry".to_string()]);
    }
}
