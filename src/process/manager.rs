use serde_json::Value;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::launcher::announce_online;
use crate::active::{self, ActiveHandle, ActiveRole};
use crate::broker::{address, Broker};
use crate::core::config::ProcessConfig;
use crate::core::errors::{ClusterError, Result};
use crate::core::task::TaskGuard;
use crate::instance::{Hooks, Instance, InstanceRef, InstanceSetup, RouteSetup};
use crate::unit::{ConcurrentUnit, EntryRegistry, Side, UnitEvent, GLOBAL_ENTRIES};

/// A unit template and how many copies of it the process hosts
#[derive(Debug, Clone)]
pub struct UnitDecl {
    pub setup: InstanceSetup,
    pub replicas: usize,
}

/// Declaration of one worker process.
#[derive(Debug, Clone, Default)]
pub struct ProcessSetup {
    pub instance: InstanceSetup,
    pub units: Vec<UnitDecl>,
    entries: Option<EntryRegistry>,
}

impl ProcessSetup {
    pub fn new(tag_name: impl Into<String>) -> Self {
        Self {
            instance: InstanceSetup::new().tag_name(tag_name),
            ..Default::default()
        }
    }

    pub fn value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.instance = self.instance.value(key, value);
        self
    }

    /// Route addressed to the process as a whole
    pub fn route(mut self, route: RouteSetup) -> Self {
        self.instance = self.instance.route(route);
        self
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.instance = self.instance.hooks(hooks);
        self
    }

    /// Declare a unit running the entry point named by `setup.file_path`.
    ///
    /// Routes on `setup` are not served: a unit's routes belong in its entry
    /// point, on the unit built through [`UnitContext::unit`](crate::unit::UnitContext::unit).
    pub fn unit(self, setup: InstanceSetup) -> Self {
        self.unit_replicas(setup, 1)
    }

    /// Stamp `replicas` copies of `setup`; at least one is always declared
    pub fn unit_replicas(mut self, setup: InstanceSetup, replicas: usize) -> Self {
        self.units.push(UnitDecl {
            setup,
            replicas: replicas.max(1),
        });
        self
    }

    /// Resolve unit entry points from `entries` instead of the global registry
    pub fn entries(mut self, entries: EntryRegistry) -> Self {
        self.entries = Some(entries);
        self
    }

    pub fn tag_name(&self) -> &str {
        self.instance.tag_name.as_deref().unwrap_or_default()
    }

    pub fn declared_units(&self) -> usize {
        self.units.iter().map(|unit| unit.replicas).sum()
    }
}

impl From<&ProcessConfig> for ProcessSetup {
    fn from(config: &ProcessConfig) -> Self {
        let mut setup = ProcessSetup::new(config.tag_name.clone());
        setup.instance.store = config.store.clone();
        for unit in &config.units {
            let mut instance = InstanceSetup::new().file_path(unit.file_path.clone());
            instance.tag_name = unit.tag_name.clone();
            instance.store = unit.store.clone();
            setup = setup.unit_replicas(instance, unit.replicas);
        }
        setup
    }
}

/// Owns the concurrent units hosted by one worker process.
pub struct ProcessManager {
    instance: Instance,
    units: HashMap<String, ConcurrentUnit>,
    declared_units: usize,
    online_units: Arc<AtomicUsize>,
    connected: bool,
    monitor: Option<TaskGuard>,
}

impl ProcessManager {
    /// Build and initialize every declared unit.
    ///
    /// `connected` means this process was launched by a controller: the
    /// manager then writes the online handshake and fires `on_ready`.
    /// Must run inside a tokio runtime.
    #[instrument(skip(setup, broker), fields(process = %setup.tag_name()))]
    pub fn new(setup: ProcessSetup, broker: Arc<dyn Broker>, connected: bool) -> Self {
        let declared_units = setup.declared_units();
        let entries = setup.entries.unwrap_or_else(|| GLOBAL_ENTRIES.clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut manager = Self {
            instance: Instance::new(setup.instance, broker.clone()),
            units: HashMap::new(),
            declared_units,
            online_units: Arc::new(AtomicUsize::new(0)),
            connected,
            monitor: None,
        };

        let monitor = tokio::spawn(monitor_units(
            manager.reference(),
            manager.hooks().clone(),
            declared_units,
            manager.online_units.clone(),
            events_rx,
        ));
        manager.monitor = Some(TaskGuard::new(&monitor));

        for decl in setup.units {
            let template = ConcurrentUnit::with_side(decl.setup, broker.clone(), Side::Requesting)
                .with_entries(entries.clone())
                .with_events(events_tx.clone());
            let mut batch: Vec<ConcurrentUnit> = (1..decl.replicas).map(|_| template.replicate()).collect();
            batch.push(template);

            for mut unit in batch {
                if let Err(err) = unit.init(Some(manager.reference())) {
                    manager.report_error(&err);
                }
                manager.units.insert(unit.id().to_string(), unit);
            }
        }

        manager.listen();
        info!(
            process = %manager.tag_name(),
            units = manager.units.len(),
            routes = manager.routes().len(),
            "Process manager started"
        );

        if connected {
            if let Err(e) = announce_online() {
                manager.report_error(&ClusterError::io("writing online handshake", e));
            }
            manager.hooks().ready(&manager.reference());
        }

        active::install(
            ActiveRole::ProcessManager,
            ActiveHandle::new(manager.reference(), broker),
        );
        manager
    }

    /// Address of this process: `"/" + tag_name`
    pub fn path(&self) -> String {
        address::process_path(self.tag_name())
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn online_unit_count(&self) -> usize {
        self.online_units.load(Ordering::SeqCst)
    }

    pub fn declared_unit_count(&self) -> usize {
        self.declared_units
    }

    pub fn units(&self) -> &HashMap<String, ConcurrentUnit> {
        &self.units
    }

    pub fn unit(&self, id: &str) -> Option<&ConcurrentUnit> {
        self.units.get(id)
    }

    pub fn terminate_units(&self) {
        for unit in self.units.values() {
            unit.terminate();
        }
    }

    /// Forward the end of the hosting process: `on_error` for a failure,
    /// then `on_close`.
    pub fn shutdown(&mut self, result: Result<()>) {
        self.terminate_units();
        self.stop_listening();
        self.monitor = None;
        if let Err(err) = result {
            self.report_error(&err);
        }
        info!(process = %self.tag_name(), "Process manager closed");
        self.hooks().close(&self.reference());
    }
}

impl Deref for ProcessManager {
    type Target = Instance;

    fn deref(&self) -> &Self::Target {
        &self.instance
    }
}

impl DerefMut for ProcessManager {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.instance
    }
}

impl std::fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessManager")
            .field("instance", &self.instance)
            .field("units", &self.units.len())
            .field("online_units", &self.online_unit_count())
            .field("connected", &self.connected)
            .finish()
    }
}

/// Count unit online signals and surface unit failures on the manager.
async fn monitor_units(
    owner: InstanceRef,
    hooks: Hooks,
    declared: usize,
    online: Arc<AtomicUsize>,
    mut events: mpsc::UnboundedReceiver<UnitEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            UnitEvent::Online(unit) => {
                match online.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < declared).then_some(n + 1)
                }) {
                    Ok(previous) => debug!(
                        process = %owner.tag_name,
                        unit = %unit.tag_name,
                        online = previous + 1,
                        declared = declared,
                        "Unit online"
                    ),
                    Err(_) => warn!(process = %owner.tag_name, unit = %unit.tag_name, "Ignoring extra unit online signal"),
                }
            }
            UnitEvent::Errored(unit, message) => {
                let err = ClusterError::spawn(unit.tag_name, message).with_context("unit_id", unit.id);
                warn!(process = %owner.tag_name, error = %err, "Unit failed");
                hooks.error(&owner, &err);
            }
            UnitEvent::Closed(unit) => debug!(process = %owner.tag_name, unit = %unit.tag_name, "Unit closed"),
        }
    }
}
