use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, instrument, warn};

use super::entry::{current_boot, with_boot, EntryRegistry, UnitBoot, UnitContext, UnitEntry, GLOBAL_ENTRIES};
use crate::broker::Broker;
use crate::core::errors::{ClusterError, Result};
use crate::instance::{Hooks, Instance, InstanceRef, InstanceSetup};

/// Which end of a spawn a unit lives on.
#[derive(Debug, Clone, PartialEq)]
pub enum Side {
    /// Owns the execution context and launches it on `init`
    Requesting,
    /// Runs inside the launched context, seeded from the boot blob
    Spawned(UnitBoot),
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Uninitialized = 0,
    Initialized = 1,
    Closed = 2,
    Errored = 3,
}

impl UnitState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Initialized,
            2 => Self::Closed,
            3 => Self::Errored,
            _ => Self::Uninitialized,
        }
    }
}

/// State shared between a unit and its supervisor task
#[derive(Debug, Clone)]
struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(UnitState::Uninitialized as u8)))
    }

    fn get(&self) -> UnitState {
        UnitState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, state: UnitState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// Lifecycle signals forwarded to whoever aggregates units (the process manager).
#[derive(Debug, Clone, PartialEq)]
pub enum UnitEvent {
    Online(InstanceRef),
    Closed(InstanceRef),
    Errored(InstanceRef, String),
}

/// One concurrently scheduled execution context.
///
/// The requesting side launches the entry point registered under
/// `file_path` as a tokio task; the spawned side is the unit constructed
/// inside that entry point, which adopts the inherited store and serves
/// its routes.
pub struct ConcurrentUnit {
    instance: Instance,
    setup: InstanceSetup,
    side: Side,
    state: StateCell,
    execution: Option<AbortHandle>,
    entries: EntryRegistry,
    events: Option<mpsc::UnboundedSender<UnitEvent>>,
}

impl ConcurrentUnit {
    /// Build a unit, picking the spawned side when called from inside a
    /// running entry point.
    pub fn new(setup: InstanceSetup, broker: Arc<dyn Broker>) -> Self {
        let side = match current_boot() {
            Some(boot) => Side::Spawned(boot),
            None => Side::Requesting,
        };
        Self::with_side(setup, broker, side)
    }

    pub fn with_side(setup: InstanceSetup, broker: Arc<dyn Broker>, side: Side) -> Self {
        let mut base = setup.clone();
        // Routes are installed by init on the spawned side only
        base.routes.clear();
        if side == Side::Requesting && !setup.routes.is_empty() {
            warn!(
                file_path = setup.file_path.as_deref().unwrap_or_default(),
                routes = setup.routes.len(),
                "Routes on a requesting unit are not served; declare them in the entry point"
            );
        }
        if let Side::Spawned(boot) = &side {
            base.tag_name.get_or_insert_with(|| boot.tag_name.clone());
            base.file_path.get_or_insert_with(|| boot.file_path.clone());
        }
        Self {
            instance: Instance::new(base, broker),
            setup,
            side,
            state: StateCell::new(),
            execution: None,
            entries: GLOBAL_ENTRIES.clone(),
            events: None,
        }
    }

    /// Resolve entry points from `entries` instead of the global registry
    pub fn with_entries(mut self, entries: EntryRegistry) -> Self {
        self.entries = entries;
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<UnitEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn side(&self) -> &Side {
        &self.side
    }

    pub fn is_requesting(&self) -> bool {
        self.side == Side::Requesting
    }

    pub fn state(&self) -> UnitState {
        self.state.get()
    }

    /// Perform the only state transition of the unit.
    ///
    /// Does not block: readiness, exit and failure of a launched context
    /// are reported later through the hooks. Must run inside a tokio runtime.
    #[instrument(skip(self, parent), fields(unit = %self.instance.tag_name()))]
    pub fn init(&mut self, parent: Option<InstanceRef>) -> Result<()> {
        if self.state() != UnitState::Uninitialized {
            return Err(ClusterError::validation(format!(
                "Unit {} is already initialized",
                self.tag_name()
            )));
        }
        if let Some(parent) = parent {
            self.instance.set_parent(parent)?;
        }
        match self.side.clone() {
            Side::Requesting => self.launch(),
            Side::Spawned(boot) => self.adopt(boot),
        }
    }

    fn launch(&mut self) -> Result<()> {
        let entry = match self.resolve_entry() {
            Ok(entry) => entry,
            Err(err) => {
                self.state.set(UnitState::Errored);
                self.report_error(&err);
                return Err(err);
            }
        };

        let boot = UnitBoot {
            tag_name: self.tag_name().to_string(),
            file_path: self.file_path().to_string(),
            store: self.snapshot_values(),
            parent: self.reference(),
        };
        let ctx = UnitContext {
            boot: boot.clone(),
            broker: self.broker().clone(),
        };

        let (online_tx, online_rx) = oneshot::channel();
        let execution = tokio::spawn(with_boot(boot, async move {
            let _ = online_tx.send(());
            entry(ctx).await
        }));
        self.execution = Some(execution.abort_handle());
        self.state.set(UnitState::Initialized);
        info!(unit = %self.tag_name(), file_path = %self.file_path(), "Launched unit");

        let supervisor = Supervisor {
            owner: self.reference(),
            file_path: self.file_path().to_string(),
            hooks: self.hooks().clone(),
            state: self.state.clone(),
            events: self.events.clone(),
        };
        tokio::spawn(supervisor.run(online_rx, execution));
        Ok(())
    }

    fn resolve_entry(&self) -> Result<UnitEntry> {
        let file_path = self.file_path();
        if file_path.is_empty() {
            return Err(ClusterError::spawn(self.tag_name(), "unit has no entry point"));
        }
        self.entries.get(file_path).ok_or_else(|| {
            ClusterError::spawn(self.tag_name(), "entry point is not registered")
                .with_context("file_path", file_path)
        })
    }

    fn adopt(&mut self, boot: UnitBoot) -> Result<()> {
        self.instance.adopt_values(boot.store);
        if self.parent().is_none() && boot.parent.id != self.id() {
            self.instance.set_parent(boot.parent)?;
        }
        for route in self.setup.routes.clone() {
            self.instance.register_route(route);
        }
        self.instance.listen();
        self.state.set(UnitState::Initialized);
        debug!(unit = %self.tag_name(), routes = self.routes().len(), "Spawned unit adopted boot data");
        Ok(())
    }

    /// Abort the execution context. No-op on the spawned side.
    pub fn terminate(&self) {
        match (&self.side, &self.execution) {
            (Side::Requesting, Some(execution)) => {
                info!(unit = %self.tag_name(), "Terminating unit");
                execution.abort();
            }
            (Side::Requesting, None) => debug!(unit = %self.tag_name(), "Unit was never launched"),
            (Side::Spawned(_), _) => debug!(unit = %self.tag_name(), "Spawned unit cannot terminate itself"),
        }
    }

    /// Terminate only: relaunching is left to an external supervisor.
    pub fn restart(&self) {
        self.terminate();
        if self.is_requesting() {
            info!(unit = %self.tag_name(), "Unit terminated for restart; relaunch is external");
        }
    }

    /// A new uninitialized unit with the same setup and a fresh id
    pub fn replicate(&self) -> Self {
        let mut replica = Self::with_side(self.setup.clone(), self.broker().clone(), self.side.clone());
        replica.entries = self.entries.clone();
        replica.events = self.events.clone();
        replica
    }
}

impl Deref for ConcurrentUnit {
    type Target = Instance;

    fn deref(&self) -> &Self::Target {
        &self.instance
    }
}

impl DerefMut for ConcurrentUnit {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.instance
    }
}

impl std::fmt::Debug for ConcurrentUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentUnit")
            .field("instance", &self.instance)
            .field("requesting", &self.is_requesting())
            .field("state", &self.state())
            .finish()
    }
}

/// Wires a launched context's signals to the requesting unit's hooks.
struct Supervisor {
    owner: InstanceRef,
    file_path: String,
    hooks: Hooks,
    state: StateCell,
    events: Option<mpsc::UnboundedSender<UnitEvent>>,
}

impl Supervisor {
    async fn run(self, online: oneshot::Receiver<()>, execution: JoinHandle<anyhow::Result<()>>) {
        if online.await.is_ok() {
            debug!(unit = %self.owner.tag_name, "Unit online");
            self.hooks.ready(&self.owner);
            self.emit(UnitEvent::Online(self.owner.clone()));
        }

        let failure = match execution.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) if e.is_cancelled() => None,
            Err(e) => Some(crate::instance::panic_message(e.into_panic().as_ref())),
        };

        match failure {
            None => {
                self.state.set(UnitState::Closed);
                info!(unit = %self.owner.tag_name, "Unit closed");
            }
            Some(message) => {
                self.state.set(UnitState::Errored);
                error!(unit = %self.owner.tag_name, error = %message, "Unit failed");
                let err = ClusterError::spawn(&self.owner.tag_name, message.clone())
                    .with_context("file_path", &self.file_path);
                self.hooks.error(&self.owner, &err);
                self.emit(UnitEvent::Errored(self.owner.clone(), message));
            }
        }

        self.hooks.close(&self.owner);
        self.emit(UnitEvent::Closed(self.owner.clone()));
    }

    fn emit(&self, event: UnitEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                warn!(unit = %self.owner.tag_name, "Unit event receiver is gone");
            }
        }
    }
}
