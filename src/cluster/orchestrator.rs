use serde_json::Value;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

use crate::active::{self, ActiveHandle, ActiveRole};
use crate::broker::Broker;
use crate::core::config::{validate_process_tags, ClusterConfig};
use crate::core::errors::{ClusterError, Result};
use crate::core::task::TaskGuard;
use crate::instance::{Hooks, Instance, InstanceRef, InstanceSetup, RouteSetup};
use crate::process::{
    CommandLauncher, ProcessDescriptor, ProcessEvent, ProcessEventKind, ProcessLauncher, ProcessManager,
    ProcessSetup, PROCESS_TAG_ENV,
};

/// Which side of the launch this process is on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// The original process: launches the workers
    Controller,
    /// A launched worker, told its process tag at boot
    Worker { tag: String },
}

impl Role {
    /// Read the role from the process environment
    pub fn detect() -> Self {
        match std::env::var(PROCESS_TAG_ENV) {
            Ok(tag) if !tag.is_empty() => Self::Worker { tag },
            _ => Self::Controller,
        }
    }

    pub fn is_controller(&self) -> bool {
        matches!(self, Self::Controller)
    }
}

/// Static declaration of the whole topology
#[derive(Debug, Clone, Default)]
pub struct ClusterSetup {
    pub instance: InstanceSetup,
    pub processes: Vec<ProcessSetup>,
    pub fork_budget: Option<usize>,
}

impl ClusterSetup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag_name(mut self, tag_name: impl Into<String>) -> Self {
        self.instance = self.instance.tag_name(tag_name);
        self
    }

    pub fn value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.instance = self.instance.value(key, value);
        self
    }

    /// Cluster-wide route, served on the controller
    pub fn route(mut self, route: RouteSetup) -> Self {
        self.instance = self.instance.route(route);
        self
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.instance = self.instance.hooks(hooks);
        self
    }

    pub fn process(mut self, process: ProcessSetup) -> Self {
        self.processes.push(process);
        self
    }

    pub fn fork_budget(mut self, budget: usize) -> Self {
        self.fork_budget = Some(budget);
        self
    }

    /// Build from a loaded declaration. Cluster values are inherited by
    /// every process; a process value with the same key wins.
    pub fn from_config(config: &ClusterConfig) -> Result<Self> {
        config.validate()?;
        let mut instance = InstanceSetup::new();
        instance.tag_name = config.tag_name.clone();
        instance.store = config.store.clone();

        let processes = config
            .processes
            .iter()
            .map(|process| {
                let mut setup = ProcessSetup::from(process);
                let mut store = config.store.clone();
                store.extend(setup.instance.store);
                setup.instance.store = store;
                setup
            })
            .collect();

        Ok(Self {
            instance,
            processes,
            fork_budget: config.fork_budget,
        })
    }

    pub fn process_mut(&mut self, tag: &str) -> Option<&mut ProcessSetup> {
        self.processes.iter_mut().find(|process| process.tag_name() == tag)
    }

    /// Budget in effect: the configured value or the number of CPU cores
    pub fn budget(&self) -> usize {
        self.fork_budget.unwrap_or_else(num_cpus::get)
    }

    /// Check what a worker relies on to find its declaration: process tags
    /// must be non-empty, free of `/` and unique.
    pub fn validate(&self) -> Result<()> {
        if self.fork_budget == Some(0) {
            return Err(ClusterError::configuration_field(
                "fork_budget must be greater than 0",
                "fork_budget",
            ));
        }
        validate_process_tags(self.processes.iter().map(|process| process.tag_name()))
    }
}

/// Top-level controller.
///
/// On the controller it launches one worker per declared process and
/// aggregates their online signals; inside a worker it builds only the
/// process manager matching the worker's tag.
pub struct Orchestrator {
    instance: Instance,
    role: Role,
    declared: usize,
    online: Arc<AtomicUsize>,
    processes: HashMap<String, ProcessDescriptor>,
    manager: Option<ProcessManager>,
    aggregator: Option<TaskGuard>,
}

impl Orchestrator {
    /// Detect the role from the environment and launch workers by
    /// re-executing the current binary.
    pub fn new(setup: ClusterSetup, broker: Arc<dyn Broker>) -> Result<Self> {
        let launcher: Arc<dyn ProcessLauncher> = Arc::new(CommandLauncher::current_exe()?);
        Self::with_launcher(setup, broker, Role::detect(), launcher)
    }

    #[instrument(skip(setup, broker, launcher))]
    pub fn with_launcher(
        setup: ClusterSetup,
        broker: Arc<dyn Broker>,
        role: Role,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Result<Self> {
        let budget = setup.budget();
        let validated = setup.validate();
        let ClusterSetup {
            instance, processes, ..
        } = setup;

        let mut orchestrator = Self {
            instance: Instance::new(instance, broker.clone()),
            role: role.clone(),
            declared: processes.len(),
            online: Arc::new(AtomicUsize::new(0)),
            processes: HashMap::new(),
            manager: None,
            aggregator: None,
        };

        // nothing is launched for an invalid declaration
        if let Err(err) = validated {
            error!(cluster = %orchestrator.tag_name(), error = %err, "Invalid cluster declaration");
            orchestrator.report_error(&err);
            return Err(err);
        }

        match role {
            Role::Controller => orchestrator.bring_up(&processes, budget, launcher.as_ref())?,
            Role::Worker { tag } => orchestrator.adopt(processes, &tag, broker.clone())?,
        }

        active::install(
            ActiveRole::Orchestrator,
            ActiveHandle::new(orchestrator.reference(), broker),
        );
        Ok(orchestrator)
    }

    fn bring_up(&mut self, processes: &[ProcessSetup], budget: usize, launcher: &dyn ProcessLauncher) -> Result<()> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let aggregator = tokio::spawn(aggregate(
            self.reference(),
            self.hooks().clone(),
            self.declared,
            self.online.clone(),
            events_rx,
        ));
        self.aggregator = Some(TaskGuard::new(&aggregator));

        for (index, process) in processes.iter().enumerate() {
            let tag = process.tag_name();
            if index >= budget {
                let err = ClusterError::construction(tag, self.declared, budget);
                error!(cluster = %self.tag_name(), launched = self.processes.len(), error = %err, "Aborting bring-up");
                self.report_error(&err);
                return Err(err);
            }
            match launcher.launch(tag, events_tx.clone()) {
                Ok(descriptor) => {
                    self.processes.insert(tag.to_string(), descriptor);
                }
                Err(err) => self.report_error(&err),
            }
        }

        self.listen();
        info!(cluster = %self.tag_name(), processes = self.processes.len(), budget = budget, "Cluster launched");
        if self.declared == 0 {
            self.hooks().ready(&self.reference());
        }
        Ok(())
    }

    fn adopt(&mut self, processes: Vec<ProcessSetup>, tag: &str, broker: Arc<dyn Broker>) -> Result<()> {
        let Some(setup) = processes.into_iter().find(|process| process.tag_name() == tag) else {
            let err = ClusterError::configuration_field(
                format!("no process declared with tag '{}'", tag),
                "processes.tag_name",
            );
            self.report_error(&err);
            return Err(err);
        };

        let mut manager = ProcessManager::new(setup, broker, true);
        manager.set_parent(self.reference())?;
        info!(cluster = %self.tag_name(), process = %tag, "Worker adopted process declaration");
        self.manager = Some(manager);
        Ok(())
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn is_controller(&self) -> bool {
        self.role.is_controller()
    }

    pub fn online_process_count(&self) -> usize {
        self.online.load(Ordering::SeqCst)
    }

    pub fn declared_process_count(&self) -> usize {
        self.declared
    }

    /// Launched workers keyed by tag. `None` inside a worker, which is not
    /// authoritative for the topology.
    pub fn processes(&self) -> Option<&HashMap<String, ProcessDescriptor>> {
        self.role.is_controller().then_some(&self.processes)
    }

    /// The process manager this worker hosts
    pub fn manager(&self) -> Option<&ProcessManager> {
        self.manager.as_ref()
    }

    pub fn manager_mut(&mut self) -> Option<&mut ProcessManager> {
        self.manager.as_mut()
    }

    /// Kill every launched worker, or terminate the local units inside a
    /// worker. Returns how many kill requests were sent.
    pub fn terminate_all(&mut self) -> usize {
        if let Some(manager) = &self.manager {
            manager.terminate_units();
        }
        self.processes
            .values_mut()
            .map(|descriptor| descriptor.terminate())
            .filter(|sent| *sent)
            .count()
    }
}

impl Deref for Orchestrator {
    type Target = Instance;

    fn deref(&self) -> &Self::Target {
        &self.instance
    }
}

impl DerefMut for Orchestrator {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.instance
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("instance", &self.instance)
            .field("role", &self.role)
            .field("declared", &self.declared)
            .field("online", &self.online_process_count())
            .finish()
    }
}

/// Fold worker lifecycle events into the online count; `on_ready` fires
/// once, on the signal that first reaches the declared total.
async fn aggregate(
    owner: InstanceRef,
    hooks: Hooks,
    declared: usize,
    online: Arc<AtomicUsize>,
    mut events: mpsc::UnboundedReceiver<ProcessEvent>,
) {
    while let Some(event) = events.recv().await {
        match event.kind {
            ProcessEventKind::Online => {
                match online.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < declared).then_some(n + 1)
                }) {
                    Ok(previous) => {
                        let now = previous + 1;
                        info!(process = %event.tag, online = now, declared = declared, "Worker process online");
                        if now == declared {
                            info!(cluster = %owner.tag_name, "All worker processes online");
                            hooks.ready(&owner);
                        }
                    }
                    Err(_) => warn!(process = %event.tag, "Ignoring extra process online signal"),
                }
            }
            ProcessEventKind::Failed { message } => {
                let err = ClusterError::spawn(event.tag.clone(), message).with_context("cluster", owner.tag_name.clone());
                error!(process = %event.tag, error = %err, "Worker process failed");
                hooks.error(&owner, &err);
            }
            ProcessEventKind::Exited { code } => {
                info!(process = %event.tag, code = ?code, "Worker process exited");
            }
        }
    }
}
