//! Launching worker processes and watching their lifecycle.
//!
//! A worker learns which process declaration it runs from the
//! `MESHWORK_PROCESS_TAG` environment variable and reports that it is
//! connected by writing [`ONLINE_MARKER`] on its stdout.

use chrono::NaiveDateTime;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::core::errors::{ClusterError, Result};

pub const PROCESS_TAG_ENV: &str = "MESHWORK_PROCESS_TAG";
pub const ONLINE_MARKER: &str = "meshwork:online";

/// Tell the controller this worker is up. Only the worker calls this.
pub fn announce_online() -> std::io::Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", ONLINE_MARKER)?;
    stdout.flush()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessEvent {
    pub tag: String,
    pub kind: ProcessEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEventKind {
    Online,
    Exited { code: Option<i32> },
    Failed { message: String },
}

impl ProcessEvent {
    pub fn new(tag: impl Into<String>, kind: ProcessEventKind) -> Self {
        Self {
            tag: tag.into(),
            kind,
        }
    }
}

/// Controller-side record of a launched worker
#[derive(Debug)]
pub struct ProcessDescriptor {
    pub tag: String,
    pub pid: Option<u32>,
    pub launched_at: NaiveDateTime,
    kill: Option<oneshot::Sender<()>>,
}

impl ProcessDescriptor {
    pub fn new(tag: impl Into<String>, pid: Option<u32>, kill: Option<oneshot::Sender<()>>) -> Self {
        Self {
            tag: tag.into(),
            pid,
            launched_at: chrono::Local::now().naive_local(),
            kill,
        }
    }

    /// Ask the watcher to kill the worker. Returns false if already asked.
    pub fn terminate(&mut self) -> bool {
        match self.kill.take() {
            Some(kill) => kill.send(()).is_ok(),
            None => false,
        }
    }
}

/// Seam between the orchestrator and the OS
pub trait ProcessLauncher: Send + Sync {
    /// Start the worker for `tag`; lifecycle signals go to `events`
    fn launch(&self, tag: &str, events: mpsc::UnboundedSender<ProcessEvent>) -> Result<ProcessDescriptor>;
}

/// Launches workers as child processes of a command.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Re-execute the running binary with the same arguments
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| ClusterError::io("resolving current executable", e))?;
        Ok(Self {
            program,
            args: std::env::args().skip(1).collect(),
            env: Vec::new(),
        })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl ProcessLauncher for CommandLauncher {
    fn launch(&self, tag: &str, events: mpsc::UnboundedSender<ProcessEvent>) -> Result<ProcessDescriptor> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(PROCESS_TAG_ENV, tag)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let child = command.spawn().map_err(|e| {
            ClusterError::spawn_with_source(tag, "failed to launch worker process", e)
                .with_context("program", self.program.display().to_string())
        })?;
        let pid = child.id();
        info!(process = %tag, pid = ?pid, "Launched worker process");

        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(watch(tag.to_string(), child, kill_rx, events));
        Ok(ProcessDescriptor::new(tag, pid, Some(kill_tx)))
    }
}

/// Forward a child's handshake and exit to `events`. A dropped kill sender
/// leaves the child running.
async fn watch(
    tag: String,
    mut child: Child,
    mut kill: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    let emit = |kind| {
        if events.send(ProcessEvent::new(tag.clone(), kind)).is_err() {
            debug!(process = %tag, "Nobody is aggregating process events");
        }
    };
    let mut kill_armed = true;
    let mut killed = false;

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            let kill_now = tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) if line.trim() == ONLINE_MARKER => emit(ProcessEventKind::Online),
                        Ok(Some(line)) => info!(process = %tag, "{}", line),
                        Ok(None) => break,
                        Err(e) => {
                            warn!(process = %tag, error = %e, "Failed to read worker output");
                            break;
                        }
                    }
                    continue;
                }
                signal = &mut kill, if kill_armed => signal.is_ok(),
            };
            kill_armed = false;
            if kill_now {
                killed |= start_kill(&tag, &mut child);
            }
        }
    }

    let status = loop {
        let kill_now = tokio::select! {
            status = child.wait() => break status,
            signal = &mut kill, if kill_armed => signal.is_ok(),
        };
        kill_armed = false;
        if kill_now {
            killed |= start_kill(&tag, &mut child);
        }
    };

    match status {
        Ok(status) if status.success() || killed => {
            info!(process = %tag, code = ?status.code(), "Worker process exited");
            emit(ProcessEventKind::Exited { code: status.code() });
        }
        Ok(status) => emit(ProcessEventKind::Failed {
            message: format!("worker exited with {}", status),
        }),
        Err(e) => emit(ProcessEventKind::Failed {
            message: format!("failed to wait for worker: {}", e),
        }),
    }
}

fn start_kill(tag: &str, child: &mut Child) -> bool {
    match child.start_kill() {
        Ok(()) => {
            info!(process = %tag, "Killing worker process");
            true
        }
        Err(e) => {
            warn!(process = %tag, error = %e, "Failed to kill worker process");
            false
        }
    }
}
