use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tokio::sync::{oneshot, watch};

/// Immutable launch descriptor, built once from configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub name: String,
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Overrides; these win over the inherited environment
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Exited,
    Failed,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Exited => write!(f, "exited"),
            ProcessState::Failed => write!(f, "failed"),
        }
    }
}

/// Controller-side handle to one live OS process.
///
/// The child itself is owned by an exit-waiter task; this handle can only ask
/// for a kill and observe the exit.
#[derive(Debug)]
pub struct ProcessHandle {
    pub pid: u32,
    pub generation: u64,
    pub started_at: SystemTime,
    kill: Option<oneshot::Sender<()>>,
    exit: watch::Receiver<Option<Option<i32>>>,
}

impl ProcessHandle {
    pub(crate) fn new(
        pid: u32,
        generation: u64,
        kill: oneshot::Sender<()>,
        exit: watch::Receiver<Option<Option<i32>>>,
    ) -> Self {
        Self {
            pid,
            generation,
            started_at: SystemTime::now(),
            kill: Some(kill),
            exit,
        }
    }

    /// Ask the exit-waiter to SIGKILL the child. Idempotent.
    pub fn force_kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Wait for the process to exit and return its exit code (None when killed by a signal)
    pub async fn wait(&mut self) -> Option<i32> {
        match self.exit.wait_for(|status| status.is_some()).await {
            Ok(status) => (*status).flatten(),
            // Waiter task gone without reporting; the child was dropped and killed
            Err(_) => None,
        }
    }

    pub fn uptime(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.started_at)
            .unwrap_or(Duration::from_secs(0))
    }
}

/// The one supervised slot. Owned exclusively by the controller task.
#[derive(Debug)]
pub struct SupervisedProcess {
    pub state: ProcessState,
    pub handle: Option<ProcessHandle>,
    /// Lifetime restart count; never decreases
    pub restarts: u32,
    /// Cleared only by an operator start/restart
    pub consecutive_failures: u32,
    pub last_exit_code: Option<i32>,
    pub last_error: Option<String>,
    /// Set when the restart policy gave up
    pub exhausted: bool,
    /// Bumped on every successful launch
    pub generation: u64,
    pub log_degraded: bool,
}

impl SupervisedProcess {
    pub fn new() -> Self {
        Self {
            state: ProcessState::Stopped,
            handle: None,
            restarts: 0,
            consecutive_failures: 0,
            last_exit_code: None,
            last_error: None,
            exhausted: false,
            generation: 0,
            log_degraded: false,
        }
    }

    /// True when `generation` names the currently live process
    pub fn is_current(&self, generation: u64) -> bool {
        self.handle
            .as_ref()
            .map(|h| h.generation == generation)
            .unwrap_or(false)
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.restarts += 1;
    }

    pub fn status(&self, name: &str) -> StatusReport {
        StatusReport {
            name: name.to_string(),
            state: self.state,
            pid: self.handle.as_ref().map(|h| h.pid),
            restarts: self.restarts,
            consecutive_failures: self.consecutive_failures,
            last_exit_code: self.last_exit_code,
            uptime: self.handle.as_ref().map(|h| h.uptime()),
            exhausted: self.exhausted,
            last_error: self.last_error.clone(),
            log_degraded: self.log_degraded,
        }
    }
}

impl Default for SupervisedProcess {
    fn default() -> Self {
        Self::new()
    }
}

/// Operator-facing snapshot of the slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub name: String,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub restarts: u32,
    pub consecutive_failures: u32,
    pub last_exit_code: Option<i32>,
    pub uptime: Option<Duration>,
    pub exhausted: bool,
    pub last_error: Option<String>,
    pub log_degraded: bool,
}
