//! Single-slot supervisor controller.
//!
//! The controller is one tokio task that owns the [`SupervisedProcess`]. Operator
//! commands and every internal event (launch results, exits, watchdog signals,
//! relaunch timers, log notices) arrive on one channel and are handled strictly
//! in arrival order, so no two transitions are ever in flight at once.
//!
//! ```text
//! Stopped ──start──► Starting ──ok──► Running ──exit / over-limit──► Exited
//!                       │                                              │
//!                       └──err──► Failed ──decide──┬── Restart(delay) ─┘──► Starting
//!                                                  └── GiveUp ──► Stopped
//! ```
//!
//! Events name the process generation they refer to. Anything tagged with a
//! generation other than the live one is dropped. Relaunch timers and in-flight
//! launches carry an epoch that `stop` and `restart` bump.

use crate::config::ProcessConfig;
use crate::error::{LaunchError, Result, WardenError};
use crate::logs::{LogNotice, LogSink, LogStreamManager, StreamKind};
use crate::process::launcher::{LaunchedProcess, Launcher, OsLauncher};
use crate::process::restart::{RestartDecision, RestartPolicy};
use crate::process::types::{ProcessHandle, ProcessSpec, ProcessState, StatusReport, SupervisedProcess};
use crate::process::watchdog::{
    sysinfo_sampler_factory, MemoryWatchdog, OverLimit, SamplerFactory, WatchdogOutcome,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How long shutdown waits for log pipes to reach end-of-stream
const LOG_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Operator commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Restart,
    Status,
    /// Stop the process and end the controller task
    Shutdown,
}

/// Reported by the exit-waiter task when a child terminates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub generation: u64,
    pub code: Option<i32>,
}

enum Event {
    Command {
        command: Command,
        reply: oneshot::Sender<StatusReport>,
    },
    Launched {
        epoch: u64,
        result: std::result::Result<LaunchedProcess, LaunchError>,
    },
    Exited(ProcessExit),
    OverLimit(OverLimit),
    RelaunchDue {
        epoch: u64,
    },
    Log(LogNotice),
}

impl From<OverLimit> for Event {
    fn from(signal: OverLimit) -> Self {
        Event::OverLimit(signal)
    }
}

impl From<LogNotice> for Event {
    fn from(notice: LogNotice) -> Self {
        Event::Log(notice)
    }
}

impl From<ProcessExit> for Event {
    fn from(exit: ProcessExit) -> Self {
        Event::Exited(exit)
    }
}

/// Builder for the controller task
pub struct Supervisor {
    config: ProcessConfig,
    launcher: Arc<dyn Launcher>,
    samplers: SamplerFactory,
}

impl Supervisor {
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            launcher: Arc::new(OsLauncher),
            samplers: sysinfo_sampler_factory(),
        }
    }

    /// Replace the process launcher
    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Replace how memory samplers are built for each generation
    pub fn with_sampler_factory(mut self, samplers: SamplerFactory) -> Self {
        self.samplers = samplers;
        self
    }

    /// Validate the config, open the log files and start the controller task.
    ///
    /// With `autostart` set the first launch begins immediately.
    pub async fn spawn(self) -> Result<SupervisorHandle> {
        let config = self.config;
        config.validate()?;

        let date_format = config.date_format()?;
        let sink = LogSink::open(
            &config.out_path(),
            &config.error_path(),
            &date_format,
            config.max_log_size.map(|size| size.as_u64()),
        )
        .await?;

        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let controller = Controller {
            name: config.name.clone(),
            spec: config.process_spec(),
            policy: config.restart_policy(),
            stop_signal: config.stop_signal.clone(),
            grace: config.stop_timeout(),
            watchdog_interval: config.watchdog_interval(),
            slot: SupervisedProcess::new(),
            logs: LogStreamManager::new(sink),
            launcher: self.launcher,
            samplers: self.samplers,
            events: events.clone(),
            epoch: 0,
            watchdog: None,
            degraded_streams: HashSet::new(),
        };

        tokio::spawn(controller.run(rx, config.autostart));

        Ok(SupervisorHandle { events })
    }
}

/// Cloneable operator interface to a running controller.
///
/// Every command replies with the status snapshot taken right after it was
/// handled. Dropping all handles does not stop supervision; use
/// [`shutdown`](Self::shutdown).
#[derive(Clone)]
pub struct SupervisorHandle {
    events: mpsc::Sender<Event>,
}

impl SupervisorHandle {
    pub async fn start(&self) -> Result<StatusReport> {
        self.send(Command::Start).await
    }

    /// Stop the process. A no-op on an already stopped slot.
    pub async fn stop(&self) -> Result<StatusReport> {
        self.send(Command::Stop).await
    }

    /// Stop then start, clearing the consecutive-failure counter
    pub async fn restart(&self) -> Result<StatusReport> {
        self.send(Command::Restart).await
    }

    pub async fn status(&self) -> Result<StatusReport> {
        self.send(Command::Status).await
    }

    /// Stop the process, flush logs and end the controller task
    pub async fn shutdown(&self) -> Result<StatusReport> {
        self.send(Command::Shutdown).await
    }

    pub async fn send(&self, command: Command) -> Result<StatusReport> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(Event::Command { command, reply })
            .await
            .map_err(|_| WardenError::SupervisorGone)?;
        rx.await.map_err(|_| WardenError::SupervisorGone)
    }
}

struct Controller {
    name: String,
    spec: ProcessSpec,
    policy: RestartPolicy,
    stop_signal: String,
    grace: Duration,
    watchdog_interval: Duration,
    slot: SupervisedProcess,
    logs: LogStreamManager,
    launcher: Arc<dyn Launcher>,
    samplers: SamplerFactory,
    events: mpsc::Sender<Event>,
    epoch: u64,
    watchdog: Option<JoinHandle<WatchdogOutcome>>,
    degraded_streams: HashSet<StreamKind>,
}

impl Controller {
    async fn run(mut self, mut rx: mpsc::Receiver<Event>, autostart: bool) {
        info!(name = %self.name, "supervisor started");

        if autostart {
            self.handle_start();
        }

        while let Some(event) = rx.recv().await {
            match event {
                Event::Command { command, reply } => {
                    self.handle_command(command).await;
                    let _ = reply.send(self.status());
                    if command == Command::Shutdown {
                        break;
                    }
                }
                Event::Launched { epoch, result } => self.on_launched(epoch, result).await,
                Event::Exited(exit) => self.on_exit(exit),
                Event::OverLimit(signal) => self.on_over_limit(signal).await,
                Event::RelaunchDue { epoch } => self.on_relaunch_due(epoch),
                Event::Log(notice) => self.on_log_notice(notice),
            }
        }

        info!(name = %self.name, "supervisor stopped");
    }

    fn status(&self) -> StatusReport {
        self.slot.status(&self.name)
    }

    async fn handle_command(&mut self, command: Command) {
        debug!(name = %self.name, ?command, state = %self.slot.state, "command");

        match command {
            Command::Start => self.handle_start(),
            Command::Stop => self.handle_stop().await,
            Command::Restart => self.handle_restart().await,
            Command::Status => {}
            Command::Shutdown => {
                self.handle_stop().await;
                if tokio::time::timeout(LOG_DRAIN_GRACE, self.logs.join())
                    .await
                    .is_err()
                {
                    debug!(name = %self.name, "log pipes still open at shutdown, detaching");
                }
                self.logs.detach().await;
            }
        }
    }

    fn handle_start(&mut self) {
        match self.slot.state {
            ProcessState::Running | ProcessState::Starting => {
                debug!(name = %self.name, "start ignored, already {}", self.slot.state);
            }
            _ => {
                self.slot.consecutive_failures = 0;
                self.slot.exhausted = false;
                self.begin_launch();
            }
        }
    }

    async fn handle_stop(&mut self) {
        // Invalidates pending relaunch timers and any launch still in flight
        self.epoch += 1;

        if self.slot.handle.is_some() {
            info!(name = %self.name, "stopping process");
            self.slot.last_exit_code = self.terminate().await;
        }

        if self.slot.state != ProcessState::Stopped {
            info!(name = %self.name, "process stopped");
        }
        self.slot.state = ProcessState::Stopped;
    }

    async fn handle_restart(&mut self) {
        self.epoch += 1;

        if self.slot.handle.is_some() {
            info!(name = %self.name, "restarting process on operator request");
            self.slot.last_exit_code = self.terminate().await;
            self.slot.restarts += 1;
        }

        self.slot.consecutive_failures = 0;
        self.slot.exhausted = false;
        self.begin_launch();
    }

    fn begin_launch(&mut self) {
        self.epoch += 1;
        let epoch = self.epoch;
        self.slot.state = ProcessState::Starting;

        debug!(name = %self.name, epoch, "launching {}", self.spec.executable.display());

        let launch = self.launcher.launch(&self.spec);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = launch.await;
            // On a closed channel the child is dropped and killed
            let _ = events.send(Event::Launched { epoch, result }).await;
        });
    }

    async fn on_launched(
        &mut self,
        epoch: u64,
        result: std::result::Result<LaunchedProcess, LaunchError>,
    ) {
        if epoch != self.epoch || self.slot.state != ProcessState::Starting {
            if let Ok(launched) = result {
                warn!(
                    name = %self.name,
                    pid = launched.pid,
                    "launch finished after it was cancelled, killing process"
                );
                let mut child = launched.child;
                let _ = child.kill().await;
            }
            return;
        }

        match result {
            Ok(launched) => self.attach(launched),
            Err(e) => {
                error!(name = %self.name, "launch failed: {}", e);
                self.slot.state = ProcessState::Failed;
                self.slot.last_error = Some(e.to_string());
                self.slot.record_failure();
                self.apply(self.policy.decide(self.slot.consecutive_failures));
            }
        }
    }

    fn attach(&mut self, launched: LaunchedProcess) {
        let LaunchedProcess { mut child, pid } = launched;

        self.slot.generation += 1;
        let generation = self.slot.generation;

        self.logs.attach(
            generation,
            child.stdout.take(),
            child.stderr.take(),
            self.events.clone(),
        );

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(None);
        let events = self.events.clone();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                // Fires on an explicit kill and when the handle is dropped
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(pid, "failed to wait for process: {}", e);
                    None
                }
            };

            let _ = exit_tx.send(Some(code));
            let _ = events.send(Event::from(ProcessExit { generation, code })).await;
        });

        self.slot.handle = Some(ProcessHandle::new(pid, generation, kill_tx, exit_rx));
        self.slot.state = ProcessState::Running;
        self.start_watchdog(pid, generation);

        info!(name = %self.name, pid, generation, "process running");
    }

    fn start_watchdog(&mut self, pid: u32, generation: u64) {
        self.stop_watchdog();

        if let Some(limit) = self.policy.max_memory {
            let watchdog = MemoryWatchdog::new(pid, generation, limit, self.watchdog_interval);
            self.watchdog = Some(watchdog.spawn((self.samplers)(), self.events.clone()));
        }
    }

    fn stop_watchdog(&mut self) {
        if let Some(task) = self.watchdog.take() {
            task.abort();
        }
    }

    fn on_exit(&mut self, exit: ProcessExit) {
        if !self.slot.is_current(exit.generation) {
            debug!(name = %self.name, generation = exit.generation, "dropping stale exit");
            return;
        }

        self.stop_watchdog();
        self.slot.handle = None;
        self.slot.last_exit_code = exit.code;
        self.slot.state = ProcessState::Exited;
        self.slot.record_failure();

        warn!(
            name = %self.name,
            code = ?exit.code,
            failures = self.slot.consecutive_failures,
            "process exited"
        );

        self.apply(self.policy.decide(self.slot.consecutive_failures));
    }

    async fn on_over_limit(&mut self, signal: OverLimit) {
        if self.slot.state != ProcessState::Running || !self.slot.is_current(signal.generation) {
            debug!(name = %self.name, generation = signal.generation, "dropping stale over-limit signal");
            return;
        }

        warn!(
            name = %self.name,
            pid = signal.pid,
            rss = signal.rss,
            limit = signal.limit,
            "memory ceiling exceeded, recycling process"
        );

        self.slot.last_exit_code = self.terminate().await;
        self.slot.state = ProcessState::Exited;
        self.slot.last_error = Some(format!(
            "resident memory {} bytes exceeded ceiling of {} bytes",
            signal.rss, signal.limit
        ));

        // Delay from the streak before this recycle, limit checked after it
        let decision = self.policy.decide_recycle(self.slot.consecutive_failures);
        self.slot.record_failure();
        self.apply(decision);
    }

    fn on_relaunch_due(&mut self, epoch: u64) {
        let waiting = matches!(self.slot.state, ProcessState::Exited | ProcessState::Failed);
        if epoch != self.epoch || !waiting {
            debug!(name = %self.name, epoch, "dropping cancelled relaunch");
            return;
        }

        self.begin_launch();
    }

    fn on_log_notice(&mut self, notice: LogNotice) {
        match notice {
            LogNotice::Degraded { stream, error } => {
                warn!(name = %self.name, %stream, "log output degraded: {}", error);
                self.degraded_streams.insert(stream);
            }
            LogNotice::Recovered { stream } => {
                self.degraded_streams.remove(&stream);
            }
        }
        self.slot.log_degraded = !self.degraded_streams.is_empty();
    }

    fn apply(&mut self, decision: RestartDecision) {
        match decision {
            RestartDecision::Restart(delay) => {
                self.epoch += 1;
                let epoch = self.epoch;

                info!(
                    name = %self.name,
                    delay_ms = delay.as_millis() as u64,
                    failures = self.slot.consecutive_failures,
                    "scheduling restart"
                );

                let events = self.events.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(Event::RelaunchDue { epoch }).await;
                });
            }
            RestartDecision::GiveUp if !self.policy.enabled => {
                info!(name = %self.name, "autorestart disabled, leaving process stopped");
                self.slot.state = ProcessState::Stopped;
            }
            RestartDecision::GiveUp => {
                let exhausted =
                    WardenError::PolicyExhausted(self.name.clone(), self.slot.consecutive_failures);
                error!(
                    name = %self.name,
                    restarts = self.slot.restarts,
                    alert = true,
                    "{}; operator action required",
                    exhausted
                );
                self.slot.exhausted = true;
                self.slot.last_error = Some(exhausted.to_string());
                self.slot.state = ProcessState::Stopped;
            }
        }
    }

    /// Request-then-wait-then-force termination of the live process.
    /// Returns the exit code, `None` if killed by a signal or nothing was running.
    async fn terminate(&mut self) -> Option<i32> {
        self.stop_watchdog();
        let mut handle = self.slot.handle.take()?;

        if !handle.has_exited() {
            self.send_stop_signal(&mut handle);

            match tokio::time::timeout(self.grace, handle.wait()).await {
                Ok(code) => return code,
                Err(_) => {
                    warn!(
                        name = %self.name,
                        pid = handle.pid,
                        "process did not exit within {:?}, killing",
                        self.grace
                    );
                    handle.force_kill();
                }
            }
        }

        handle.wait().await
    }

    #[cfg(unix)]
    fn send_stop_signal(&self, handle: &mut ProcessHandle) {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        match parse_signal(&self.stop_signal) {
            Ok(signal) => {
                debug!(name = %self.name, pid = handle.pid, "sending {}", self.stop_signal);
                if let Err(e) = kill(Pid::from_raw(handle.pid as i32), signal) {
                    // ESRCH: already gone, the waiter reports the exit
                    debug!(pid = handle.pid, "stop signal not delivered: {}", e);
                }
            }
            Err(e) => {
                warn!("{}; killing instead", e);
                handle.force_kill();
            }
        }
    }

    #[cfg(not(unix))]
    fn send_stop_signal(&self, handle: &mut ProcessHandle) {
        handle.force_kill();
    }
}

#[cfg(unix)]
fn parse_signal(signal_name: &str) -> Result<nix::sys::signal::Signal> {
    use nix::sys::signal::Signal;

    match signal_name {
        "SIGTERM" => Ok(Signal::SIGTERM),
        "SIGINT" => Ok(Signal::SIGINT),
        "SIGQUIT" => Ok(Signal::SIGQUIT),
        "SIGKILL" => Ok(Signal::SIGKILL),
        "SIGHUP" => Ok(Signal::SIGHUP),
        "SIGUSR1" => Ok(Signal::SIGUSR1),
        "SIGUSR2" => Ok(Signal::SIGUSR2),
        _ => Err(WardenError::SignalError(format!(
            "Invalid signal name: {}",
            signal_name
        ))),
    }
}

#[cfg(test)]
mod tests;
