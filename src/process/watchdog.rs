use crate::error::WatchdogSampleError;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Default sampling period
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(2);

/// Reads resident memory for a PID
pub trait MemorySampler: Send + 'static {
    /// `Ok(None)` means the process no longer exists
    fn sample(&mut self, pid: u32) -> Result<Option<u64>, WatchdogSampleError>;
}

/// Builds a fresh sampler for each supervised generation
pub type SamplerFactory = Arc<dyn Fn() -> Box<dyn MemorySampler> + Send + Sync>;

pub fn sysinfo_sampler_factory() -> SamplerFactory {
    Arc::new(|| -> Box<dyn MemorySampler> { Box::new(SysinfoSampler::new()) })
}

/// Memory sampler backed by `sysinfo`
pub struct SysinfoSampler {
    system: System,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SysinfoSampler {
    fn sample(&mut self, pid: u32) -> Result<Option<u64>, WatchdogSampleError> {
        let sys_pid = Pid::from_u32(pid);

        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );

        match self.system.process(sys_pid) {
            // An unreaped zombie has no memory worth watching
            Some(process) if process.status() == ProcessStatus::Zombie => Ok(None),
            Some(process) => Ok(Some(process.memory())),
            None => Ok(None),
        }
    }
}

/// Emitted once per generation when RSS exceeds the ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverLimit {
    pub generation: u64,
    pub pid: u32,
    pub rss: u64,
    pub limit: u64,
}

/// Why a watchdog task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// Over-limit signal sent; sampling suspended for this generation
    Signalled,
    /// Process vanished; exit handling belongs to the controller
    ProcessGone,
    /// The controller stopped listening
    ControllerGone,
}

/// Periodic memory sampler for one live process
pub struct MemoryWatchdog {
    pub pid: u32,
    pub generation: u64,
    pub limit: u64,
    pub interval: Duration,
}

impl MemoryWatchdog {
    pub fn new(pid: u32, generation: u64, limit: u64, interval: Duration) -> Self {
        Self {
            pid,
            generation,
            limit,
            interval,
        }
    }

    /// Start sampling on a background task.
    ///
    /// The first sample is taken immediately. A single sample above `limit`
    /// sends one [`OverLimit`] and ends the task; the controller starts a new
    /// watchdog for the relaunched process.
    pub fn spawn<E>(
        self,
        mut sampler: Box<dyn MemorySampler>,
        events: mpsc::Sender<E>,
    ) -> JoinHandle<WatchdogOutcome>
    where
        E: From<OverLimit> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                match sampler.sample(self.pid) {
                    Ok(Some(rss)) if rss > self.limit => {
                        warn!(
                            pid = self.pid,
                            generation = self.generation,
                            rss,
                            limit = self.limit,
                            "memory ceiling exceeded"
                        );
                        let signal = OverLimit {
                            generation: self.generation,
                            pid: self.pid,
                            rss,
                            limit: self.limit,
                        };
                        if events.send(E::from(signal)).await.is_err() {
                            return WatchdogOutcome::ControllerGone;
                        }
                        return WatchdogOutcome::Signalled;
                    }
                    Ok(Some(rss)) => {
                        debug!(pid = self.pid, rss, "memory sample");
                    }
                    Ok(None) => {
                        debug!(pid = self.pid, "process gone, watchdog stopping");
                        return WatchdogOutcome::ProcessGone;
                    }
                    Err(e) => {
                        warn!("skipping memory sample: {}", e);
                    }
                }

                if events.is_closed() {
                    return WatchdogOutcome::ControllerGone;
                }
            }
        })
    }
}
