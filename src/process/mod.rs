// Process module - Single-slot supervision lifecycle

pub mod launcher;
pub mod restart;
pub mod supervisor;
mod types;
pub mod watchdog;

pub use launcher::{launch, LaunchedProcess, Launcher, OsLauncher};
pub use restart::{RestartDecision, RestartPolicy};
pub use supervisor::{Supervisor, SupervisorHandle};
pub use types::{ProcessHandle, ProcessSpec, ProcessState, StatusReport, SupervisedProcess};
pub use watchdog::{MemorySampler, MemoryWatchdog, OverLimit, SamplerFactory, SysinfoSampler};
