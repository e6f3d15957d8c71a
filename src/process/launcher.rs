use crate::error::LaunchError;
use crate::process::ProcessSpec;
use std::future::Future;
use std::io::ErrorKind;
use std::pin::Pin;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;

/// A freshly spawned process with its stdout/stderr pipes still attached
#[derive(Debug)]
pub struct LaunchedProcess {
    /// The child process handle
    pub child: Child,

    /// Process ID assigned by the OS
    pub pid: u32,
}

pub type LaunchFuture = Pin<Box<dyn Future<Output = Result<LaunchedProcess, LaunchError>> + Send>>;

/// Seam between the controller and process creation
pub trait Launcher: Send + Sync + 'static {
    fn launch(&self, spec: &ProcessSpec) -> LaunchFuture;
}

/// Launches real OS processes via `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct OsLauncher;

impl Launcher for OsLauncher {
    fn launch(&self, spec: &ProcessSpec) -> LaunchFuture {
        let result = launch(spec);
        Box::pin(async move { result })
    }
}

/// Spawn a process from its launch descriptor
///
/// The environment is inherited and then overlaid with `spec.env`. Stdin is
/// closed; stdout and stderr are piped back to the caller for log capture.
///
/// Must be called from within a tokio runtime.
pub fn launch(spec: &ProcessSpec) -> Result<LaunchedProcess, LaunchError> {
    let mut command = Command::new(&spec.executable);

    command
        .args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(ref cwd) = spec.cwd {
        command.current_dir(cwd);
    }

    let child = command
        .spawn()
        .map_err(|e| classify_spawn_error(spec, e))?;

    let pid = child.id().ok_or_else(|| {
        LaunchError::SpawnFailed(format!("no PID for process '{}'", spec.name))
    })?;

    debug!(name = %spec.name, pid, "launched {}", spec.executable.display());

    Ok(LaunchedProcess { child, pid })
}

fn classify_spawn_error(spec: &ProcessSpec, error: std::io::Error) -> LaunchError {
    let target = spec.executable.display().to_string();
    match error.kind() {
        ErrorKind::NotFound => LaunchError::NotFound(target),
        ErrorKind::PermissionDenied => LaunchError::PermissionDenied(target),
        _ => LaunchError::SpawnFailed(format!("{}: {}", target, error)),
    }
}
