use super::*;
use crate::config::ByteSize;
use crate::error::WatchdogSampleError;
use crate::process::launcher::{launch, LaunchFuture};
use crate::process::watchdog::MemorySampler;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tempfile::TempDir;

const MB: u64 = 1024 * 1024;

fn create_test_config(dir: &Path, script: &str, args: &[&str]) -> ProcessConfig {
    let mut config = ProcessConfig::new("test-app", script);
    config.args = args.iter().map(|a| a.to_string()).collect();
    config.autostart = false;
    config.autorestart = true;
    config.backoff_ms = vec![0, 20];
    config.kill_timeout_ms = 500;
    config.out_file = Some(dir.join("out.log"));
    config.error_file = Some(dir.join("error.log"));
    config
}

async fn wait_for_status<F>(handle: &SupervisorHandle, predicate: F) -> StatusReport
where
    F: Fn(&StatusReport) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = handle.status().await.unwrap();
        if predicate(&status) {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting, last status: {:?}",
            status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|l| l.to_string())
        .collect()
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

struct FixedSampler(u64);

impl MemorySampler for FixedSampler {
    fn sample(&mut self, _pid: u32) -> std::result::Result<Option<u64>, WatchdogSampleError> {
        Ok(Some(self.0))
    }
}

/// Reports 150MB for the first `bloated` generations and 10MB afterwards
fn bloated_generations(calls: Arc<AtomicUsize>, bloated: usize) -> SamplerFactory {
    Arc::new(move || -> Box<dyn MemorySampler> {
        let rss = if calls.fetch_add(1, Ordering::SeqCst) < bloated {
            150 * MB
        } else {
            10 * MB
        };
        Box::new(FixedSampler(rss))
    })
}

/// Drops a file the script below polls for; it answers with one `tick` line
async fn emit_tick(dir: &Path) {
    let trigger = dir.join("go");
    std::fs::write(&trigger, b"").unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while trigger.exists() {
        assert!(tokio::time::Instant::now() < deadline, "script never consumed trigger");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

const TICK_SCRIPT: &str =
    "i=0; while true; do if [ -f go ]; then rm -f go; i=$((i+1)); echo tick$i; fi; sleep 0.02; done";

/// Holds every launch for `delay` before spawning
struct DelayedLauncher {
    delay: Duration,
    launched_pid: Arc<Mutex<Option<u32>>>,
}

impl Launcher for DelayedLauncher {
    fn launch(&self, spec: &ProcessSpec) -> LaunchFuture {
        let spec = spec.clone();
        let delay = self.delay;
        let launched_pid = self.launched_pid.clone();
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            let launched = launch(&spec);
            if let Ok(ref process) = launched {
                *launched_pid.lock().unwrap() = Some(process.pid);
            }
            launched
        })
    }
}

#[tokio::test]
async fn test_start_runs_process() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(temp_dir.path(), "/bin/sleep", &["30"]);
    let handle = Supervisor::new(config).spawn().await.unwrap();

    let status = handle.status().await.unwrap();
    assert_eq!(status.state, ProcessState::Stopped);

    let status = handle.start().await.unwrap();
    assert_eq!(status.state, ProcessState::Starting);

    let status = wait_for_status(&handle, |s| s.state == ProcessState::Running).await;
    assert!(status.pid.is_some());
    assert_eq!(status.restarts, 0);

    // Start while running is a no-op
    let again = handle.start().await.unwrap();
    assert_eq!(again.pid, status.pid);

    let status = handle.shutdown().await.unwrap();
    assert_eq!(status.state, ProcessState::Stopped);
    assert!(status.pid.is_none());
}

#[tokio::test]
async fn test_autostart_launches_on_spawn() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = create_test_config(temp_dir.path(), "/bin/sleep", &["30"]);
    config.autostart = true;

    let handle = Supervisor::new(config).spawn().await.unwrap();
    wait_for_status(&handle, |s| s.state == ProcessState::Running).await;

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_spawn_rejects_invalid_config() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = create_test_config(temp_dir.path(), "/bin/sleep", &["30"]);
    config.instances = 4;

    let result = Supervisor::new(config).spawn().await;
    assert!(matches!(result, Err(WardenError::ConfigValidationError(_))));
}

#[tokio::test]
async fn test_stop_on_stopped_slot_is_noop() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(temp_dir.path(), "/bin/sleep", &["30"]);
    let handle = Supervisor::new(config).spawn().await.unwrap();

    let status = handle.stop().await.unwrap();
    assert_eq!(status.state, ProcessState::Stopped);
    assert_eq!(status.restarts, 0);
    assert!(status.last_exit_code.is_none());

    handle.shutdown().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_stop_terminates_running_process() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(temp_dir.path(), "/bin/sleep", &["30"]);
    let handle = Supervisor::new(config).spawn().await.unwrap();

    handle.start().await.unwrap();
    let running = wait_for_status(&handle, |s| s.state == ProcessState::Running).await;
    let pid = running.pid.unwrap();

    let status = handle.stop().await.unwrap();
    assert_eq!(status.state, ProcessState::Stopped);
    assert!(status.pid.is_none());
    assert!(!pid_alive(pid));

    // No relaunch follows an operator stop
    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = handle.status().await.unwrap();
    assert_eq!(status.state, ProcessState::Stopped);
    assert_eq!(status.restarts, 0);

    handle.shutdown().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_stop_kills_after_grace_period() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = create_test_config(
        temp_dir.path(),
        "/bin/sh",
        &["-c", "trap '' TERM; echo ready; exec sleep 30"],
    );
    config.kill_timeout_ms = 200;
    let out_path = config.out_path();
    let handle = Supervisor::new(config).spawn().await.unwrap();

    handle.start().await.unwrap();
    let running = wait_for_status(&handle, |s| s.state == ProcessState::Running).await;

    // Wait until the trap is installed
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while read_lines(&out_path).is_empty() {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let started = tokio::time::Instant::now();
    let status = handle.stop().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(status.state, ProcessState::Stopped);
    // SIGKILL leaves no exit code
    assert!(status.last_exit_code.is_none());
    assert!(!pid_alive(running.pid.unwrap()));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_exit_without_autorestart_stays_stopped() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = create_test_config(temp_dir.path(), "/bin/sh", &["-c", "exit 3"]);
    config.autorestart = false;
    let handle = Supervisor::new(config).spawn().await.unwrap();

    handle.start().await.unwrap();
    let status = wait_for_status(&handle, |s| {
        s.state == ProcessState::Stopped && s.last_exit_code.is_some()
    })
    .await;

    assert_eq!(status.last_exit_code, Some(3));
    assert!(!status.exhausted);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.status().await.unwrap().state, ProcessState::Stopped);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_crash_loop_exhausts_policy() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = create_test_config(temp_dir.path(), "/bin/sh", &["-c", "exit 1"]);
    config.max_consecutive_failures = 3;
    config.backoff_ms = vec![0, 10];
    let handle = Supervisor::new(config).spawn().await.unwrap();

    handle.start().await.unwrap();
    let status = wait_for_status(&handle, |s| s.exhausted).await;

    assert_eq!(status.state, ProcessState::Stopped);
    assert_eq!(status.consecutive_failures, 3);
    assert_eq!(status.restarts, 3);
    assert_eq!(status.last_exit_code, Some(1));
    assert!(status
        .last_error
        .unwrap()
        .contains("after 3 consecutive failures"));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_launch_failures_exhaust_policy() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = create_test_config(temp_dir.path(), "/nonexistent/warden-test-binary", &[]);
    config.max_consecutive_failures = 3;
    let handle = Supervisor::new(config).spawn().await.unwrap();

    handle.start().await.unwrap();
    let status = wait_for_status(&handle, |s| s.exhausted).await;

    assert_eq!(status.state, ProcessState::Stopped);
    assert_eq!(status.restarts, 3);
    assert!(status.pid.is_none());

    // An operator start clears the exhausted flag and tries again
    let status = handle.start().await.unwrap();
    assert!(!status.exhausted);
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(status.state, ProcessState::Starting);

    handle.stop().await.unwrap();
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_manual_restart_resets_failure_streak() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = create_test_config(temp_dir.path(), "/bin/sh", &["-c", "exit 1"]);
    config.max_consecutive_failures = 100;
    config.backoff_ms = vec![50];
    let handle = Supervisor::new(config).spawn().await.unwrap();

    handle.start().await.unwrap();
    let before = wait_for_status(&handle, |s| s.consecutive_failures >= 2).await;

    let status = handle.restart().await.unwrap();
    assert_eq!(status.consecutive_failures, 0);
    assert!(status.restarts >= before.restarts);

    handle.stop().await.unwrap();
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_manual_restart_replaces_process() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = create_test_config(temp_dir.path(), "/bin/sleep", &["30"]);
    config.autorestart = false;
    let handle = Supervisor::new(config).spawn().await.unwrap();

    handle.start().await.unwrap();
    let first = wait_for_status(&handle, |s| s.state == ProcessState::Running).await;

    let status = handle.restart().await.unwrap();
    assert_eq!(status.state, ProcessState::Starting);
    assert_eq!(status.restarts, 1);

    let second = wait_for_status(&handle, |s| s.state == ProcessState::Running).await;
    assert_ne!(first.pid, second.pid);
    assert_eq!(second.restarts, 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_memory_ceiling_recycles_once() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = create_test_config(temp_dir.path(), "/bin/sleep", &["30"]);
    config.max_memory_restart = Some(ByteSize(100 * MB));
    config.watchdog_interval_ms = 20;
    config.backoff_ms = vec![0, 5000];

    let calls = Arc::new(AtomicUsize::new(0));
    let handle = Supervisor::new(config)
        .with_sampler_factory(bloated_generations(calls.clone(), 1))
        .spawn()
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    handle.start().await.unwrap();
    let status = wait_for_status(&handle, |s| {
        s.state == ProcessState::Running && s.restarts == 1
    })
    .await;

    // Relaunched with the first schedule entry, not the 5s one
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(status.consecutive_failures, 1);
    assert!(status.last_error.unwrap().contains("exceeded ceiling"));

    // The killed generation's exit is not counted as a second transition
    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = handle.status().await.unwrap();
    assert_eq!(status.state, ProcessState::Running);
    assert_eq!(status.restarts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_memory_recycles_exhaust_policy() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = create_test_config(temp_dir.path(), "/bin/sleep", &["30"]);
    config.max_memory_restart = Some(ByteSize(100 * MB));
    config.watchdog_interval_ms = 10;
    config.max_consecutive_failures = 2;
    config.backoff_ms = vec![0, 10];

    let calls = Arc::new(AtomicUsize::new(0));
    let handle = Supervisor::new(config)
        .with_sampler_factory(bloated_generations(calls.clone(), usize::MAX))
        .spawn()
        .await
        .unwrap();

    handle.start().await.unwrap();
    let status = wait_for_status(&handle, |s| s.exhausted).await;

    assert_eq!(status.state, ProcessState::Stopped);
    assert_eq!(status.consecutive_failures, 2);
    assert_eq!(status.restarts, 2);
    assert!(status.pid.is_none());
    assert!(status.last_error.unwrap().contains("exhausted"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stale_over_limit_signal_dropped() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(temp_dir.path(), "/bin/sleep", &["30"]);
    let handle = Supervisor::new(config).spawn().await.unwrap();

    handle.start().await.unwrap();
    let first = wait_for_status(&handle, |s| s.state == ProcessState::Running).await;

    handle.restart().await.unwrap();
    let second = wait_for_status(&handle, |s| s.state == ProcessState::Running).await;
    assert_ne!(first.pid, second.pid);

    // Late report about the replaced generation
    handle
        .events
        .send(Event::from(OverLimit {
            generation: 1,
            pid: first.pid.unwrap(),
            rss: 500 * MB,
            limit: 100 * MB,
        }))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = handle.status().await.unwrap();
    assert_eq!(status.state, ProcessState::Running);
    assert_eq!(status.pid, second.pid);
    assert_eq!(status.restarts, 1);
    assert_eq!(status.consecutive_failures, 0);
    assert!(status.last_error.is_none());

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_log_degradation_reported_in_status() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path();
    let mut config = create_test_config(dir, "/bin/sh", &["-c", TICK_SCRIPT]);
    config.cwd = Some(dir.to_path_buf());
    config.out_file = Some(dir.join("logs").join("out.log"));
    // Every write after the first rotates, so the log directory is revisited
    config.max_log_size = Some(ByteSize(1));
    let handle = Supervisor::new(config).spawn().await.unwrap();

    handle.start().await.unwrap();
    wait_for_status(&handle, |s| s.state == ProcessState::Running).await;

    emit_tick(dir).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !std::fs::read_to_string(dir.join("logs").join("out.log"))
        .unwrap_or_default()
        .contains("tick1")
    {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!handle.status().await.unwrap().log_degraded);

    // A regular file where the log directory was
    std::fs::rename(dir.join("logs"), dir.join("logs-moved")).unwrap();
    std::fs::write(dir.join("logs"), b"").unwrap();
    emit_tick(dir).await;

    let status = wait_for_status(&handle, |s| s.log_degraded).await;
    assert_eq!(status.state, ProcessState::Running);

    std::fs::remove_file(dir.join("logs")).unwrap();
    std::fs::create_dir(dir.join("logs")).unwrap();
    emit_tick(dir).await;

    let status = wait_for_status(&handle, |s| !s.log_degraded).await;
    assert_eq!(status.state, ProcessState::Running);
    assert_eq!(status.restarts, 0);

    handle.shutdown().await.unwrap();
    let recovered = read_lines(&dir.join("logs").join("out.log"));
    assert!(recovered.iter().any(|l| l.ends_with(" stdout tick3")));
}

#[cfg(unix)]
#[tokio::test]
async fn test_stop_while_starting_cancels_launch() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(temp_dir.path(), "/bin/sleep", &["30"]);
    let launched_pid = Arc::new(Mutex::new(None));
    let launcher = DelayedLauncher {
        delay: Duration::from_millis(200),
        launched_pid: launched_pid.clone(),
    };

    let handle = Supervisor::new(config)
        .with_launcher(Arc::new(launcher))
        .spawn()
        .await
        .unwrap();

    let status = handle.start().await.unwrap();
    assert_eq!(status.state, ProcessState::Starting);

    let status = handle.stop().await.unwrap();
    assert_eq!(status.state, ProcessState::Stopped);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let status = handle.status().await.unwrap();
    assert_eq!(status.state, ProcessState::Stopped);
    assert!(status.pid.is_none());
    assert_eq!(status.restarts, 0);

    let pid = launched_pid.lock().unwrap().expect("launch should have completed");
    assert!(!pid_alive(pid));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_logs_preserved_across_restart() {
    let temp_dir = TempDir::new().unwrap();
    let script = "n=$(cat count 2>/dev/null || echo 0); n=$((n+1)); echo $n > count; \
                  for i in 1 2 3; do echo run$n-$i; done; echo oops$n >&2; exec sleep 30";
    let mut config = create_test_config(temp_dir.path(), "/bin/sh", &["-c", script]);
    config.cwd = Some(temp_dir.path().to_path_buf());
    let out_path: PathBuf = config.out_path();
    let err_path: PathBuf = config.error_path();
    let handle = Supervisor::new(config).spawn().await.unwrap();

    handle.start().await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while read_lines(&out_path).len() < 3 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    handle.restart().await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while read_lines(&out_path).len() < 6 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    handle.shutdown().await.unwrap();

    let bodies: Vec<String> = read_lines(&out_path)
        .iter()
        .map(|l| l.rsplit(' ').next().unwrap().to_string())
        .collect();
    assert_eq!(
        bodies,
        vec!["run1-1", "run1-2", "run1-3", "run2-1", "run2-2", "run2-3"]
    );

    let errors = read_lines(&err_path);
    assert_eq!(errors.len(), 2);
    assert!(errors[0].ends_with(" stderr oops1"));
    assert!(errors[1].ends_with(" stderr oops2"));
}

#[tokio::test]
async fn test_handle_reports_gone_after_shutdown() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(temp_dir.path(), "/bin/sleep", &["30"]);
    let handle = Supervisor::new(config).spawn().await.unwrap();

    handle.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(matches!(handle.status().await, Err(WardenError::SupervisorGone)));
}

#[cfg(unix)]
#[test]
fn test_parse_signal() {
    use nix::sys::signal::Signal;

    assert_eq!(parse_signal("SIGTERM").unwrap(), Signal::SIGTERM);
    assert_eq!(parse_signal("SIGUSR2").unwrap(), Signal::SIGUSR2);
    assert!(parse_signal("SIGBOGUS").is_err());
}
