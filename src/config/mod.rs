mod units;

pub use units::{resolve_date_format, ByteSize};

use crate::error::{Result, WardenError};
use crate::process::watchdog::DEFAULT_WATCHDOG_INTERVAL;
use crate::process::{ProcessSpec, RestartPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Signals accepted for `stop_signal`
pub const VALID_STOP_SIGNALS: [&str; 7] = [
    "SIGTERM", "SIGINT", "SIGQUIT", "SIGKILL", "SIGHUP", "SIGUSR1", "SIGUSR2",
];

/// Supervision descriptor for the single worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Process name, used in log output and default log file names
    pub name: String,

    /// Path to the executable to run
    pub script: PathBuf,

    /// Command-line arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the process
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Environment overrides, applied on top of the inherited environment
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Number of instances; this supervisor runs exactly one
    #[serde(default = "default_instances")]
    pub instances: usize,

    /// Whether to relaunch the process after it exits
    #[serde(default)]
    pub autorestart: bool,

    /// Whether to launch as soon as the supervisor starts
    #[serde(default = "default_autostart")]
    pub autostart: bool,

    /// Resident memory ceiling; unset means unlimited
    #[serde(default)]
    pub max_memory_restart: Option<ByteSize>,

    /// Timestamp format for log records (strftime or moment tokens)
    #[serde(default = "default_log_date_format")]
    pub log_date_format: String,

    /// Stdout log file
    #[serde(default)]
    pub out_file: Option<PathBuf>,

    /// Stderr log file
    #[serde(default)]
    pub error_file: Option<PathBuf>,

    /// Optional size boundary for log rotation
    #[serde(default)]
    pub max_log_size: Option<ByteSize>,

    /// Relaunch delays indexed by consecutive failures (milliseconds)
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: Vec<u64>,

    /// Consecutive failures tolerated before giving up
    #[serde(default = "default_max_consecutive_failures", alias = "max_restarts")]
    pub max_consecutive_failures: u32,

    /// Signal to send on graceful stop
    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,

    /// Grace period before a stopping process is killed (milliseconds)
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,

    /// Memory sampling interval (milliseconds)
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,

    /// Restart on file changes. Not supported; `true` fails validation.
    #[serde(default)]
    pub watch: bool,
}

fn default_instances() -> usize {
    1
}

fn default_autostart() -> bool {
    true
}

fn default_log_date_format() -> String {
    "%Y-%m-%d %H:%M:%S".to_string()
}

fn default_backoff_ms() -> Vec<u64> {
    vec![0, 1000, 2000, 5000, 10000]
}

fn default_max_consecutive_failures() -> u32 {
    15
}

fn default_stop_signal() -> String {
    "SIGTERM".to_string()
}

fn default_kill_timeout_ms() -> u64 {
    1600
}

fn default_watchdog_interval_ms() -> u64 {
    DEFAULT_WATCHDOG_INTERVAL.as_millis() as u64
}

impl ProcessConfig {
    /// Config with every optional field at its default
    pub fn new(name: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            instances: default_instances(),
            autorestart: false,
            autostart: default_autostart(),
            max_memory_restart: None,
            log_date_format: default_log_date_format(),
            out_file: None,
            error_file: None,
            max_log_size: None,
            backoff_ms: default_backoff_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            stop_signal: default_stop_signal(),
            kill_timeout_ms: default_kill_timeout_ms(),
            watchdog_interval_ms: default_watchdog_interval_ms(),
            watch: false,
        }
    }

    /// Load the process configuration from a file (supports TOML and JSON)
    pub fn from_file(path: &Path) -> Result<ProcessConfig> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| WardenError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let mut config = match extension {
            "toml" => Self::parse_toml(&contents)?,
            "json" => Self::parse_json(&contents)?,
            _ => {
                return Err(WardenError::InvalidConfig(format!(
                    "Unsupported file format: {}. Use .toml or .json",
                    extension
                )))
            }
        };

        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Parse TOML: either a single top-level table or a one-entry `[[apps]]` array
    fn parse_toml(contents: &str) -> Result<ProcessConfig> {
        #[derive(Deserialize)]
        struct ConfigFile {
            #[serde(default)]
            apps: Vec<ProcessConfig>,
            #[serde(flatten)]
            single: Option<ProcessConfig>,
        }

        let file: ConfigFile = toml::from_str(contents)
            .map_err(|e| WardenError::InvalidConfig(format!("Failed to parse TOML: {}", e)))?;

        Self::pick_single(file.single, file.apps)
    }

    /// Parse JSON: either a single object or `{ "apps": [ ... ] }` with one entry
    fn parse_json(contents: &str) -> Result<ProcessConfig> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum ConfigFile {
            Single(ProcessConfig),
            Apps { apps: Vec<ProcessConfig> },
        }

        let file: ConfigFile = serde_json::from_str(contents)
            .map_err(|e| WardenError::InvalidConfig(format!("Failed to parse JSON: {}", e)))?;

        match file {
            ConfigFile::Single(config) => Ok(config),
            ConfigFile::Apps { apps } => Self::pick_single(None, apps),
        }
    }

    fn pick_single(single: Option<ProcessConfig>, mut apps: Vec<ProcessConfig>) -> Result<ProcessConfig> {
        if let Some(single) = single {
            return Ok(single);
        }

        match apps.len() {
            0 => Err(WardenError::InvalidConfig(
                "No process configuration found in file".to_string(),
            )),
            1 => Ok(apps.remove(0)),
            n => Err(WardenError::InvalidConfig(format!(
                "Found {} apps; a supervisor manages exactly one process",
                n
            ))),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(WardenError::MissingConfigField("name".to_string()));
        }

        if self.script.as_os_str().is_empty() {
            return Err(WardenError::MissingConfigField("script".to_string()));
        }

        if self.instances != 1 {
            return Err(WardenError::ConfigValidationError(format!(
                "instances must be 1 (got {}); run one supervisor per replica",
                self.instances
            )));
        }

        if self.watch {
            return Err(WardenError::ConfigValidationError(
                "watch mode is not supported; set watch = false".to_string(),
            ));
        }

        if self.max_consecutive_failures == 0 {
            return Err(WardenError::ConfigValidationError(
                "max_consecutive_failures must be at least 1".to_string(),
            ));
        }

        if self.backoff_ms.is_empty() {
            return Err(WardenError::ConfigValidationError(
                "backoff_ms must contain at least one delay".to_string(),
            ));
        }

        if self.watchdog_interval_ms == 0 {
            return Err(WardenError::ConfigValidationError(
                "watchdog_interval_ms must be greater than zero".to_string(),
            ));
        }

        if !VALID_STOP_SIGNALS.contains(&self.stop_signal.as_str()) {
            return Err(WardenError::ConfigValidationError(format!(
                "Invalid stop_signal: {}. Must be one of: {}",
                self.stop_signal,
                VALID_STOP_SIGNALS.join(", ")
            )));
        }

        if let Some(ref cwd) = self.cwd {
            if !cwd.is_dir() {
                return Err(WardenError::ConfigValidationError(format!(
                    "Working directory does not exist or is not a directory: {}",
                    cwd.display()
                )));
            }
        }

        resolve_date_format(&self.log_date_format)?;

        Ok(())
    }

    /// Expand environment variables in path, argument and env value fields
    fn expand_env_vars(&mut self) {
        self.script = Self::expand_env_in_path(&self.script);

        if let Some(ref cwd) = self.cwd {
            self.cwd = Some(Self::expand_env_in_path(cwd));
        }
        if let Some(ref out) = self.out_file {
            self.out_file = Some(Self::expand_env_in_path(out));
        }
        if let Some(ref err) = self.error_file {
            self.error_file = Some(Self::expand_env_in_path(err));
        }

        self.args = self
            .args
            .iter()
            .map(|arg| Self::expand_env_in_string(arg))
            .collect();

        self.env = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), Self::expand_env_in_string(v)))
            .collect();
    }

    /// Replace `${VAR}` and `$VAR` with values from the supervisor's environment
    fn expand_env_in_string(s: &str) -> String {
        let mut vars: Vec<(String, String)> = std::env::vars().collect();
        // Longest names first so `$HOME_DIR` is not clobbered by `$HOME`
        vars.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        let mut result = s.to_string();
        for (key, value) in vars {
            result = result.replace(&format!("${{{}}}", key), &value);
            result = result.replace(&format!("${}", key), &value);
        }

        result
    }

    fn expand_env_in_path(path: &Path) -> PathBuf {
        let path_str = path.to_string_lossy();
        PathBuf::from(Self::expand_env_in_string(&path_str))
    }

    /// Immutable launch descriptor for the launcher
    pub fn process_spec(&self) -> ProcessSpec {
        ProcessSpec {
            name: self.name.clone(),
            executable: self.script.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            cwd: self.cwd.clone(),
        }
    }

    /// Restart policy derived from `autorestart`, the backoff table and the memory ceiling
    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            enabled: self.autorestart,
            max_memory: self.max_memory_restart.map(|size| size.as_u64()),
            backoff: self
                .backoff_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn out_path(&self) -> PathBuf {
        self.out_file
            .clone()
            .unwrap_or_else(|| PathBuf::from("logs").join(format!("{}-out.log", self.name)))
    }

    pub fn error_path(&self) -> PathBuf {
        self.error_file
            .clone()
            .unwrap_or_else(|| PathBuf::from("logs").join(format!("{}-error.log", self.name)))
    }

    /// The log date format as a chrono strftime string
    pub fn date_format(&self) -> Result<String> {
        resolve_date_format(&self.log_date_format)
    }
}
