use thiserror::Error;

/// Main error type for the warden supervisor
#[derive(Debug, Error)]
pub enum WardenError {
    // Process-related errors
    #[error("Restart policy exhausted for {0} after {1} consecutive failures")]
    PolicyExhausted(String, u32),

    #[error("Signal error: {0}")]
    SignalError(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    #[error("Missing required configuration field: {0}")]
    MissingConfigField(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // Log-related errors
    #[error("Log error: {0}")]
    LogError(String),

    #[error("Failed to open log file: {0}")]
    LogFileError(String),

    // Controller lifecycle
    #[error("Supervisor is no longer running")]
    SupervisorGone,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Why a single launch attempt failed.
///
/// These are never retried by the launcher itself; the controller feeds them
/// into the restart policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LaunchError {
    #[error("executable not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("spawn failed: {0}")]
    SpawnFailed(String),
}

/// A memory sample could not be taken. Transient; the watchdog skips the tick.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("memory sample failed for pid {pid}: {reason}")]
pub struct WatchdogSampleError {
    pub pid: u32,
    pub reason: String,
}

/// Result type alias for warden operations
pub type Result<T> = std::result::Result<T, WardenError>;
