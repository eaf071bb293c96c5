//! Error handling for the hybrid scan orchestrator
//!
//! Setup failures abort a scan before dispatch, per-target unreachability is
//! aggregated into one end-of-scan error, and per-task failures never leave
//! the dispatcher (they are logged and forwarded as feedback events).

use thiserror::Error;

/// Main error type for orchestration operations
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("No plugins loaded for this scan")]
    NoPlugins,

    #[error("Target generation failed: {0}")]
    TargetGeneration(String),

    #[error("{} target(s) unreachable: {}", .0.len(), .0.join(", "))]
    UnreachableTargets(Vec<String>),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid task transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Invalid control message: {0}")]
    InvalidCommand(String),

    #[error("Plugin execution error: {0}")]
    ExecutionError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Scan routine panicked: {0}")]
    Panicked(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("Parse error: {0}")]
    ParseError(String),
}

/// Result type alias for orchestration operations
pub type ScanResult<T> = Result<T, ScanError>;

impl ScanError {
    /// Setup errors abort a scan before anything is dispatched
    pub fn is_fatal_setup(&self) -> bool {
        matches!(
            self,
            ScanError::ConfigError(_)
                | ScanError::NoPlugins
                | ScanError::TargetGeneration(_)
                | ScanError::InvalidCommand(_)
        )
    }
}

impl From<toml::de::Error> for ScanError {
    fn from(e: toml::de::Error) -> Self {
        ScanError::ParseError(format!("TOML: {}", e))
    }
}

impl From<std::num::ParseIntError> for ScanError {
    fn from(e: std::num::ParseIntError) -> Self {
        ScanError::ParseError(format!("Invalid number: {}", e))
    }
}

impl From<reqwest::Error> for ScanError {
    fn from(e: reqwest::Error) -> Self {
        ScanError::NetworkError(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ScanError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ScanError::NetworkError("timed out".to_string())
    }
}

/// Render a panic payload the way `std` prints it
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
