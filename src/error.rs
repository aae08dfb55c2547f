// Error types for the route reconciler

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Failed to query system routes: {0}")]
    SystemQuery(String),

    #[error("Failed to query network interfaces: {0}")]
    InterfaceQuery(String),

    #[error("Failed to execute command: {0}")]
    CommandExecution(String),

    #[error("Command timed out after {seconds}s: {command}")]
    CommandTimeout { command: String, seconds: u64 },

    #[error("Failed to parse command output: {0}")]
    OutputParse(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Invalid prefix length: {0}")]
    InvalidPrefix(String),

    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    #[error("Domain resolution failed: {0}")]
    Resolution(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Profile error: {0}")]
    Profile(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Convert error to user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            AppError::SystemQuery(_) => {
                "Failed to read the routing table. Make sure PowerShell is available and the tool runs as administrator.".to_string()
            }
            AppError::InterfaceQuery(_) => {
                "Failed to read network interfaces. Make sure PowerShell is available.".to_string()
            }
            AppError::CommandExecution(cmd) => {
                format!("Failed to execute command: {}", cmd)
            }
            AppError::CommandTimeout { command, seconds } => {
                format!("'{}' did not finish within {}s. The system may be busy, try again.", command, seconds)
            }
            AppError::OutputParse(_) => {
                "Unexpected command output. This might be a bug, please report it.".to_string()
            }
            AppError::InvalidTarget(target) => {
                format!("'{}' is not a valid IPv4 address, CIDR or domain name.", target)
            }
            AppError::InvalidPrefix(_) => {
                "Prefix length must be between 0 and 32.".to_string()
            }
            AppError::InvalidRoute(msg) => format!("Route rejected: {}", msg),
            AppError::Resolution(msg) => format!("Could not resolve domain: {}", msg),
            AppError::Snapshot(msg) => format!("Snapshot operation failed: {}", msg),
            AppError::Profile(msg) => format!("Profile operation failed: {}", msg),
            AppError::Io(_) => {
                "File system error. Check permissions and disk space.".to_string()
            }
            AppError::Serialization(_) => {
                "Data format error. The file may be corrupted.".to_string()
            }
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::CommandTimeout { .. } | AppError::SystemQuery(_) | AppError::InterfaceQuery(_)
        )
    }
}
