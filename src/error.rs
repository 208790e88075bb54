use thiserror::Error;

/// Main error type for the control plane
#[derive(Error, Debug)]
pub enum OpsdeckError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Lookup / constraint errors (surface as 404 / 409 / 400 at the API)
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    // Auth errors
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    // Operation collision (one in-flight operation per environment)
    #[error("Conflict: {0}")]
    Conflict(String),

    // Remote-environment failures
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    // Credential material errors
    #[error("Credential error: {0}")]
    Credential(String),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for OpsdeckError
pub type Result<T> = std::result::Result<T, OpsdeckError>;

impl OpsdeckError {
    /// Stable machine-readable code for the API error envelope
    pub fn code(&self) -> &'static str {
        match self {
            OpsdeckError::NotFound(_) => "not_found",
            OpsdeckError::AlreadyExists(_) => "already_exists",
            OpsdeckError::Validation(_) => "validation",
            OpsdeckError::Unauthorized(_) => "unauthorized",
            OpsdeckError::Forbidden(_) => "forbidden",
            OpsdeckError::Conflict(_) => "conflict",
            OpsdeckError::Transport(_) | OpsdeckError::Http(_) => "transport",
            OpsdeckError::Timeout(_) => "timeout",
            OpsdeckError::Cancelled => "cancelled",
            _ => "internal",
        }
    }
}

/// Specific error types for SSH dial and execution
#[derive(Error, Debug, Clone)]
pub enum SshError {
    #[error("transient network failure: {0}")]
    Transient(String),

    #[error("authentication failed for {username}@{host}")]
    Auth { username: String, host: String },

    #[error("host unreachable: {host}:{port}")]
    HostUnreachable { host: String, port: u16 },

    #[error("host key for {host} was rejected: {reason}")]
    HostKeyRejected { host: String, reason: String },

    #[error("command timed out after {elapsed_ms}ms")]
    CommandTimeout { elapsed_ms: u64 },

    #[error("connection pool exhausted ({cap} sessions)")]
    PoolExhausted { cap: usize },
}

impl From<SshError> for OpsdeckError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::CommandTimeout { .. } => OpsdeckError::Timeout(err.to_string()),
            SshError::Auth { .. } | SshError::HostKeyRejected { .. } => {
                OpsdeckError::Credential(err.to_string())
            }
            other => OpsdeckError::Transport(other.to_string()),
        }
    }
}
