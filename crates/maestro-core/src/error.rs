use thiserror::Error;

#[derive(Debug, Error)]
pub enum MaestroError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Assistant subprocess error: {0}")]
    Subprocess(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MaestroError {
    /// Short error code string sent to clients in error frames.
    pub fn code(&self) -> &'static str {
        match self {
            MaestroError::Config(_) => "CONFIG_ERROR",
            MaestroError::AuthFailed(_) => "AUTH_FAILED",
            MaestroError::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            MaestroError::TaskNotFound { .. } => "TASK_NOT_FOUND",
            MaestroError::Database(_) => "DATABASE_ERROR",
            MaestroError::Subprocess(_) => "SUBPROCESS_ERROR",
            MaestroError::Serialization(_) => "SERIALIZATION_ERROR",
            MaestroError::Io(_) => "IO_ERROR",
            MaestroError::Timeout { .. } => "TIMEOUT",
            MaestroError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, MaestroError>;
