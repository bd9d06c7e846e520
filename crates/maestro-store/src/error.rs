use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("session not found: {id}")]
    SessionNotFound { id: String },

    #[error("task not found: {id}")]
    TaskNotFound { id: String },

    #[error("invalid {what}: {value}")]
    InvalidValue { what: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;
