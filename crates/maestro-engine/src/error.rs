use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] maestro_store::StoreError),

    #[error("agent error: {0}")]
    Agent(#[from] maestro_agent::AgentError),

    #[error("session not found: {id}")]
    SessionNotFound { id: String },

    #[error("turn already active for session {id}")]
    TurnActive { id: String },

    #[error("skill library error: {0}")]
    Library(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
