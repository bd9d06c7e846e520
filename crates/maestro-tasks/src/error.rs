use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("store error: {0}")]
    Store(#[from] maestro_store::StoreError),

    #[error("engine error: {0}")]
    Engine(#[from] maestro_engine::EngineError),
}

pub type Result<T> = std::result::Result<T, TaskError>;
