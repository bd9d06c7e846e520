use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to spawn assistant '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("attachment staging failed: {0}")]
    Attachments(String),

    #[error("plugin config error: {0}")]
    PluginConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
