//! Assistant subprocess plumbing: spawn the CLI, decode its newline-framed
//! event stream into typed events, and guarantee a single terminal `Done`
//! on every exit path.

pub mod attachments;
pub mod decoder;
pub mod error;
pub mod events;
pub mod runner;
pub mod toolconfig;

pub use decoder::EventDecoder;
pub use error::{AgentError, Result};
pub use events::{AgentEvent, BlockKind, ContentBlock};
pub use runner::{spawn_agent, AgentRequest, RunnerEvent};
pub use toolconfig::{PluginConfigHandle, PluginConfigStore, PluginLaunch};
