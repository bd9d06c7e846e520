//! The conversation engine: one `Orchestrator` owns every process-wide map
//! (active turns, watchers, buffers, pending questions, chat queues) so
//! lifetime is explicit and tests can build isolated instances.

pub mod ask;
pub mod error;
pub mod orchestrator;
pub mod proxy;
pub mod skills;
pub mod turn;

pub use ask::AskBridge;
pub use error::{EngineError, Result};
pub use orchestrator::{ActiveTurn, ClientSink, Orchestrator, QueuedChat};
pub use proxy::ClientProxy;
pub use skills::SkillLibrary;
pub use turn::{run_turn, run_turn_with_cancel, TurnOutcome, TurnRequest, TurnStatus};
