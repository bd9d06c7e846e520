//! Durable record of sessions, messages, and tasks.
//!
//! Single SQLite connection behind a `Mutex`: one writer, serialised
//! writes, WAL journal. All hot statements go through `prepare_cached`.

pub mod db;
pub mod error;
pub mod maintenance;
pub mod store;
pub mod types;

pub use error::{Result, StoreError};
pub use store::Store;
pub use types::{
    FailureReason, MessageKind, MessageRecord, NewMessage, NewSession, NewTask, Role,
    SessionRecord, TaskPatch, TaskRecord, TaskStatus,
};
