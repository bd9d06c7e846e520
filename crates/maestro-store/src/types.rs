use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Kanban task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Todo,
    InProgress,
    Done,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Cancelled)
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Backlog
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backlog" => Ok(TaskStatus::Backlog),
            "todo" => Ok(TaskStatus::Todo),
            "in_progress" => Ok(TaskStatus::InProgress),
            "done" => Ok(TaskStatus::Done),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(StoreError::InvalidValue {
                what: "task status",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task ended up `cancelled` (or was sent back to `todo` for retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    AgentIncomplete,
    RateLimited,
    Exception,
    UserCancelled,
    DepFailed,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::AgentIncomplete => "agent_incomplete",
            FailureReason::RateLimited => "rate_limited",
            FailureReason::Exception => "exception",
            FailureReason::UserCancelled => "user_cancelled",
            FailureReason::DepFailed => "dep_failed",
        }
    }
}

impl std::str::FromStr for FailureReason {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent_incomplete" => Ok(FailureReason::AgentIncomplete),
            "rate_limited" => Ok(FailureReason::RateLimited),
            "exception" => Ok(FailureReason::Exception),
            "user_cancelled" => Ok(FailureReason::UserCancelled),
            "dep_failed" => Ok(FailureReason::DepFailed),
            other => Err(StoreError::InvalidValue {
                what: "failure reason",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Tool,
    AgentPlan,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Tool => "tool",
            MessageKind::AgentPlan => "agent_plan",
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageKind::Text),
            "tool" => Ok(MessageKind::Tool),
            "agent_plan" => Ok(MessageKind::AgentPlan),
            other => Err(StoreError::InvalidValue {
                what: "message kind",
                value: other.to_string(),
            }),
        }
    }
}

/// A persisted conversation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// UUIDv7 primary key, time-sortable.
    pub id: String,
    pub title: Option<String>,
    /// Opaque token returned by the assistant binary; presented on the next
    /// spawn to continue the same logical conversation.
    pub resume_token: Option<String>,
    /// Active tool-plugin config names.
    pub tools: Vec<String>,
    /// Active skill document ids.
    pub skills: Vec<String>,
    pub mode: Option<String>,
    pub agent_mode: Option<String>,
    pub model: Option<String>,
    pub workdir: Option<String>,
    /// Non-null iff an execution is currently (or was recently) in flight.
    pub last_user_msg: Option<String>,
    pub retry_count: u32,
    /// Non-null while a turn is streaming.
    pub partial_text: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub title: Option<String>,
    pub tools: Vec<String>,
    pub skills: Vec<String>,
    pub mode: Option<String>,
    pub agent_mode: Option<String>,
    pub model: Option<String>,
    pub workdir: Option<String>,
}

/// One entry in a session's message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub session_id: String,
    pub role: Role,
    pub kind: MessageKind,
    pub content: String,
    pub tool_name: Option<String>,
    pub agent_id: Option<String>,
    pub reply_to: Option<i64>,
    pub attachments: Option<serde_json::Value>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub session_id: String,
    pub role: Role,
    pub kind: MessageKind,
    pub content: String,
    pub tool_name: Option<String>,
    pub agent_id: Option<String>,
    pub reply_to: Option<i64>,
    pub attachments: Option<serde_json::Value>,
}

impl NewMessage {
    pub fn user_text(session_id: &str, content: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            role: Role::User,
            kind: MessageKind::Text,
            content: content.to_string(),
            tool_name: None,
            agent_id: None,
            reply_to: None,
            attachments: None,
        }
    }

    pub fn assistant_text(session_id: &str, content: &str) -> Self {
        Self {
            role: Role::Assistant,
            ..Self::user_text(session_id, content)
        }
    }

    pub fn tool_call(session_id: &str, tool_name: &str, input_json: &str) -> Self {
        Self {
            kind: MessageKind::Tool,
            tool_name: Some(tool_name.to_string()),
            ..Self::assistant_text(session_id, input_json)
        }
    }
}

/// A queued unit of work drivable by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub title: String,
    pub description: String,
    pub notes: Option<String>,
    pub status: TaskStatus,
    pub sort_order: i64,
    pub session_id: Option<String>,
    pub workdir: Option<String>,
    pub model: Option<String>,
    pub mode: Option<String>,
    pub agent_mode: Option<String>,
    pub max_turns: Option<u32>,
    pub attachments: Option<serde_json::Value>,
    pub depends_on: Vec<String>,
    pub chain_id: Option<String>,
    pub source_session_id: Option<String>,
    pub failure_reason: Option<FailureReason>,
    pub retry_count: u32,
    /// PID of the assistant subprocess while the task is `in_progress`.
    pub worker_pid: Option<u32>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub sort_order: i64,
    pub session_id: Option<String>,
    pub workdir: Option<String>,
    pub model: Option<String>,
    pub mode: Option<String>,
    pub agent_mode: Option<String>,
    pub max_turns: Option<u32>,
    pub attachments: Option<serde_json::Value>,
    pub depends_on: Vec<String>,
    pub chain_id: Option<String>,
    pub source_session_id: Option<String>,
}

/// Partial update applied by manual board edits. `None` fields are left
/// untouched; `Some(None)` clears a nullable column.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub notes: Option<Option<String>>,
    pub status: Option<TaskStatus>,
    pub sort_order: Option<i64>,
    pub workdir: Option<Option<String>>,
    pub model: Option<Option<String>>,
    pub mode: Option<Option<String>>,
    pub agent_mode: Option<Option<String>>,
    pub max_turns: Option<Option<u32>>,
    pub depends_on: Option<Vec<String>>,
    pub failure_reason: Option<Option<FailureReason>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn status_round_trip() {
        for s in ["backlog", "todo", "in_progress", "done", "cancelled"] {
            assert_eq!(TaskStatus::from_str(s).unwrap().as_str(), s);
        }
        assert!(TaskStatus::from_str("paused").is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn failure_reason_round_trip() {
        for s in [
            "agent_incomplete",
            "rate_limited",
            "exception",
            "user_cancelled",
            "dep_failed",
        ] {
            assert_eq!(FailureReason::from_str(s).unwrap().as_str(), s);
        }
    }

    #[test]
    fn tool_message_constructor() {
        let m = NewMessage::tool_call("s-1", "Bash", r#"{"cmd":"ls"}"#);
        assert_eq!(m.kind.as_str(), "tool");
        assert_eq!(m.role.as_str(), "assistant");
        assert_eq!(m.tool_name.as_deref(), Some("Bash"));
    }
}
