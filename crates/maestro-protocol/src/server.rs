use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server → client events, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    SessionStarted {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tab_id: Option<String>,
    },

    SessionTitle {
        session_id: String,
        title: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tab_id: Option<String>,
    },

    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tab_id: Option<String>,
        /// Set on the accumulated replay frame sent after a resubscribe.
        #[serde(skip_serializing_if = "std::ops::Not::not", default)]
        catch_up: bool,
    },

    Thinking {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tab_id: Option<String>,
    },

    Tool {
        tool: String,
        /// Tool input as a JSON-encoded string, exactly as received.
        input: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tab_id: Option<String>,
    },

    Status {
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tab_id: Option<String>,
    },

    AgentStatus {
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    RateLimit {
        info: Value,
    },

    AskUser {
        request_id: String,
        question: String,
        questions: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        tab_id: Option<String>,
    },

    AskUserTimeout {
        request_id: String,
    },

    TaskStarted {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tab_id: Option<String>,
    },

    TaskResumed {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tab_id: Option<String>,
    },

    TaskRetrying {
        session_id: String,
        attempt: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        tab_id: Option<String>,
    },

    /// The session has a stored `last_user_msg` but no live turn; the
    /// client should offer a retry.
    TaskInterrupted {
        session_id: String,
        last_user_msg: String,
        retry_count: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        tab_id: Option<String>,
    },

    TaskLost {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tab_id: Option<String>,
    },

    QueueUpdate {
        #[serde(skip_serializing_if = "Option::is_none")]
        tab_id: Option<String>,
        pending: usize,
        items: Vec<QueueItem>,
    },

    Done {
        #[serde(skip_serializing_if = "Option::is_none")]
        tab_id: Option<String>,
        /// Wall-clock duration of the turn in milliseconds.
        duration: u64,
    },

    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tab_id: Option<String>,
    },

    /// Fire-and-forget progress pushed by the notify_user plugin or by the
    /// scheduler (dependency cascade notices).
    Notification {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        level: String,
        title: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<f64>,
    },

    // --- browser / board query results -----------------------------------
    Sessions {
        sessions: Value,
    },

    SessionHistory {
        session_id: String,
        messages: Value,
    },

    Tasks {
        tasks: Value,
    },
}

/// One entry of a session's pending chat queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub queue_id: String,
    pub text: String,
}

/// Coarse frame class used by the proxy's reconnect dedup: queued text and
/// thinking frames are dropped on reattach (the accumulated buffer already
/// covers them), everything else is retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Thinking,
    Other,
}

impl ServerEvent {
    pub fn kind(&self) -> FrameKind {
        match self {
            ServerEvent::Text { .. } => FrameKind::Text,
            ServerEvent::Thinking { .. } => FrameKind::Thinking,
            _ => FrameKind::Other,
        }
    }

    /// Serialize for the wire. Events are plain data, so serialization cannot
    /// fail for any value we construct, so fall back to an error frame
    /// rather than propagate.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","error":"serialize: {e}"}}"#)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_frame_omits_default_catch_up() {
        let ev = ServerEvent::Text {
            text: "hi".into(),
            tab_id: None,
            catch_up: false,
        };
        let json = ev.to_json();
        assert!(json.contains(r#""type":"text""#));
        assert!(!json.contains("catchUp"));
        assert!(!json.contains("tabId"));
    }

    #[test]
    fn catch_up_serializes_when_set() {
        let ev = ServerEvent::Text {
            text: "replay".into(),
            tab_id: Some("t1".into()),
            catch_up: true,
        };
        let json = ev.to_json();
        assert!(json.contains(r#""catchUp":true"#));
        assert!(json.contains(r#""tabId":"t1""#));
    }

    #[test]
    fn kind_classification() {
        let text = ServerEvent::Text {
            text: String::new(),
            tab_id: None,
            catch_up: false,
        };
        let done = ServerEvent::Done {
            tab_id: None,
            duration: 10,
        };
        assert_eq!(text.kind(), FrameKind::Text);
        assert_eq!(done.kind(), FrameKind::Other);
    }
}
