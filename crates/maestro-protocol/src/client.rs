use serde::{Deserialize, Serialize};

/// One attachment uploaded alongside a chat turn. `data` is base64.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub data: String,
}

/// Client → server commands, discriminated by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    /// Start (or queue) a conversation turn.
    Chat {
        #[serde(default)]
        tab_id: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        text: String,
        #[serde(default)]
        attachments: Vec<Attachment>,
        /// Skill ids to activate for this turn.
        #[serde(default)]
        skills: Vec<String>,
        /// Tool-plugin config names to expose to the assistant.
        #[serde(default)]
        mcp_servers: Vec<String>,
        #[serde(default)]
        mode: Option<String>,
        #[serde(default)]
        agent_mode: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        max_turns: Option<u32>,
        #[serde(default)]
        workdir: Option<String>,
        #[serde(default, rename = "reply_to")]
        reply_to: Option<i64>,
        /// Internal retry of the previous turn: bumps retry_count instead
        /// of appending a duplicate user message.
        #[serde(default)]
        retry: bool,
        #[serde(default)]
        auto_skill: bool,
    },

    /// Cancel the active turn on a tab (or everything for the session).
    Stop {
        #[serde(default)]
        tab_id: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Attach this connection to a session's live stream, with catch-up.
    SubscribeSession {
        session_id: String,
        #[serde(default)]
        no_catch_up: bool,
    },

    /// Re-run the stored `last_user_msg` after an interruption.
    ResumeTask {
        session_id: String,
        #[serde(default)]
        tab_id: Option<String>,
    },

    AskUserResponse {
        request_id: String,
        answer: String,
    },

    AskUserCancel {
        request_id: String,
    },

    QueueRemove {
        queue_id: String,
    },

    QueueEdit {
        queue_id: String,
        text: String,
    },

    // --- session browser -------------------------------------------------
    ListSessions {
        #[serde(default)]
        limit: Option<usize>,
    },

    SessionHistory {
        session_id: String,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default)]
        before: Option<i64>,
    },

    DeleteSession {
        session_id: String,
    },

    // --- kanban board ----------------------------------------------------
    TaskCreate {
        title: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        workdir: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        mode: Option<String>,
        #[serde(default)]
        agent_mode: Option<String>,
        #[serde(default)]
        max_turns: Option<u32>,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        sort_order: Option<i64>,
        #[serde(default)]
        depends_on: Vec<String>,
        #[serde(default)]
        chain_id: Option<String>,
        #[serde(default)]
        source_session_id: Option<String>,
        #[serde(default)]
        attachments: Vec<Attachment>,
    },

    TaskUpdate {
        task_id: String,
        /// Partial patch; only present fields are applied.
        #[serde(default)]
        patch: serde_json::Value,
    },

    TaskDelete {
        task_id: String,
    },

    TaskList {},
}

/// Parse one inbound text frame. Unknown `type` values surface as an error
/// so the connection can answer with a structured complaint instead of
/// silently dropping the frame.
pub fn parse_command(text: &str) -> Result<ClientCommand, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_minimal() {
        let json = r#"{"type":"chat","text":"hello","model":"sonnet"}"#;
        let cmd = parse_command(json).unwrap();
        match cmd {
            ClientCommand::Chat {
                text,
                model,
                session_id,
                retry,
                ..
            } => {
                assert_eq!(text, "hello");
                assert_eq!(model.as_deref(), Some("sonnet"));
                assert!(session_id.is_none());
                assert!(!retry);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn chat_reply_to_stays_snake_case() {
        let json = r#"{"type":"chat","text":"x","reply_to":42}"#;
        match parse_command(json).unwrap() {
            ClientCommand::Chat { reply_to, .. } => assert_eq!(reply_to, Some(42)),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn subscribe_session_camel_case() {
        let json = r#"{"type":"subscribe_session","sessionId":"s-1","noCatchUp":true}"#;
        match parse_command(json).unwrap() {
            ClientCommand::SubscribeSession {
                session_id,
                no_catch_up,
            } => {
                assert_eq!(session_id, "s-1");
                assert!(no_catch_up);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_an_error() {
        assert!(parse_command(r#"{"type":"self_destruct"}"#).is_err());
    }

    #[test]
    fn ask_user_response_fields() {
        let json = r#"{"type":"ask_user_response","requestId":"r1","answer":"A"}"#;
        match parse_command(json).unwrap() {
            ClientCommand::AskUserResponse { request_id, answer } => {
                assert_eq!(request_id, "r1");
                assert_eq!(answer, "A");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
