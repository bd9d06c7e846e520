use serde_json::Value;

/// Content-block classification reported by the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Text,
    Thinking,
    ToolUse,
    Other,
}

impl BlockKind {
    pub fn from_wire(s: &str) -> Self {
        match s {
            "text" => BlockKind::Text,
            "thinking" => BlockKind::Thinking,
            "tool_use" => BlockKind::ToolUse,
            _ => BlockKind::Other,
        }
    }
}

/// One block of a complete assistant message.
#[derive(Debug, Clone)]
pub struct ContentBlock {
    pub index: u32,
    pub kind: BlockKind,
    pub text: String,
}

/// Typed events decoded from the assistant's stdout stream.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// The assistant announced its resume token for this conversation.
    SessionAssigned { token: String },

    MessageStart,

    BlockStart { index: u32, kind: BlockKind },

    TextDelta { index: u32, text: String },

    ThinkingDelta { index: u32, text: String },

    ToolUse { name: String, input: Value },

    /// A complete assistant message. Text blocks already covered by deltas
    /// are filtered out before this is emitted.
    AssistantMessage { blocks: Vec<ContentBlock> },

    RateLimit { info: Value },

    /// The turn's terminal report from the assistant itself.
    TurnResult {
        subtype: String,
        num_turns: u32,
        budget: Option<Value>,
    },

    /// A line that parsed as JSON but matched no known shape.
    Unknown { raw: String },
}
