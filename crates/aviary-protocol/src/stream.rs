//! Agent CLI wire protocol.
//!
//! The agent binary speaks newline-delimited JSON on its standard
//! streams: every stdout line is one self-contained [`AgentEvent`], and
//! every stdin line is one [`AgentInput`]. These types model that
//! stream exactly as the CLI emits it; anything the CLI invents later
//! lands in an `Unknown` variant instead of failing the whole line.
//!
//! One event is synthesized locally and never produced by the agent:
//! [`AgentEvent::ConnectionClosed`], emitted when the stdout reader
//! reaches EOF.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// `system` event subtype carrying the canonical session id.
pub const SUBTYPE_INIT: &str = "init";
/// `system` event subtype marking a context-compaction boundary.
pub const SUBTYPE_COMPACT_BOUNDARY: &str = "compact_boundary";

// ============================================================================
// Events (agent stdout -> host)
// ============================================================================

/// One line of the agent's stream-json output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Lifecycle notices. `subtype == "init"` carries the canonical
    /// session id assigned by the agent; `subtype == "compact_boundary"`
    /// marks the start of a context compaction.
    System {
        subtype: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },

    /// A user-role message echoed back into the transcript. Carries
    /// tool results (as `tool_result` content blocks) and, right after
    /// a compaction boundary, the compaction summary.
    User {
        message: UserMessage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// A complete assistant message (all content blocks finalized).
    Assistant {
        message: AssistantMessage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// End of turn with cost and usage accounting.
    Result(TurnResult),

    /// Wrapper around a nested streaming delta.
    StreamEvent {
        event: StreamDelta,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// Synthesized locally when the event transport drops. The agent
    /// never emits this.
    ConnectionClosed,

    /// Any event type this version does not know about.
    #[serde(other)]
    Unknown,
}

impl AgentEvent {
    /// Canonical session id, if this is the `system/init` event.
    pub fn init_session_id(&self) -> Option<&str> {
        match self {
            Self::System {
                subtype,
                session_id: Some(id),
                ..
            } if subtype == SUBTYPE_INIT => Some(id),
            _ => None,
        }
    }

    pub fn is_compact_boundary(&self) -> bool {
        matches!(self, Self::System { subtype, .. } if subtype == SUBTYPE_COMPACT_BOUNDARY)
    }
}

/// A user-role message as delivered on the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    #[serde(default = "role_user")]
    pub role: String,
    pub content: UserContent,
}

fn role_user() -> String {
    "user".to_string()
}

/// User message content: the CLI emits either a plain string or a list
/// of content blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl UserContent {
    /// Tool-result blocks contained in this message, if any.
    pub fn tool_results(&self) -> Vec<&ContentBlock> {
        match self {
            Self::Text(_) => Vec::new(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter(|b| matches!(b, ContentBlock::ToolResult { .. }))
                .collect(),
        }
    }
}

/// A finalized assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// One content block within a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

/// Token accounting attached to assistant messages and turn results.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl Usage {
    /// Tokens currently occupying the context window: everything the
    /// model read (fresh or cached) plus what it produced this turn.
    pub fn context_tokens(&self) -> u64 {
        self.input_tokens
            + self.cache_creation_input_tokens
            + self.cache_read_input_tokens
            + self.output_tokens
    }
}

/// The `result` event closing a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResult {
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    /// Set by the agent when the error is unrecoverable and the
    /// process will not accept further input.
    #[serde(default)]
    pub fatal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Per-model usage keyed by model id (camelCase on the wire).
    #[serde(
        default,
        rename = "modelUsage",
        skip_serializing_if = "Option::is_none"
    )]
    pub model_usage: Option<HashMap<String, ModelUsage>>,
    /// Final text or error description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl TurnResult {
    /// Largest context window reported in the per-model usage table.
    pub fn max_context_window(&self) -> Option<u64> {
        self.model_usage
            .as_ref()?
            .values()
            .filter_map(|m| m.context_window)
            .max()
    }
}

/// Per-model breakdown inside [`TurnResult::model_usage`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModelUsage {
    #[serde(
        default,
        rename = "contextWindow",
        skip_serializing_if = "Option::is_none"
    )]
    pub context_window: Option<u64>,
    #[serde(default, rename = "inputTokens")]
    pub input_tokens: u64,
    #[serde(default, rename = "outputTokens")]
    pub output_tokens: u64,
}

// ============================================================================
// Streaming deltas
// ============================================================================

/// Nested event inside `stream_event`, tagged by its own `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamDelta {
    MessageStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<Value>,
    },
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageStop,
    #[serde(other)]
    Unknown,
}

/// Incremental payload inside `content_block_delta`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Unknown,
}

// ============================================================================
// Input (host -> agent stdin)
// ============================================================================

/// One line written to the agent's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentInput {
    User {
        message: OutboundMessage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    ControlRequest {
        request_id: String,
        request: ControlBody,
    },
}

impl AgentInput {
    /// A plain text user message addressed to `session_id`.
    pub fn user_text(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::User {
            message: OutboundMessage {
                role: "user".to_string(),
                content: text.into(),
            },
            session_id: Some(session_id.into()),
        }
    }

    /// The control line asking the agent to abort the current turn.
    pub fn interrupt(request_id: impl Into<String>) -> Self {
        Self::ControlRequest {
            request_id: request_id.into(),
            request: ControlBody {
                subtype: "interrupt".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlBody {
    pub subtype: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_init_event() {
        let line = r#"{"type":"system","subtype":"init","session_id":"abc-123","model":"claude-sonnet-4","tools":["Bash"]}"#;
        let event: AgentEvent = serde_json::from_str(line).unwrap();
        assert_eq!(event.init_session_id(), Some("abc-123"));
        assert!(!event.is_compact_boundary());
    }

    #[test]
    fn parses_compact_boundary() {
        let line = r#"{"type":"system","subtype":"compact_boundary","session_id":"abc-123"}"#;
        let event: AgentEvent = serde_json::from_str(line).unwrap();
        assert!(event.is_compact_boundary());
        assert_eq!(event.init_session_id(), None);
    }

    #[test]
    fn parses_assistant_message_with_tool_use() {
        let line = r#"{"type":"assistant","message":{"id":"msg_1","model":"claude-sonnet-4","content":[{"type":"text","text":"On it."},{"type":"tool_use","id":"toolu_1","name":"request_secret","input":{"key":"GITHUB_TOKEN"}}],"usage":{"input_tokens":10,"output_tokens":42,"cache_read_input_tokens":900}},"session_id":"abc-123"}"#;
        let event: AgentEvent = serde_json::from_str(line).unwrap();
        let AgentEvent::Assistant { message, .. } = event else {
            panic!("expected assistant event");
        };
        assert_eq!(message.content.len(), 2);
        assert!(matches!(
            &message.content[1],
            ContentBlock::ToolUse { name, .. } if name == "request_secret"
        ));
        assert_eq!(message.usage.unwrap().context_tokens(), 952);
    }

    #[test]
    fn parses_user_tool_result() {
        let line = r#"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"toolu_1","content":"ok","is_error":false}]}}"#;
        let event: AgentEvent = serde_json::from_str(line).unwrap();
        let AgentEvent::User { message, .. } = event else {
            panic!("expected user event");
        };
        assert_eq!(message.content.tool_results().len(), 1);
    }

    #[test]
    fn parses_plain_string_user_content() {
        let line = r#"{"type":"user","message":{"role":"user","content":"hello"}}"#;
        let event: AgentEvent = serde_json::from_str(line).unwrap();
        let AgentEvent::User { message, .. } = event else {
            panic!("expected user event");
        };
        assert!(message.content.tool_results().is_empty());
    }

    #[test]
    fn parses_result_with_model_usage() {
        let line = r#"{"type":"result","subtype":"success","is_error":false,"total_cost_usd":0.042,"num_turns":3,"usage":{"input_tokens":5,"output_tokens":100},"modelUsage":{"claude-sonnet-4":{"contextWindow":200000,"inputTokens":5,"outputTokens":100}},"result":"done"}"#;
        let event: AgentEvent = serde_json::from_str(line).unwrap();
        let AgentEvent::Result(result) = event else {
            panic!("expected result event");
        };
        assert!(!result.is_error);
        assert!(!result.fatal);
        assert_eq!(result.max_context_window(), Some(200_000));
        assert_eq!(result.total_cost_usd, Some(0.042));
    }

    #[test]
    fn parses_stream_text_delta() {
        let line = r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}},"session_id":"abc-123"}"#;
        let event: AgentEvent = serde_json::from_str(line).unwrap();
        let AgentEvent::StreamEvent { event, .. } = event else {
            panic!("expected stream_event");
        };
        assert!(matches!(
            event,
            StreamDelta::ContentBlockDelta {
                index: 0,
                delta: BlockDelta::TextDelta { ref text }
            } if text == "Hel"
        ));
    }

    #[test]
    fn parses_input_json_delta() {
        let line = r#"{"type":"stream_event","event":{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"key\":"}}}"#;
        let event: AgentEvent = serde_json::from_str(line).unwrap();
        let AgentEvent::StreamEvent { event, .. } = event else {
            panic!("expected stream_event");
        };
        assert!(matches!(
            event,
            StreamDelta::ContentBlockDelta {
                delta: BlockDelta::InputJsonDelta { .. },
                ..
            }
        ));
    }

    #[test]
    fn unknown_event_type_does_not_fail() {
        let line = r#"{"type":"telemetry","payload":{"cpu":0.3}}"#;
        let event: AgentEvent = serde_json::from_str(line).unwrap();
        assert!(matches!(event, AgentEvent::Unknown));
    }

    #[test]
    fn unknown_delta_type_does_not_fail() {
        let line = r#"{"type":"stream_event","event":{"type":"signature_delta"}}"#;
        let event: AgentEvent = serde_json::from_str(line).unwrap();
        let AgentEvent::StreamEvent { event, .. } = event else {
            panic!("expected stream_event");
        };
        assert!(matches!(event, StreamDelta::Unknown));
    }

    #[test]
    fn serializes_user_input_line() {
        let input = AgentInput::user_text("abc-123", "hello");
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(json["type"], "user");
        assert_eq!(json["message"]["role"], "user");
        assert_eq!(json["message"]["content"], "hello");
        assert_eq!(json["session_id"], "abc-123");
    }

    #[test]
    fn serializes_interrupt_line() {
        let input = AgentInput::interrupt("req-1");
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(json["type"], "control_request");
        assert_eq!(json["request"]["subtype"], "interrupt");
    }
}
