//! Provider-native events, as emitted one JSON object per line by the agent
//! CLI in `stream-json` mode.
//!
//! Only the fields the chunk transformer needs are modelled. Anything else is
//! ignored, and unknown event kinds parse as `Unknown` so they can be dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{AgentSessionId, ToolUseId};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderEvent {
    System(SystemEvent),
    StreamEvent(StreamEnvelope),
    Assistant(AssistantEvent),
    User(UserEvent),
    Result(ResultEvent),
    #[serde(other)]
    Unknown,
}

impl ProviderEvent {
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Session id carried by this event, if any.
    pub fn session_id(&self) -> Option<&AgentSessionId> {
        match self {
            Self::System(e) => e.session_id.as_ref(),
            Self::Assistant(e) => e.session_id.as_ref(),
            Self::User(e) => e.session_id.as_ref(),
            Self::Result(e) => e.session_id.as_ref(),
            Self::StreamEvent(e) => e.session_id.as_ref(),
            Self::Unknown => None,
        }
    }

    // Constructors used by mocks and tests.

    pub fn init(session_id: &str) -> Self {
        Self::System(SystemEvent {
            subtype: "init".into(),
            session_id: Some(AgentSessionId::from_raw(session_id)),
            model: None,
        })
    }

    pub fn text_block_start(index: u32) -> Self {
        Self::stream(StreamDelta::ContentBlockStart {
            index,
            content_block: BlockStart::Text {},
        })
    }

    pub fn text_delta(index: u32, text: &str) -> Self {
        Self::stream(StreamDelta::ContentBlockDelta {
            index,
            delta: BlockDelta::TextDelta { text: text.into() },
        })
    }

    pub fn tool_block_start(index: u32, id: &str, name: &str) -> Self {
        Self::stream(StreamDelta::ContentBlockStart {
            index,
            content_block: BlockStart::ToolUse {
                id: ToolUseId::from_raw(id),
                name: name.into(),
            },
        })
    }

    pub fn input_json_delta(index: u32, partial_json: &str) -> Self {
        Self::stream(StreamDelta::ContentBlockDelta {
            index,
            delta: BlockDelta::InputJsonDelta {
                partial_json: partial_json.into(),
            },
        })
    }

    pub fn block_stop(index: u32) -> Self {
        Self::stream(StreamDelta::ContentBlockStop { index })
    }

    pub fn assistant_text(text: &str) -> Self {
        Self::assistant(vec![AssistantBlock::Text { text: text.into() }])
    }

    pub fn assistant_tool_use(id: &str, name: &str, input: Value) -> Self {
        Self::assistant(vec![AssistantBlock::ToolUse {
            id: ToolUseId::from_raw(id),
            name: name.into(),
            input,
        }])
    }

    pub fn assistant(content: Vec<AssistantBlock>) -> Self {
        Self::Assistant(AssistantEvent {
            message: AssistantPayload { id: None, content },
            error: None,
            session_id: None,
        })
    }

    /// An assistant message that carries an error instead of failing the
    /// transport.
    pub fn assistant_error(error: &str, text: &str) -> Self {
        Self::Assistant(AssistantEvent {
            message: AssistantPayload {
                id: None,
                content: vec![AssistantBlock::Text { text: text.into() }],
            },
            error: Some(error.into()),
            session_id: None,
        })
    }

    pub fn tool_result(tool_use_id: &str, content: Value, is_error: bool) -> Self {
        Self::User(UserEvent {
            message: UserPayload {
                content: UserContent::Blocks(vec![UserBlock::ToolResult {
                    tool_use_id: ToolUseId::from_raw(tool_use_id),
                    content,
                    is_error,
                }]),
            },
            session_id: None,
        })
    }

    pub fn success(session_id: &str, input_tokens: u64, output_tokens: u64) -> Self {
        Self::Result(ResultEvent {
            subtype: "success".into(),
            is_error: false,
            session_id: Some(AgentSessionId::from_raw(session_id)),
            result: None,
            usage: Some(Usage {
                input_tokens,
                output_tokens,
                ..Default::default()
            }),
            total_cost_usd: None,
            duration_ms: None,
        })
    }

    fn stream(event: StreamDelta) -> Self {
        Self::StreamEvent(StreamEnvelope {
            event,
            session_id: None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    #[serde(default)]
    pub subtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<AgentSessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamEnvelope {
    pub event: StreamDelta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<AgentSessionId>,
}

/// Raw streaming deltas for the message being generated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamDelta {
    MessageStart {},
    ContentBlockStart { index: u32, content_block: BlockStart },
    ContentBlockDelta { index: u32, delta: BlockDelta },
    ContentBlockStop { index: u32 },
    MessageDelta {},
    MessageStop {},
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockStart {
    Text {},
    ToolUse { id: ToolUseId, name: String },
    Thinking {},
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssistantEvent {
    pub message: AssistantPayload,
    /// Set when the provider reports a failure inside a normal message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<AgentSessionId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssistantPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub content: Vec<AssistantBlock>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: ToolUseId,
        name: String,
        #[serde(default)]
        input: Value,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserEvent {
    pub message: UserPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<AgentSessionId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserPayload {
    pub content: UserContent,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<UserBlock>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserBlock {
    ToolResult {
        tool_use_id: ToolUseId,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    Text {
        text: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultEvent {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<AgentSessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
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
    /// Prompt tokens including cache reads and writes.
    pub fn total_input(&self) -> u64 {
        self.input_tokens + self.cache_creation_input_tokens + self.cache_read_input_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_init() {
        let ev = ProviderEvent::from_line(
            r#"{"type":"system","subtype":"init","session_id":"abc","model":"opus","tools":[]}"#,
        )
        .unwrap();
        assert_eq!(ev.session_id().map(|s| s.as_str()), Some("abc"));
    }

    #[test]
    fn parses_stream_deltas() {
        let ev = ProviderEvent::from_line(
            r#"{"type":"stream_event","event":{"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"Hel"}}}"#,
        )
        .unwrap();
        assert_eq!(ev, ProviderEvent::text_delta(1, "Hel"));

        let ev = ProviderEvent::from_line(
            r#"{"type":"stream_event","event":{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_1","name":"Bash","input":{}}}}"#,
        )
        .unwrap();
        assert_eq!(ev, ProviderEvent::tool_block_start(0, "toolu_1", "Bash"));
    }

    #[test]
    fn unknown_kinds_do_not_fail() {
        let ev = ProviderEvent::from_line(r#"{"type":"rate_limit_event","x":1}"#).unwrap();
        assert_eq!(ev, ProviderEvent::Unknown);

        let ev = ProviderEvent::from_line(
            r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"zz"}}}"#,
        )
        .unwrap();
        assert!(matches!(
            ev,
            ProviderEvent::StreamEvent(StreamEnvelope {
                event: StreamDelta::ContentBlockDelta { delta: BlockDelta::Unknown, .. },
                ..
            })
        ));
    }

    #[test]
    fn parses_embedded_error() {
        let ev = ProviderEvent::from_line(
            r#"{"type":"assistant","message":{"id":"m1","content":[{"type":"text","text":"Invalid API key"}]},"error":"authentication_failed","session_id":"s"}"#,
        )
        .unwrap();
        match ev {
            ProviderEvent::Assistant(a) => assert_eq!(a.error.as_deref(), Some("authentication_failed")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_tool_result_and_plain_user_text() {
        let ev = ProviderEvent::from_line(
            r#"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"toolu_1","content":"ok","is_error":false}]}}"#,
        )
        .unwrap();
        assert_eq!(ev, ProviderEvent::tool_result("toolu_1", Value::from("ok"), false));

        let ev = ProviderEvent::from_line(r#"{"type":"user","message":{"content":"hi"}}"#).unwrap();
        assert!(matches!(
            ev,
            ProviderEvent::User(UserEvent { message: UserPayload { content: UserContent::Text(_) }, .. })
        ));
    }

    #[test]
    fn parses_result_usage() {
        let ev = ProviderEvent::from_line(
            r#"{"type":"result","subtype":"success","is_error":false,"session_id":"s1","total_cost_usd":0.01,"duration_ms":1200,"usage":{"input_tokens":5,"output_tokens":7,"cache_read_input_tokens":100}}"#,
        )
        .unwrap();
        match ev {
            ProviderEvent::Result(r) => {
                let usage = r.usage.unwrap();
                assert_eq!(usage.total_input(), 105);
                assert_eq!(r.duration_ms, Some(1200));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
