//! Durable message record produced by accumulating chunks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{AgentSessionId, MessageId, ToolUseId};
use crate::prompt::Prompt;

const TOOL_PREFIX: &str = "tool-";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolState {
    Call,
    Result,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolPart {
    pub tool_name: String,
    pub tool_call_id: ToolUseId,
    pub input: Value,
    pub state: ToolState,
    pub result: Option<Value>,
    pub is_error: bool,
}

impl ToolPart {
    pub fn call(tool_call_id: ToolUseId, tool_name: impl Into<String>, input: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            tool_call_id,
            input,
            state: ToolState::Call,
            result: None,
            is_error: false,
        }
    }

    /// Move to the `result` state. Returns false if already resolved.
    pub fn resolve(&mut self, result: Value, is_error: bool) -> bool {
        if self.state == ToolState::Result {
            return false;
        }
        self.state = ToolState::Result;
        self.result = Some(result);
        self.is_error = is_error;
        true
    }
}

/// One accumulated artifact. Serialized with `type` set to `text`, `image`
/// or `tool-<name>`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPart", into = "RawPart")]
pub enum MessagePart {
    Text {
        text: String,
    },
    Image {
        media_type: String,
        data: String,
        filename: Option<String>,
    },
    Tool(ToolPart),
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn as_tool(&self) -> Option<&ToolPart> {
        match self {
            Self::Tool(t) => Some(t),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<ToolUseId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state: Option<ToolState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    is_error: bool,
}

impl RawPart {
    fn empty(kind: String) -> Self {
        Self {
            kind,
            text: None,
            media_type: None,
            data: None,
            filename: None,
            tool_call_id: None,
            input: None,
            state: None,
            result: None,
            is_error: false,
        }
    }
}

impl From<MessagePart> for RawPart {
    fn from(part: MessagePart) -> Self {
        match part {
            MessagePart::Text { text } => RawPart {
                text: Some(text),
                ..RawPart::empty("text".into())
            },
            MessagePart::Image { media_type, data, filename } => RawPart {
                media_type: Some(media_type),
                data: Some(data),
                filename,
                ..RawPart::empty("image".into())
            },
            MessagePart::Tool(tool) => RawPart {
                tool_call_id: Some(tool.tool_call_id),
                input: Some(tool.input),
                state: Some(tool.state),
                result: tool.result,
                is_error: tool.is_error,
                ..RawPart::empty(format!("{TOOL_PREFIX}{}", tool.tool_name))
            },
        }
    }
}

impl TryFrom<RawPart> for MessagePart {
    type Error = String;

    fn try_from(raw: RawPart) -> Result<Self, Self::Error> {
        match raw.kind.as_str() {
            "text" => Ok(Self::Text {
                text: raw.text.unwrap_or_default(),
            }),
            "image" => Ok(Self::Image {
                media_type: raw.media_type.ok_or("image part missing mediaType")?,
                data: raw.data.ok_or("image part missing data")?,
                filename: raw.filename,
            }),
            other => {
                let tool_name = other
                    .strip_prefix(TOOL_PREFIX)
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| format!("unknown part type: {other}"))?;
                Ok(Self::Tool(ToolPart {
                    tool_name: tool_name.to_owned(),
                    tool_call_id: raw.tool_call_id.ok_or("tool part missing toolCallId")?,
                    input: raw.input.unwrap_or(Value::Null),
                    state: raw.state.unwrap_or(ToolState::Call),
                    result: raw.result,
                    is_error: raw.is_error,
                }))
            }
        }
    }
}

/// Per-turn metadata; merged last-writer-wins per field.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<AgentSessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl SessionMetadata {
    pub fn merge(&mut self, other: &SessionMetadata) {
        if other.session_id.is_some() {
            self.session_id.clone_from(&other.session_id);
        }
        if other.input_tokens.is_some() {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens.is_some() {
            self.output_tokens = other.output_tokens;
        }
        if other.total_tokens.is_some() {
            self.total_tokens = other.total_tokens;
        }
        if other.total_cost_usd.is_some() {
            self.total_cost_usd = other.total_cost_usd;
        }
        if other.duration_ms.is_some() {
            self.duration_ms = other.duration_ms;
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: MessageId,
    pub role: Role,
    pub parts: Vec<MessagePart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SessionMetadata>,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn user(prompt: &Prompt) -> Self {
        let mut parts: Vec<MessagePart> = prompt
            .images
            .iter()
            .map(|img| MessagePart::Image {
                media_type: img.media_type.clone(),
                data: img.data.clone(),
                filename: img.filename.clone(),
            })
            .collect();
        if !prompt.text.trim().is_empty() {
            parts.push(MessagePart::text(prompt.text.clone()));
        }
        Self {
            id: MessageId::new(),
            role: Role::User,
            parts,
            metadata: None,
            created_at: Utc::now(),
        }
    }

    pub fn assistant(parts: Vec<MessagePart>, metadata: SessionMetadata) -> Self {
        Self {
            id: MessageId::new(),
            role: Role::Assistant,
            parts,
            metadata: (!metadata.is_empty()).then_some(metadata),
            created_at: Utc::now(),
        }
    }

    /// Concatenated text parts.
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}
