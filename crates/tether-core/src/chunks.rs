//! Client-facing chunk protocol.
//!
//! Every turn delivers an ordered sequence of these, terminated by exactly one
//! [`Chunk::Finish`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ErrorCategory;
use crate::ids::{MessageId, ToolUseId};
use crate::parts::SessionMetadata;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Chunk {
    // ── Lifecycle ──
    #[serde(rename_all = "camelCase")]
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
    },
    Finish,
    StartStep,
    FinishStep,

    // ── Text ──
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },

    // ── Reasoning ──
    Reasoning {
        id: String,
        text: String,
    },
    ReasoningDelta {
        id: String,
        delta: String,
    },

    // ── Tools ──
    #[serde(rename_all = "camelCase")]
    ToolInputStart {
        tool_call_id: ToolUseId,
        tool_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputDelta {
        tool_call_id: ToolUseId,
        input_text_delta: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputAvailable {
        tool_call_id: ToolUseId,
        tool_name: String,
        input: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolOutputAvailable {
        tool_call_id: ToolUseId,
        output: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolOutputError {
        tool_call_id: ToolUseId,
        error_text: String,
    },

    // ── Interactive ──
    #[serde(rename_all = "camelCase")]
    AskUserQuestion {
        tool_use_id: ToolUseId,
        tool_name: String,
        input: Value,
    },
    #[serde(rename_all = "camelCase")]
    AskUserQuestionTimeout {
        tool_use_id: ToolUseId,
    },

    // ── Terminal / error ──
    #[serde(rename_all = "camelCase")]
    Error {
        error_text: String,
        category: ErrorCategory,
    },
    #[serde(rename_all = "camelCase")]
    AuthError {
        error_text: String,
        category: ErrorCategory,
    },
    #[serde(rename_all = "camelCase")]
    MessageMetadata {
        message_metadata: SessionMetadata,
    },
}

impl Chunk {
    /// Wire tag of this chunk.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Finish => "finish",
            Self::StartStep => "start-step",
            Self::FinishStep => "finish-step",
            Self::TextStart { .. } => "text-start",
            Self::TextDelta { .. } => "text-delta",
            Self::TextEnd { .. } => "text-end",
            Self::Reasoning { .. } => "reasoning",
            Self::ReasoningDelta { .. } => "reasoning-delta",
            Self::ToolInputStart { .. } => "tool-input-start",
            Self::ToolInputDelta { .. } => "tool-input-delta",
            Self::ToolInputAvailable { .. } => "tool-input-available",
            Self::ToolOutputAvailable { .. } => "tool-output-available",
            Self::ToolOutputError { .. } => "tool-output-error",
            Self::AskUserQuestion { .. } => "ask-user-question",
            Self::AskUserQuestionTimeout { .. } => "ask-user-question-timeout",
            Self::Error { .. } => "error",
            Self::AuthError { .. } => "auth-error",
            Self::MessageMetadata { .. } => "message-metadata",
        }
    }

    pub fn is_finish(&self) -> bool {
        matches!(self, Self::Finish)
    }

    pub fn is_error_kind(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::AuthError { .. })
    }

    pub fn error_category(&self) -> Option<ErrorCategory> {
        match self {
            Self::Error { category, .. } | Self::AuthError { category, .. } => Some(*category),
            _ => None,
        }
    }
}
