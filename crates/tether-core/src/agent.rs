//! Seams to the upstream agent.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::errors::UpstreamError;
use crate::ids::{AgentSessionId, SubChatId, ToolUseId};
use crate::prompt::{PermissionMode, PromptContent};
use crate::provider::ProviderEvent;

pub type ProviderStream = Pin<Box<dyn Stream<Item = Result<ProviderEvent, UpstreamError>> + Send>>;

/// Everything needed to open one upstream stream.
#[derive(Clone, Debug)]
pub struct AgentRequest {
    pub sub_chat_id: SubChatId,
    pub prompt: PromptContent,
    pub working_directory: PathBuf,
    /// Per-sub-chat config namespace, so parallel sub-chats in the same
    /// project never share agent state.
    pub config_dir: PathBuf,
    pub env: HashMap<String, String>,
    pub permission_mode: PermissionMode,
    pub resume_session_id: Option<AgentSessionId>,
    pub model: Option<String>,
    pub cancel: CancellationToken,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionBehavior {
    Allow,
    Deny,
}

/// Answer to a tool-use permission request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionDecision {
    pub behavior: PermissionBehavior,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PermissionDecision {
    pub fn allow(updated_input: Option<Value>) -> Self {
        Self {
            behavior: PermissionBehavior::Allow,
            updated_input,
            message: None,
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            behavior: PermissionBehavior::Deny,
            updated_input: None,
            message: Some(message.into()),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.behavior == PermissionBehavior::Allow
    }
}

/// Interactive approval callback handed to the upstream agent.
#[async_trait]
pub trait ToolApprover: Send + Sync {
    async fn can_use_tool(
        &self,
        tool_name: &str,
        input: &Value,
        tool_use_id: &ToolUseId,
    ) -> PermissionDecision;
}

/// Approver that lets every tool through.
pub struct AllowAll;

#[async_trait]
impl ToolApprover for AllowAll {
    async fn can_use_tool(&self, _: &str, input: &Value, _: &ToolUseId) -> PermissionDecision {
        PermissionDecision::allow(Some(input.clone()))
    }
}

/// A source of provider-native events for one turn.
#[async_trait]
pub trait UpstreamAgent: Send + Sync {
    fn name(&self) -> &str;

    /// Open the event stream. Implementations must stop producing events once
    /// `request.cancel` fires.
    async fn open(
        &self,
        request: AgentRequest,
        approver: Arc<dyn ToolApprover>,
    ) -> Result<ProviderStream, UpstreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn allow_all_echoes_input() {
        let decision = AllowAll
            .can_use_tool("Bash", &json!({"command": "ls"}), &ToolUseId::new())
            .await;
        assert!(decision.is_allowed());
        assert_eq!(decision.updated_input, Some(json!({"command": "ls"})));
    }

    #[test]
    fn decision_wire_shape() {
        let json = serde_json::to_value(PermissionDecision::deny("Timed out")).unwrap();
        assert_eq!(json, json!({"behavior": "deny", "message": "Timed out"}));
        let parsed: PermissionDecision =
            serde_json::from_value(json!({"behavior": "allow", "updatedInput": {"a": 1}})).unwrap();
        assert!(parsed.is_allowed());
    }
}
