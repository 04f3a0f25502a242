use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use tether_core::ids::{SubChatId, ToolUseId};
use tether_engine::{ApprovalDecision, TurnOrchestrator, TurnRequest};
use tether_store::LoadedSubChat;

use crate::bridge::{TransportBridge, TurnStream};
use crate::error::ServerError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelResult {
    pub cancelled: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveResult {
    pub ok: bool,
}

/// Operations the UI process drives a sub-chat with.
#[derive(Clone)]
pub struct ControlSurface {
    bridge: Arc<TransportBridge>,
}

impl ControlSurface {
    pub fn new(orchestrator: Arc<TurnOrchestrator>) -> Self {
        Self {
            bridge: Arc::new(TransportBridge::new(orchestrator)),
        }
    }

    pub fn bridge(&self) -> &Arc<TransportBridge> {
        &self.bridge
    }

    pub fn start_turn(&self, request: TurnRequest) -> Result<TurnStream, ServerError> {
        Ok(self.bridge.open(request)?)
    }

    #[instrument(skip(self), fields(sub_chat_id = %sub_chat_id))]
    pub fn cancel(&self, sub_chat_id: &SubChatId) -> CancelResult {
        let cancelled = self.bridge.orchestrator().cancel(sub_chat_id);
        info!(cancelled, "cancel requested");
        CancelResult { cancelled }
    }

    pub fn is_active(&self, sub_chat_id: &SubChatId) -> bool {
        self.bridge.orchestrator().is_active(sub_chat_id)
    }

    #[instrument(skip(self, decision), fields(tool_use_id = %tool_use_id, approved = decision.approved))]
    pub fn resolve_approval(&self, tool_use_id: &ToolUseId, decision: ApprovalDecision) -> ResolveResult {
        ResolveResult {
            ok: self.bridge.orchestrator().resolve_approval(tool_use_id, decision),
        }
    }

    /// Re-submit the prompt parked by an auth failure.
    pub fn retry(&self, sub_chat_id: &SubChatId) -> Result<TurnStream, ServerError> {
        let request = self
            .bridge
            .take_pending_retry(sub_chat_id)
            .ok_or_else(|| ServerError::NoPendingRetry(sub_chat_id.clone()))?;
        info!(sub_chat_id = %sub_chat_id, "retrying parked prompt");
        self.start_turn(request)
    }

    pub fn messages(&self, sub_chat_id: &SubChatId) -> Result<LoadedSubChat, ServerError> {
        Ok(self.bridge.orchestrator().messages(sub_chat_id)?)
    }
}
