//! Tool approval broker.
//!
//! The upstream agent's permission callback parks on a oneshot channel keyed
//! by tool-use id. The user's answer, a timeout, or session teardown resolves
//! it. Each entry resolves exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use tether_core::agent::PermissionDecision;
use tether_core::ids::{SubChatId, ToolUseId, TurnId};

const TIMEOUT_MESSAGE: &str = "Timed out";
const DECLINED_MESSAGE: &str = "User declined";

/// The user's answer to an approval request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalDecision {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Value>,
}

impl ApprovalDecision {
    pub fn approve(updated_input: Option<Value>) -> Self {
        Self {
            approved: true,
            message: None,
            updated_input,
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            approved: false,
            message: Some(message.into()),
            updated_input: None,
        }
    }

    /// Permission answer for the upstream agent. Approval without edits
    /// passes the original input through.
    pub fn into_permission(self, original_input: &Value) -> PermissionDecision {
        if self.approved {
            PermissionDecision::allow(Some(
                self.updated_input.unwrap_or_else(|| original_input.clone()),
            ))
        } else {
            PermissionDecision::deny(self.message.unwrap_or_else(|| DECLINED_MESSAGE.into()))
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolutionReason {
    Answered,
    TimedOut,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Resolution {
    pub decision: ApprovalDecision,
    pub reason: ResolutionReason,
}

struct PendingApproval {
    sub_chat_id: SubChatId,
    turn_id: TurnId,
    seq: u64,
    tx: oneshot::Sender<Resolution>,
}

/// A registered request, waiting to be resolved.
pub struct ApprovalTicket {
    tool_use_id: ToolUseId,
    seq: u64,
    rx: oneshot::Receiver<Resolution>,
}

pub struct ToolApprovalBroker {
    pending: Mutex<HashMap<ToolUseId, PendingApproval>>,
    timeout: Duration,
    seq: AtomicU64,
}

impl ToolApprovalBroker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
            seq: AtomicU64::new(0),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a pending request owned by one turn. A stale entry under the
    /// same id is denied.
    pub fn register(&self, tool_use_id: ToolUseId, sub_chat_id: SubChatId, turn_id: TurnId) -> ApprovalTicket {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let previous = self.pending.lock().insert(
            tool_use_id.clone(),
            PendingApproval {
                sub_chat_id,
                turn_id,
                seq,
                tx,
            },
        );
        if let Some(stale) = previous {
            warn!(tool_use_id = %tool_use_id, "replacing pending approval");
            let _ = stale.tx.send(Resolution {
                decision: ApprovalDecision::deny("Superseded"),
                reason: ResolutionReason::Cancelled,
            });
        }
        ApprovalTicket {
            tool_use_id,
            seq,
            rx,
        }
    }

    /// Wait for a registered request to resolve.
    pub async fn wait(&self, ticket: ApprovalTicket) -> Resolution {
        let ApprovalTicket {
            tool_use_id,
            seq,
            mut rx,
        } = ticket;

        match tokio::time::timeout(self.timeout, &mut rx).await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(_)) => Resolution {
                decision: ApprovalDecision::deny("Approval channel closed"),
                reason: ResolutionReason::Cancelled,
            },
            Err(_) => {
                let removed = {
                    let mut pending = self.pending.lock();
                    match pending.get(&tool_use_id) {
                        Some(entry) if entry.seq == seq => pending.remove(&tool_use_id).is_some(),
                        _ => false,
                    }
                };
                if !removed {
                    // Resolved concurrently with the deadline.
                    if let Ok(resolution) = rx.try_recv() {
                        return resolution;
                    }
                }
                info!(tool_use_id = %tool_use_id, "approval timed out");
                Resolution {
                    decision: ApprovalDecision::deny(TIMEOUT_MESSAGE),
                    reason: ResolutionReason::TimedOut,
                }
            }
        }
    }

    pub async fn request(&self, tool_use_id: ToolUseId, sub_chat_id: SubChatId, turn_id: TurnId) -> Resolution {
        let ticket = self.register(tool_use_id, sub_chat_id, turn_id);
        self.wait(ticket).await
    }

    /// Deliver the user's answer. Unknown or already resolved ids are a no-op.
    pub fn resolve(&self, tool_use_id: &ToolUseId, decision: ApprovalDecision) -> bool {
        let Some(entry) = self.pending.lock().remove(tool_use_id) else {
            debug!(tool_use_id = %tool_use_id, "no pending approval");
            return false;
        };
        entry
            .tx
            .send(Resolution {
                decision,
                reason: ResolutionReason::Answered,
            })
            .is_ok()
    }

    /// Deny every pending request of a sub-chat.
    pub fn cancel_all(&self, sub_chat_id: &SubChatId, reason: &str) -> usize {
        let drained = self.drain_where(|p| &p.sub_chat_id == sub_chat_id);
        Self::deny_entries(drained, reason)
    }

    /// Deny the pending requests raised by one turn. Other turns of the same
    /// sub-chat keep theirs.
    pub fn cancel_turn(&self, turn_id: &TurnId, reason: &str) -> usize {
        let drained = self.drain_where(|p| &p.turn_id == turn_id);
        Self::deny_entries(drained, reason)
    }

    fn drain_where(&self, matches: impl Fn(&PendingApproval) -> bool) -> Vec<PendingApproval> {
        let mut pending = self.pending.lock();
        let ids: Vec<ToolUseId> = pending
            .iter()
            .filter(|(_, p)| matches(p))
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter().filter_map(|id| pending.remove(id)).collect()
    }

    /// Deny everything, across all sub-chats.
    pub fn deny_everything(&self, reason: &str) -> usize {
        let drained: Vec<PendingApproval> = self.pending.lock().drain().map(|(_, p)| p).collect();
        Self::deny_entries(drained, reason)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, tool_use_id: &ToolUseId) -> bool {
        self.pending.lock().contains_key(tool_use_id)
    }

    fn deny_entries(entries: Vec<PendingApproval>, reason: &str) -> usize {
        let count = entries.len();
        for entry in entries {
            let _ = entry.tx.send(Resolution {
                decision: ApprovalDecision::deny(reason),
                reason: ResolutionReason::Cancelled,
            });
        }
        if count > 0 {
            debug!(count, reason, "denied pending approvals");
        }
        count
    }
}
