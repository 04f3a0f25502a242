use tether_core::ids::{AgentSessionId, ChatId, MessageId, SubChatId};
use tether_core::parts::{MessagePart, Role, SessionMetadata, StoredMessage};

use crate::error::StoreError;

/// Everything stored for a sub-chat.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadedSubChat {
    pub messages: Vec<StoredMessage>,
    /// Upstream session to resume, learned from a previous turn.
    pub session_id: Option<AgentSessionId>,
}

impl LoadedSubChat {
    pub fn last_message(&self) -> Option<&StoredMessage> {
        self.messages.last()
    }
}

/// Chat/sub-chat document store used by the orchestrator.
///
/// Unknown sub-chats load as empty. Writes create the sub-chat on demand.
pub trait PersistenceGateway: Send + Sync {
    fn load_messages(&self, sub_chat_id: &SubChatId) -> Result<LoadedSubChat, StoreError>;

    /// Append a user message and mark the sub-chat as streaming.
    fn append_user_message(
        &self,
        chat_id: &ChatId,
        sub_chat_id: &SubChatId,
        message: &StoredMessage,
    ) -> Result<(), StoreError>;

    /// Mark the sub-chat as streaming without adding a message.
    fn mark_streaming(&self, chat_id: &ChatId, sub_chat_id: &SubChatId) -> Result<(), StoreError>;

    /// Returns whether a message was removed.
    fn remove_message(&self, sub_chat_id: &SubChatId, message_id: &MessageId) -> Result<bool, StoreError>;

    /// Terminal write for a turn. When `parts` is non-empty, stores them as an
    /// assistant message answering `reply_to` and keeps a newly learned
    /// session id. The reply lands before any later user message, so a
    /// superseded turn does not end up after its successor's prompt.
    /// Leaves the streaming marker alone.
    fn save_messages(
        &self,
        sub_chat_id: &SubChatId,
        reply_to: Option<&MessageId>,
        parts: &[MessagePart],
        metadata: &SessionMetadata,
    ) -> Result<(), StoreError>;

    fn clear_streaming(&self, sub_chat_id: &SubChatId) -> Result<(), StoreError>;

    /// Bump the parent chat's `updated_at`.
    fn touch(&self, chat_id: &ChatId) -> Result<(), StoreError>;

    fn is_streaming(&self, sub_chat_id: &SubChatId) -> Result<bool, StoreError>;
}

/// Where an assistant reply to `reply_to` belongs: ahead of the first user
/// message after it, otherwise at the end.
pub(crate) fn reply_position(messages: &[StoredMessage], reply_to: Option<&MessageId>) -> usize {
    let Some(start) = reply_to.and_then(|id| messages.iter().position(|m| &m.id == id)) else {
        return messages.len();
    };
    messages[start + 1..]
        .iter()
        .position(|m| m.role == Role::User)
        .map_or(messages.len(), |offset| start + 1 + offset)
}
