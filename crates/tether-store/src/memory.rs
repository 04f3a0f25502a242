use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use tether_core::ids::{AgentSessionId, ChatId, MessageId, SubChatId};
use tether_core::parts::{MessagePart, SessionMetadata, StoredMessage};

use crate::error::StoreError;
use crate::gateway::{reply_position, LoadedSubChat, PersistenceGateway};

#[derive(Default)]
struct SubChatRecord {
    messages: Vec<StoredMessage>,
    session_id: Option<AgentSessionId>,
    streaming: bool,
}

#[derive(Default)]
struct State {
    chats: HashMap<ChatId, DateTime<Utc>>,
    sub_chats: HashMap<SubChatId, SubChatRecord>,
}

/// In-process gateway for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryGateway {
    state: Mutex<State>,
    fail_saves: Mutex<bool>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chat_updated_at(&self, chat_id: &ChatId) -> Option<DateTime<Utc>> {
        self.state.lock().chats.get(chat_id).copied()
    }

    /// Make every subsequent `save_messages` fail.
    pub fn fail_saves(&self, fail: bool) {
        *self.fail_saves.lock() = fail;
    }

    fn ensure<'a>(state: &'a mut State, chat_id: &ChatId, sub_chat_id: &SubChatId) -> &'a mut SubChatRecord {
        state.chats.entry(chat_id.clone()).or_insert_with(Utc::now);
        state.sub_chats.entry(sub_chat_id.clone()).or_default()
    }
}

impl PersistenceGateway for MemoryGateway {
    fn load_messages(&self, sub_chat_id: &SubChatId) -> Result<LoadedSubChat, StoreError> {
        let state = self.state.lock();
        Ok(state
            .sub_chats
            .get(sub_chat_id)
            .map(|r| LoadedSubChat {
                messages: r.messages.clone(),
                session_id: r.session_id.clone(),
            })
            .unwrap_or_default())
    }

    fn append_user_message(
        &self,
        chat_id: &ChatId,
        sub_chat_id: &SubChatId,
        message: &StoredMessage,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let record = Self::ensure(&mut state, chat_id, sub_chat_id);
        record.messages.push(message.clone());
        record.streaming = true;
        Ok(())
    }

    fn mark_streaming(&self, chat_id: &ChatId, sub_chat_id: &SubChatId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        Self::ensure(&mut state, chat_id, sub_chat_id).streaming = true;
        Ok(())
    }

    fn remove_message(&self, sub_chat_id: &SubChatId, message_id: &MessageId) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        let Some(record) = state.sub_chats.get_mut(sub_chat_id) else {
            return Ok(false);
        };
        let before = record.messages.len();
        record.messages.retain(|m| &m.id != message_id);
        Ok(record.messages.len() != before)
    }

    fn save_messages(
        &self,
        sub_chat_id: &SubChatId,
        reply_to: Option<&MessageId>,
        parts: &[MessagePart],
        metadata: &SessionMetadata,
    ) -> Result<(), StoreError> {
        if *self.fail_saves.lock() {
            return Err(StoreError::Unavailable("saves disabled".into()));
        }
        let mut state = self.state.lock();
        let Some(record) = state.sub_chats.get_mut(sub_chat_id) else {
            return Ok(());
        };
        if !parts.is_empty() {
            let at = reply_position(&record.messages, reply_to);
            record
                .messages
                .insert(at, StoredMessage::assistant(parts.to_vec(), metadata.clone()));
            if metadata.session_id.is_some() {
                record.session_id.clone_from(&metadata.session_id);
            }
        }
        Ok(())
    }

    fn clear_streaming(&self, sub_chat_id: &SubChatId) -> Result<(), StoreError> {
        if let Some(record) = self.state.lock().sub_chats.get_mut(sub_chat_id) {
            record.streaming = false;
        }
        Ok(())
    }

    fn touch(&self, chat_id: &ChatId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if let Some(ts) = state.chats.get_mut(chat_id) {
            *ts = Utc::now();
        }
        Ok(())
    }

    fn is_streaming(&self, sub_chat_id: &SubChatId) -> Result<bool, StoreError> {
        Ok(self
            .state
            .lock()
            .sub_chats
            .get(sub_chat_id)
            .is_some_and(|r| r.streaming))
    }
}
