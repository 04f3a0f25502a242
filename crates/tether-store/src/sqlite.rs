use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, instrument};

use tether_core::ids::{AgentSessionId, ChatId, MessageId, SubChatId};
use tether_core::parts::{MessagePart, SessionMetadata, StoredMessage};

use crate::database::Database;
use crate::error::StoreError;
use crate::gateway::{reply_position, LoadedSubChat, PersistenceGateway};

/// SQLite-backed gateway. One JSON document of messages per sub-chat.
#[derive(Clone)]
pub struct SqliteGateway {
    db: Database,
}

impl SqliteGateway {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// `updated_at` of a chat, if it exists.
    pub fn chat_updated_at(&self, chat_id: &ChatId) -> Result<Option<String>, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT updated_at FROM chats WHERE id = ?1",
                    [chat_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }
}

fn ensure_sub_chat(conn: &Connection, chat_id: &ChatId, sub_chat_id: &SubChatId) -> Result<(), StoreError> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT OR IGNORE INTO chats (id, created_at, updated_at) VALUES (?1, ?2, ?2)",
        rusqlite::params![chat_id.as_str(), now],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO sub_chats (id, chat_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
        rusqlite::params![sub_chat_id.as_str(), chat_id.as_str(), now],
    )?;
    Ok(())
}

fn read_messages(conn: &Connection, sub_chat_id: &SubChatId) -> Result<Option<Vec<StoredMessage>>, StoreError> {
    let doc: Option<String> = conn
        .query_row(
            "SELECT messages FROM sub_chats WHERE id = ?1",
            [sub_chat_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    doc.map(|d| serde_json::from_str(&d).map_err(StoreError::from))
        .transpose()
}

fn write_messages(conn: &Connection, sub_chat_id: &SubChatId, messages: &[StoredMessage]) -> Result<(), StoreError> {
    let doc = serde_json::to_string(messages)?;
    conn.execute(
        "UPDATE sub_chats SET messages = ?1, updated_at = ?2 WHERE id = ?3",
        rusqlite::params![doc, Utc::now().to_rfc3339(), sub_chat_id.as_str()],
    )?;
    Ok(())
}

impl PersistenceGateway for SqliteGateway {
    #[instrument(skip(self), fields(sub_chat_id = %sub_chat_id))]
    fn load_messages(&self, sub_chat_id: &SubChatId) -> Result<LoadedSubChat, StoreError> {
        self.db.with_conn(|conn| {
            let row: Option<(String, Option<String>)> = conn
                .query_row(
                    "SELECT messages, session_id FROM sub_chats WHERE id = ?1",
                    [sub_chat_id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            match row {
                Some((doc, session_id)) => Ok(LoadedSubChat {
                    messages: serde_json::from_str(&doc)?,
                    session_id: session_id.map(AgentSessionId::from_raw),
                }),
                None => Ok(LoadedSubChat::default()),
            }
        })
    }

    #[instrument(skip(self, message), fields(sub_chat_id = %sub_chat_id, message_id = %message.id))]
    fn append_user_message(
        &self,
        chat_id: &ChatId,
        sub_chat_id: &SubChatId,
        message: &StoredMessage,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            ensure_sub_chat(conn, chat_id, sub_chat_id)?;
            let mut messages = read_messages(conn, sub_chat_id)?.unwrap_or_default();
            messages.push(message.clone());
            write_messages(conn, sub_chat_id, &messages)?;
            conn.execute(
                "UPDATE sub_chats SET is_streaming = 1 WHERE id = ?1",
                [sub_chat_id.as_str()],
            )?;
            Ok(())
        })
    }

    fn mark_streaming(&self, chat_id: &ChatId, sub_chat_id: &SubChatId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            ensure_sub_chat(conn, chat_id, sub_chat_id)?;
            conn.execute(
                "UPDATE sub_chats SET is_streaming = 1 WHERE id = ?1",
                [sub_chat_id.as_str()],
            )?;
            Ok(())
        })
    }

    fn remove_message(&self, sub_chat_id: &SubChatId, message_id: &MessageId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let Some(mut messages) = read_messages(conn, sub_chat_id)? else {
                return Ok(false);
            };
            let before = messages.len();
            messages.retain(|m| &m.id != message_id);
            if messages.len() == before {
                return Ok(false);
            }
            write_messages(conn, sub_chat_id, &messages)?;
            Ok(true)
        })
    }

    #[instrument(skip(self, parts, metadata), fields(sub_chat_id = %sub_chat_id, parts = parts.len()))]
    fn save_messages(
        &self,
        sub_chat_id: &SubChatId,
        reply_to: Option<&MessageId>,
        parts: &[MessagePart],
        metadata: &SessionMetadata,
    ) -> Result<(), StoreError> {
        if parts.is_empty() {
            return Ok(());
        }
        self.db.with_conn(|conn| {
            let Some(mut messages) = read_messages(conn, sub_chat_id)? else {
                debug!("sub-chat row missing, assistant message dropped");
                return Ok(());
            };
            let at = reply_position(&messages, reply_to);
            messages.insert(at, StoredMessage::assistant(parts.to_vec(), metadata.clone()));
            write_messages(conn, sub_chat_id, &messages)?;
            if let Some(session_id) = &metadata.session_id {
                conn.execute(
                    "UPDATE sub_chats SET session_id = ?1 WHERE id = ?2",
                    rusqlite::params![session_id.as_str(), sub_chat_id.as_str()],
                )?;
            }
            Ok(())
        })
    }

    fn clear_streaming(&self, sub_chat_id: &SubChatId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sub_chats SET is_streaming = 0 WHERE id = ?1",
                [sub_chat_id.as_str()],
            )?;
            Ok(())
        })
    }

    fn touch(&self, chat_id: &ChatId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE chats SET updated_at = ?1 WHERE id = ?2",
                rusqlite::params![Utc::now().to_rfc3339(), chat_id.as_str()],
            )?;
            Ok(())
        })
    }

    fn is_streaming(&self, sub_chat_id: &SubChatId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let flag: Option<i64> = conn
                .query_row(
                    "SELECT is_streaming FROM sub_chats WHERE id = ?1",
                    [sub_chat_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(flag.unwrap_or(0) != 0)
        })
    }
}
