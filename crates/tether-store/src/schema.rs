//! Store layout. Each sub-chat keeps its whole message history as one JSON
//! document; the version lives in `PRAGMA user_version`.

pub const SCHEMA_VERSION: u32 = 1;

/// Applied to every connection before migrating.
pub const CONNECTION_PRAGMAS: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
";

/// Brings an empty database to version 1.
pub const MIGRATION_V1: &str = "
CREATE TABLE IF NOT EXISTS chats (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sub_chats (
    id TEXT PRIMARY KEY,
    chat_id TEXT NOT NULL REFERENCES chats(id),
    messages TEXT NOT NULL DEFAULT '[]',
    session_id TEXT,
    is_streaming INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sub_chats_chat ON sub_chats(chat_id);
";
