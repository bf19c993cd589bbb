//! v001 -- Initial schema creation.
//!
//! Creates the core tables: `users`, `conversations`, `conversation_members`,
//! and `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users (enrichment only; accounts live elsewhere)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id           TEXT PRIMARY KEY NOT NULL,   -- opaque account id
    display_name TEXT NOT NULL,
    avatar       TEXT,                        -- URL / blob pointer
    updated_at   TEXT NOT NULL                -- RFC-3339, micros
);

-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id           TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    member_key   TEXT NOT NULL UNIQUE,        -- sorted member ids, JSON array
    last_message TEXT,                        -- nullable message id
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conversation_members (
    conversation_id TEXT NOT NULL,            -- FK -> conversations(id)
    user_id         TEXT NOT NULL,

    PRIMARY KEY (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_conversation_members_user
    ON conversation_members(user_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    conversation_id TEXT NOT NULL,              -- not enforced: pointer update may lag
    sender          TEXT NOT NULL,
    receiver        TEXT NOT NULL,
    text            TEXT,
    media           TEXT,
    seen            INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    is_deleted      INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    created_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_id, created_at);

CREATE INDEX IF NOT EXISTS idx_messages_receiver
    ON messages(conversation_id, receiver);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
