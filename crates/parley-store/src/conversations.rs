//! CRUD operations for [`Conversation`] records.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use parley_shared::{Conversation, ConversationId, MemberSet, MessageId, UserId};

use crate::database::{decode_ts, decode_uuid, encode_ts, Database};
use crate::error::{Result, StoreError};

const CONVERSATION_COLUMNS: &str = "id, last_message, created_at, updated_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Return the conversation for `members`, creating it if none exists.
    ///
    /// The member set is the identity of a conversation: the unique
    /// `member_key` column turns concurrent creates into a single row.
    /// The boolean is `true` when this call inserted the row.
    pub fn create_or_get_conversation(&self, members: &MemberSet) -> Result<(Conversation, bool)> {
        let key = members.key();
        let now = encode_ts(&Utc::now());
        let id = ConversationId::new();

        let tx = self.conn().unchecked_transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO conversations (id, member_key, last_message, created_at, updated_at)
             VALUES (?1, ?2, NULL, ?3, ?3)",
            params![id.0.to_string(), key, now],
        )? == 1;

        if inserted {
            for member in members.iter() {
                tx.execute(
                    "INSERT INTO conversation_members (conversation_id, user_id) VALUES (?1, ?2)",
                    params![id.0.to_string(), member.as_str()],
                )?;
            }
        }

        tx.commit()?;

        let conversation = self
            .find_conversation_by_members(members)?
            .ok_or(StoreError::NotFound)?;

        if inserted {
            tracing::debug!(conversation = %conversation.id, "created conversation");
        }

        Ok((conversation, inserted))
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single conversation by id.
    pub fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id.0.to_string()],
                row_to_conversation,
            )
            .optional()?;

        row.map(|c| self.with_members(c)).transpose()
    }

    /// Look a conversation up by its exact member set.
    pub fn find_conversation_by_members(&self, members: &MemberSet) -> Result<Option<Conversation>> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE member_key = ?1"),
                params![members.key()],
                row_to_conversation,
            )
            .optional()?;

        row.map(|c| self.with_members(c)).transpose()
    }

    /// Conversations `user` belongs to, most recently active first.
    pub fn list_conversations_for_user(&self, user: &UserId) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(
            "SELECT c.id, c.last_message, c.created_at, c.updated_at
             FROM conversations c
             JOIN conversation_members m ON m.conversation_id = c.id
             WHERE m.user_id = ?1
             ORDER BY c.updated_at DESC",
        )?;

        let rows = stmt.query_map(params![user.as_str()], row_to_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(self.with_members(row?)?);
        }
        Ok(conversations)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Point the conversation at its newest message and bump `updated_at`.
    ///
    /// The pointer only moves forward: an update stamped earlier than the
    /// current `updated_at` leaves the row alone and still counts as applied.
    /// Returns `false` if the conversation does not exist.
    pub fn set_last_message(
        &self,
        id: ConversationId,
        message_id: MessageId,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE conversations SET last_message = ?2, updated_at = ?3
             WHERE id = ?1 AND updated_at <= ?3",
            params![id.0.to_string(), message_id.0.to_string(), encode_ts(&at)],
        )?;
        if affected > 0 {
            return Ok(true);
        }

        let exists = self
            .conn()
            .query_row(
                "SELECT 1 FROM conversations WHERE id = ?1",
                params![id.0.to_string()],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            tracing::debug!(conversation = %id, message = %message_id, "stale pointer update ignored");
        }
        Ok(exists)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn with_members(&self, mut conversation: Conversation) -> Result<Conversation> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id FROM conversation_members
             WHERE conversation_id = ?1
             ORDER BY user_id ASC",
        )?;

        let rows = stmt.query_map(params![conversation.id.0.to_string()], |row| {
            row.get::<_, String>(0).map(UserId)
        })?;

        for row in rows {
            conversation.members.push(row?);
        }
        Ok(conversation)
    }
}

/// Map a `rusqlite::Row` to a [`Conversation`] without its members.
fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let id_str: String = row.get(0)?;
    let last_str: Option<String> = row.get(1)?;
    let created_str: String = row.get(2)?;
    let updated_str: String = row.get(3)?;

    let last_message = last_str
        .map(|s| decode_uuid(1, &s).map(MessageId))
        .transpose()?;

    Ok(Conversation {
        id: ConversationId(decode_uuid(0, &id_str)?),
        members: Vec::new(),
        last_message,
        created_at: decode_ts(2, &created_str)?,
        updated_at: decode_ts(3, &updated_str)?,
    })
}
