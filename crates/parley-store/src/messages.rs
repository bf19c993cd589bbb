use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use parley_shared::{ConversationId, Message, MessageId, SeenEntry, UserId};

use crate::database::{decode_ts, decode_uuid, encode_ts, Database};
use crate::error::Result;

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender, receiver, text, media, seen, is_deleted, created_at";

impl Database {
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        self.conn().execute(
            "INSERT INTO messages (id, conversation_id, sender, receiver, text, media, seen, is_deleted, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                message.id.0.to_string(),
                message.conversation_id.0.to_string(),
                message.sender.as_str(),
                message.receiver.as_str(),
                message.text,
                message.media,
                message.seen,
                message.is_deleted,
                encode_ts(&message.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_message(&self, id: MessageId) -> Result<Option<Message>> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.0.to_string()],
                row_to_message,
            )
            .optional()?;

        row.map(|m| self.with_seen_by(m)).transpose()
    }

    /// Conversation history in chronological order.
    ///
    /// Returns at most `limit` messages created strictly before `before`
    /// (or the newest ones when `before` is `None`).
    pub fn list_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE conversation_id = ?1
               AND (?2 IS NULL OR created_at < ?2)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?3"
        ))?;

        let rows = stmt.query_map(
            params![
                conversation_id.0.to_string(),
                before.as_ref().map(encode_ts),
                limit
            ],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(self.with_seen_by(row?)?);
        }
        messages.reverse();
        Ok(messages)
    }

    /// Messages in `conversation_id` addressed to `user`, not deleted, and
    /// not yet seen by `user`. Oldest first.
    pub fn unseen_for_receiver(
        &self,
        conversation_id: ConversationId,
        user: &UserId,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages m
             WHERE m.conversation_id = ?1
               AND m.receiver = ?2
               AND m.is_deleted = 0
               AND NOT EXISTS (
                   SELECT 1 FROM message_seen s
                   WHERE s.message_id = m.id AND s.user_id = ?2
               )
             ORDER BY m.created_at ASC, m.rowid ASC"
        ))?;

        let rows = stmt.query_map(
            params![conversation_id.0.to_string(), user.as_str()],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(self.with_seen_by(row?)?);
        }
        Ok(messages)
    }

    /// Record that `user` saw the message.
    ///
    /// At most one entry per user is ever stored; repeated calls leave the
    /// first `seen_at` in place. Returns the updated message and whether this
    /// call added the entry, or `None` if the message does not exist.
    pub fn append_seen(
        &self,
        id: MessageId,
        user: &UserId,
        at: DateTime<Utc>,
    ) -> Result<Option<(Message, bool)>> {
        let tx = self.conn().unchecked_transaction()?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM messages WHERE id = ?1",
                params![id.0.to_string()],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        if !exists {
            return Ok(None);
        }

        let added = tx.execute(
            "INSERT OR IGNORE INTO message_seen (message_id, user_id, seen_at)
             VALUES (?1, ?2, ?3)",
            params![id.0.to_string(), user.as_str(), encode_ts(&at)],
        )? == 1;

        if added {
            tx.execute(
                "UPDATE messages SET seen = 1 WHERE id = ?1",
                params![id.0.to_string()],
            )?;
        }

        tx.commit()?;

        Ok(self.get_message(id)?.map(|m| (m, added)))
    }

    /// Soft-delete a message. Returns the updated record, or `None` if it
    /// does not exist.
    pub fn soft_delete_message(&self, id: MessageId) -> Result<Option<Message>> {
        let affected = self.conn().execute(
            "UPDATE messages SET is_deleted = 1 WHERE id = ?1",
            params![id.0.to_string()],
        )?;
        if affected == 0 {
            return Ok(None);
        }
        self.get_message(id)
    }

    fn with_seen_by(&self, mut message: Message) -> Result<Message> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id, seen_at FROM message_seen
             WHERE message_id = ?1
             ORDER BY seen_at ASC, rowid ASC",
        )?;

        let rows = stmt.query_map(params![message.id.0.to_string()], |row| {
            let user: String = row.get(0)?;
            let seen_at: String = row.get(1)?;
            Ok(SeenEntry {
                user: UserId(user),
                seen_at: decode_ts(1, &seen_at)?,
            })
        })?;

        for row in rows {
            message.seen_by.push(row?);
        }
        Ok(message)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let conversation_str: String = row.get(1)?;
    let ts_str: String = row.get(8)?;

    Ok(Message {
        id: MessageId(decode_uuid(0, &id_str)?),
        conversation_id: ConversationId(decode_uuid(1, &conversation_str)?),
        sender: UserId(row.get(2)?),
        receiver: UserId(row.get(3)?),
        text: row.get(4)?,
        media: row.get(5)?,
        seen: row.get(6)?,
        seen_by: Vec::new(),
        is_deleted: row.get(7)?,
        created_at: decode_ts(8, &ts_str)?,
    })
}
