//! Domain records shared by the store and the real-time server.
//!
//! Field names serialize in camelCase because browsers are the main
//! consumers of these payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, MessageId, UserId};

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A thread between a fixed set of members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    /// Sorted, deduplicated member ids.
    pub members: Vec<UserId>,
    /// Most recent message, `None` until the first send.
    pub last_message: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    /// Refreshed whenever `last_message` changes.
    pub updated_at: DateTime<Utc>,
}

/// A conversation listing entry with its newest message resolved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_message: Option<EnrichedMessage>,
}

impl Conversation {
    pub fn has_member(&self, user: &UserId) -> bool {
        self.members.iter().any(|m| m == user)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SeenEntry {
    pub user: UserId,
    pub seen_at: DateTime<Utc>,
}

/// A direct message. Text and media are immutable once persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: UserId,
    pub receiver: UserId,
    pub text: Option<String>,
    pub media: Option<String>,
    /// Legacy single flag, true iff `seen_by` is non-empty.
    pub seen: bool,
    /// One entry per viewer, in the order they saw the message.
    pub seen_by: Vec<SeenEntry>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn seen_by_user(&self, user: &UserId) -> bool {
        self.seen_by.iter().any(|e| &e.user == user)
    }
}

// ---------------------------------------------------------------------------
// User profile (enrichment)
// ---------------------------------------------------------------------------

/// Display attributes attached to delivered messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

/// A message as pushed to clients: the persisted record plus the sender's
/// profile when the lookup succeeded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedMessage {
    #[serde(flatten)]
    pub message: Message,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_profile: Option<UserProfile>,
}

impl EnrichedMessage {
    pub fn bare(message: Message) -> Self {
        Self {
            message,
            sender_profile: None,
        }
    }
}
