//! # parley-shared
//!
//! Types shared between the store and the real-time server: identifiers,
//! persisted domain records, and the JSON event protocol spoken over the
//! client socket.

pub mod constants;
pub mod error;
pub mod models;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use models::{
    Conversation, ConversationSummary, EnrichedMessage, Message, SeenEntry, UserProfile,
};
pub use types::{ConnId, ConversationId, MemberSet, MessageId, UserId};
