use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::MAX_TEXT_CHARS;
use crate::error::ProtocolError;
use crate::models::EnrichedMessage;
use crate::types::{ConversationId, MessageId, UserId};

/// Events a client sends over its socket.
///
/// Frames are JSON objects of the form `{"event": "send-message", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    IdentityAnnounce(IdentityAnnounce),
    SendMessage(SendMessage),
    MarkSeen(MarkSeen),
    MarkAllSeen(MarkAllSeen),
    JoinConversation(ConversationRef),
    LeaveConversation(ConversationRef),
    Typing(TypingSignal),
    StopTyping(TypingSignal),
    AddReaction(ReactionSignal),
    RemoveReaction(ReactionSignal),
    MessageDelivered(DeliveredAck),
    DeleteMessage(DeleteMessage),
    GetOnlineUsers,
    Logout,
}

impl ClientEvent {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Wire name of the event, echoed back in error payloads.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::IdentityAnnounce(_) => "identity-announce",
            ClientEvent::SendMessage(_) => "send-message",
            ClientEvent::MarkSeen(_) => "mark-seen",
            ClientEvent::MarkAllSeen(_) => "mark-all-seen",
            ClientEvent::JoinConversation(_) => "join-conversation",
            ClientEvent::LeaveConversation(_) => "leave-conversation",
            ClientEvent::Typing(_) => "typing",
            ClientEvent::StopTyping(_) => "stop-typing",
            ClientEvent::AddReaction(_) => "add-reaction",
            ClientEvent::RemoveReaction(_) => "remove-reaction",
            ClientEvent::MessageDelivered(_) => "message-delivered",
            ClientEvent::DeleteMessage(_) => "delete-message",
            ClientEvent::GetOnlineUsers => "get-online-users",
            ClientEvent::Logout => "logout",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityAnnounce {
    pub user_id: UserId,
}

/// Raw send request. Every field is optional on the wire so that missing
/// fields surface as a validation error instead of a parse error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub sender: Option<UserId>,
    #[serde(default)]
    pub receiver: Option<UserId>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media: Option<String>,
}

/// A send request that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender: UserId,
    pub receiver: UserId,
    pub text: Option<String>,
    pub media: Option<String>,
}

impl SendMessage {
    /// Check required fields and content limits. Empty strings count as absent.
    pub fn validate(self) -> Result<NewMessage, ProtocolError> {
        let conversation_id = self
            .conversation_id
            .ok_or(ProtocolError::MissingField("conversationId"))?;
        let sender = self
            .sender
            .filter(|s| !s.is_empty())
            .ok_or(ProtocolError::MissingField("sender"))?;
        let receiver = self
            .receiver
            .filter(|r| !r.is_empty())
            .ok_or(ProtocolError::MissingField("receiver"))?;

        let text = self.text.filter(|t| !t.is_empty());
        let media = self.media.filter(|m| !m.is_empty());

        if text.is_none() && media.is_none() {
            return Err(ProtocolError::EmptyMessage);
        }

        if let Some(ref t) = text {
            let len = t.chars().count();
            if len > MAX_TEXT_CHARS {
                return Err(ProtocolError::TextTooLong {
                    len,
                    max: MAX_TEXT_CHARS,
                });
            }
        }

        Ok(NewMessage {
            conversation_id,
            sender,
            receiver,
            text,
            media,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkSeen {
    pub message_id: MessageId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkAllSeen {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
    pub conversation_id: ConversationId,
}

/// Typing indicator. Routed to the conversation room when
/// `conversation_id` is set, otherwise to the receiver's handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub receiver_id: Option<UserId>,
    pub sender_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionSignal {
    pub message_id: MessageId,
    #[serde(default)]
    pub emoji: Option<String>,
    pub user_id: UserId,
    /// Scopes the broadcast to a conversation room; everyone otherwise.
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveredAck {
    pub message_id: MessageId,
    pub sender_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessage {
    pub message_id: MessageId,
    pub user_id: UserId,
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// Events pushed by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    MessageReceived(EnrichedMessage),
    MessageSent(EnrichedMessage),
    MessageError(ErrorPayload),
    MessageSeen(SeenNotice),
    MessageDeliveredUpdate(MessageRef),
    MessageDeleted(DeletedNotice),
    UserOnline(PresenceNotice),
    UserOffline(PresenceNotice),
    OnlineUsers(Vec<UserId>),
    Typing(TypingNotice),
    StopTyping(TypingNotice),
    ReactionAdded(ReactionNotice),
    ReactionRemoved(ReactionNotice),
}

impl ServerEvent {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn error(event: Option<&str>, error: impl Into<String>) -> Self {
        ServerEvent::MessageError(ErrorPayload {
            error: error.into(),
            event: event.map(str::to_string),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub error: String,
    /// Client event that caused the failure, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SeenNotice {
    pub message_id: MessageId,
    pub seen_by: UserId,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeletedNotice {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceNotice {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReactionNotice {
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
    pub user_id: UserId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn valid_send() -> SendMessage {
        SendMessage {
            conversation_id: Some(ConversationId(Uuid::new_v4())),
            sender: Some(UserId::from("alice")),
            receiver: Some(UserId::from("bob")),
            text: Some("hi".into()),
            media: None,
        }
    }

    #[test]
    fn test_parse_send_message_frame() {
        let conv = Uuid::new_v4();
        let json = format!(
            r#"{{"event":"send-message","data":{{"conversationId":"{conv}","sender":"a","receiver":"b","text":"hi"}}}}"#
        );
        let event = ClientEvent::from_json(&json).unwrap();
        let ClientEvent::SendMessage(send) = event else {
            panic!("wrong variant");
        };
        assert_eq!(send.conversation_id, Some(ConversationId(conv)));
        assert_eq!(send.text.as_deref(), Some("hi"));
        assert!(send.media.is_none());
    }

    #[test]
    fn test_parse_unit_events() {
        let event = ClientEvent::from_json(r#"{"event":"logout"}"#).unwrap();
        assert!(matches!(event, ClientEvent::Logout));
        let event = ClientEvent::from_json(r#"{"event":"get-online-users"}"#).unwrap();
        assert_eq!(event.name(), "get-online-users");
    }

    #[test]
    fn test_unknown_event_is_malformed() {
        let err = ClientEvent::from_json(r#"{"event":"fly","data":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_validate_accepts_text_or_media() {
        assert!(valid_send().validate().is_ok());

        let media_only = SendMessage {
            text: None,
            media: Some("https://cdn.example/cat.png".into()),
            ..valid_send()
        };
        let msg = media_only.validate().unwrap();
        assert!(msg.text.is_none());
        assert!(msg.media.is_some());
    }

    #[test]
    fn test_validate_rejects_empty_content() {
        let empty = SendMessage {
            text: Some(String::new()),
            media: Some(String::new()),
            ..valid_send()
        };
        assert!(matches!(empty.validate(), Err(ProtocolError::EmptyMessage)));
    }

    #[test]
    fn test_validate_text_length_limit() {
        let at_limit = SendMessage {
            text: Some("x".repeat(MAX_TEXT_CHARS)),
            ..valid_send()
        };
        assert!(at_limit.validate().is_ok());

        let over = SendMessage {
            text: Some("x".repeat(MAX_TEXT_CHARS + 1)),
            ..valid_send()
        };
        assert!(matches!(
            over.validate(),
            Err(ProtocolError::TextTooLong { len: 1001, .. })
        ));
    }

    #[test]
    fn test_validate_counts_characters_not_bytes() {
        let accents = SendMessage {
            text: Some("é".repeat(MAX_TEXT_CHARS)),
            ..valid_send()
        };
        assert!(accents.validate().is_ok());
    }

    #[test]
    fn test_validate_missing_fields() {
        let no_conv = SendMessage {
            conversation_id: None,
            ..valid_send()
        };
        assert!(matches!(
            no_conv.validate(),
            Err(ProtocolError::MissingField("conversationId"))
        ));

        let blank_receiver = SendMessage {
            receiver: Some(UserId::from("")),
            ..valid_send()
        };
        assert!(matches!(
            blank_receiver.validate(),
            Err(ProtocolError::MissingField("receiver"))
        ));
    }

    #[test]
    fn test_server_event_shape() {
        let event = ServerEvent::UserOnline(PresenceNotice {
            user_id: UserId::from("alice"),
        });
        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["event"], "user-online");
        assert_eq!(json["data"]["userId"], "alice");
    }
}
