//! The messaging service: send pipeline, seen receipts, deletes, and the
//! fire-and-forget signals (typing, reactions, delivery acks).
//!
//! Handlers here never touch a socket directly. Everything outbound goes
//! through the [`Dispatcher`], and every failure comes back as a
//! [`MessagingError`] for the connection layer to report.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use parley_shared::protocol::{
    DeletedNotice, DeliveredAck, MessageRef, ReactionNotice, ReactionSignal, SeenNotice,
    SendMessage, ServerEvent, TypingNotice, TypingSignal,
};
use parley_shared::{
    ConnId, Conversation, ConversationId, ConversationSummary, EnrichedMessage, MemberSet, Message, MessageId, UserId,
    UserProfile,
};

use crate::backend::Stores;
use crate::dedup::{DuplicateGuard, Ticket, Verdict};
use crate::dispatcher::Dispatcher;
use crate::error::MessagingError;

pub type Result<T> = std::result::Result<T, MessagingError>;

#[derive(Clone)]
pub struct Messaging {
    stores: Stores,
    guard: DuplicateGuard,
    dispatcher: Dispatcher,
}

impl Messaging {
    pub fn new(stores: Stores, guard: DuplicateGuard, dispatcher: Dispatcher) -> Self {
        Self {
            stores,
            guard,
            dispatcher,
        }
    }

    pub fn guard(&self) -> &DuplicateGuard {
        &self.guard
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    // ------------------------------------------------------------------
    // Send
    // ------------------------------------------------------------------

    /// Validate, suppress retries, persist, point the conversation at the
    /// new message, then deliver and acknowledge.
    ///
    /// A retry of a send still inside the duplicate window is acknowledged
    /// with the message the first attempt stored and is not delivered again.
    pub async fn send_message(
        &self,
        origin: ConnId,
        bound: &UserId,
        request: SendMessage,
    ) -> Result<EnrichedMessage> {
        self.send(Some(origin), bound, request).await
    }

    /// The same pipeline for a send with no socket behind it. The request's
    /// own sender is the acting identity and no acknowledgement is pushed.
    pub async fn post_message(&self, request: SendMessage) -> Result<EnrichedMessage> {
        let sender = request.sender.clone().unwrap_or_else(|| UserId::from(""));
        self.send(None, &sender, request).await
    }

    async fn send(
        &self,
        origin: Option<ConnId>,
        bound: &UserId,
        request: SendMessage,
    ) -> Result<EnrichedMessage> {
        let new = request.validate()?;
        ensure_self(bound, &new.sender)?;

        // Media-only sends carry nothing comparable.
        let ticket = match new.text.as_deref() {
            Some(text) => match self.guard.check(&new.sender, &new.receiver, text) {
                Verdict::Fresh(ticket) => Some(ticket),
                Verdict::Duplicate(waiter) => {
                    debug!(sender = %new.sender, receiver = %new.receiver, "Suppressing duplicate send");
                    let original = waiter.wait().await.ok_or_else(|| {
                        MessagingError::StoreUnavailable("original send failed".into())
                    })?;
                    let enriched = self.enrich(original).await;
                    if let Some(origin) = origin {
                        self.dispatcher.acknowledge(origin, &enriched);
                    }
                    return Ok(enriched);
                }
            },
            None => None,
        };

        let message = Message {
            id: MessageId::new(),
            conversation_id: new.conversation_id,
            sender: new.sender,
            receiver: new.receiver,
            text: new.text,
            media: new.media,
            seen: false,
            seen_by: Vec::new(),
            is_deleted: false,
            created_at: Utc::now(),
        };

        if let Err(e) = self.stores.messages.create_message(&message).await {
            error!(conversation = %message.conversation_id, error = %e, "Failed to persist message");
            if let Some(ticket) = ticket {
                ticket.abandon();
            }
            return Err(e.into());
        }
        settle(ticket, &message);

        match self
            .stores
            .conversations
            .set_last_message(message.conversation_id, message.id, message.created_at)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(
                conversation = %message.conversation_id,
                message = %message.id,
                "Message stored for unknown conversation"
            ),
            Err(e) => {
                // The message row stays; the pointer is not retried.
                error!(
                    conversation = %message.conversation_id,
                    message = %message.id,
                    error = %e,
                    "Failed to update conversation pointer"
                );
                return Err(e.into());
            }
        }

        let enriched = self.enrich(message).await;
        let delivered = self.dispatcher.deliver(&enriched);
        if let Some(origin) = origin {
            self.dispatcher.acknowledge(origin, &enriched);
        }

        info!(
            message = %enriched.message.id,
            conversation = %enriched.message.conversation_id,
            delivered,
            "Message sent"
        );
        Ok(enriched)
    }

    /// Attach the sender's profile. Lookup failures degrade to a bare
    /// message.
    async fn enrich(&self, message: Message) -> EnrichedMessage {
        match self.stores.users.find_user(&message.sender).await {
            Ok(profile) => EnrichedMessage {
                message,
                sender_profile: profile,
            },
            Err(e) => {
                warn!(user = %message.sender, error = %e, "Sender lookup failed, delivering without profile");
                EnrichedMessage::bare(message)
            }
        }
    }

    // ------------------------------------------------------------------
    // Seen receipts
    // ------------------------------------------------------------------

    /// Record that `user` saw the message. The sender is notified only when
    /// this call added the entry. Returns whether it did.
    pub async fn mark_seen(&self, bound: &UserId, message_id: MessageId, user: &UserId) -> Result<bool> {
        ensure_self(bound, user)?;
        let (message, added) = self
            .stores
            .messages
            .append_seen(message_id, user, Utc::now())
            .await?
            .ok_or(MessagingError::NotFound("Message"))?;

        if added {
            self.notify_seen(&message, user);
        }
        Ok(added)
    }

    /// Mark every unseen message addressed to `user` in the conversation.
    /// Returns how many were newly marked; zero on a repeat call.
    pub async fn mark_all_seen(
        &self,
        bound: &UserId,
        conversation_id: ConversationId,
        user: &UserId,
    ) -> Result<usize> {
        ensure_self(bound, user)?;
        let pending = self
            .stores
            .messages
            .unseen_for(conversation_id, user)
            .await?;

        let now = Utc::now();
        let mut marked = 0;
        for candidate in pending {
            if let Some((message, true)) = self
                .stores
                .messages
                .append_seen(candidate.id, user, now)
                .await?
            {
                self.notify_seen(&message, user);
                marked += 1;
            }
        }

        debug!(conversation = %conversation_id, user = %user, marked, "Marked conversation seen");
        Ok(marked)
    }

    fn notify_seen(&self, message: &Message, viewer: &UserId) {
        let seen_at = message
            .seen_by
            .iter()
            .find(|entry| &entry.user == viewer)
            .map(|entry| entry.seen_at)
            .unwrap_or_else(Utc::now);

        self.dispatcher.to_user(
            &message.sender,
            &ServerEvent::MessageSeen(SeenNotice {
                message_id: message.id,
                seen_by: viewer.clone(),
                seen_at,
            }),
        );
    }

    // ------------------------------------------------------------------
    // Delivery acks and deletes
    // ------------------------------------------------------------------

    /// Relay a receiver's delivery ack to the sender's handles.
    pub fn mark_delivered(&self, ack: &DeliveredAck) -> usize {
        self.dispatcher.to_user(
            &ack.sender_id,
            &ServerEvent::MessageDeliveredUpdate(MessageRef {
                message_id: ack.message_id,
            }),
        )
    }

    /// Soft-delete a message. Only its sender may do this. Both parties'
    /// handles are told.
    pub async fn delete_message(
        &self,
        bound: &UserId,
        message_id: MessageId,
        user: &UserId,
    ) -> Result<Message> {
        ensure_self(bound, user)?;
        let existing = self
            .stores
            .messages
            .find_message(message_id)
            .await?
            .ok_or(MessagingError::NotFound("Message"))?;

        if &existing.sender != user {
            return Err(MessagingError::Forbidden(
                "only the sender may delete a message".into(),
            ));
        }

        let deleted = self
            .stores
            .messages
            .soft_delete(message_id)
            .await?
            .ok_or(MessagingError::NotFound("Message"))?;

        let notice = ServerEvent::MessageDeleted(DeletedNotice {
            message_id: deleted.id,
            conversation_id: deleted.conversation_id,
        });
        self.dispatcher.to_user(&deleted.receiver, &notice);
        self.dispatcher.to_user(&deleted.sender, &notice);

        info!(message = %deleted.id, user = %user, "Message deleted");
        Ok(deleted)
    }

    // ------------------------------------------------------------------
    // Fire-and-forget signals
    // ------------------------------------------------------------------

    /// Relay a typing indicator. Room-scoped when the signal names a
    /// conversation, otherwise sent to the receiver's handles.
    pub fn relay_typing(
        &self,
        origin: ConnId,
        bound: &UserId,
        signal: &TypingSignal,
        stopped: bool,
    ) -> Result<usize> {
        ensure_self(bound, &signal.sender_id)?;
        let notice = TypingNotice {
            sender_id: signal.sender_id.clone(),
            conversation_id: signal.conversation_id,
        };
        let event = if stopped {
            ServerEvent::StopTyping(notice)
        } else {
            ServerEvent::Typing(notice)
        };

        let reached = match (signal.conversation_id, signal.receiver_id.as_ref()) {
            (Some(room), _) => self.dispatcher.to_room(room, &event, Some(origin)),
            (None, Some(receiver)) => self.dispatcher.to_user(receiver, &event),
            (None, None) => 0,
        };
        Ok(reached)
    }

    /// Relay a reaction change. Room-scoped when the signal names a
    /// conversation, otherwise sent to every connection.
    pub fn relay_reaction(
        &self,
        bound: &UserId,
        signal: &ReactionSignal,
        added: bool,
    ) -> Result<usize> {
        ensure_self(bound, &signal.user_id)?;
        let notice = ReactionNotice {
            message_id: signal.message_id,
            emoji: signal.emoji.clone(),
            user_id: signal.user_id.clone(),
        };
        let event = if added {
            ServerEvent::ReactionAdded(notice)
        } else {
            ServerEvent::ReactionRemoved(notice)
        };

        let reached = match signal.conversation_id {
            Some(room) => self.dispatcher.to_room(room, &event, None),
            None => self.dispatcher.broadcast_all(&event, None),
        };
        Ok(reached)
    }

    // ------------------------------------------------------------------
    // Read paths used by the REST surface
    // ------------------------------------------------------------------

    pub async fn open_conversation(&self, members: &MemberSet) -> Result<(Conversation, bool)> {
        let (conversation, created) = self.stores.conversations.create_or_get(members).await?;
        if created {
            info!(conversation = %conversation.id, members = members.len(), "Conversation created");
        }
        Ok((conversation, created))
    }

    pub async fn conversation(&self, id: ConversationId) -> Result<Conversation> {
        self.stores
            .conversations
            .find_conversation(id)
            .await?
            .ok_or(MessagingError::NotFound("Conversation"))
    }

    /// Conversations of `user`, most recently active first, each with its
    /// newest message and that message's sender profile.
    pub async fn conversations_for(&self, user: &UserId) -> Result<Vec<ConversationSummary>> {
        let conversations = self.stores.conversations.list_for_user(user).await?;
        let mut profiles = HashMap::new();
        let mut summaries = Vec::with_capacity(conversations.len());

        for conversation in conversations {
            let latest = match conversation.last_message {
                Some(id) => match self.stores.messages.find_message(id).await? {
                    Some(message) => Some(self.enrich_cached(message, &mut profiles).await),
                    None => None,
                },
                None => None,
            };
            summaries.push(ConversationSummary {
                conversation,
                latest_message: latest,
            });
        }
        Ok(summaries)
    }

    /// A chronological history page with sender profiles attached.
    pub async fn history(
        &self,
        id: ConversationId,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<EnrichedMessage>> {
        self.conversation(id).await?;
        let page = self.stores.messages.history(id, limit, before).await?;

        let mut profiles = HashMap::new();
        let mut enriched = Vec::with_capacity(page.len());
        for message in page {
            enriched.push(self.enrich_cached(message, &mut profiles).await);
        }
        Ok(enriched)
    }

    /// [`Self::enrich`] with one lookup per distinct sender.
    async fn enrich_cached(
        &self,
        message: Message,
        profiles: &mut HashMap<UserId, Option<UserProfile>>,
    ) -> EnrichedMessage {
        if let Some(profile) = profiles.get(&message.sender) {
            return EnrichedMessage {
                message,
                sender_profile: profile.clone(),
            };
        }
        let sender = message.sender.clone();
        let enriched = self.enrich(message).await;
        profiles.insert(sender, enriched.sender_profile.clone());
        enriched
    }

    pub async fn upsert_profile(&self, profile: &UserProfile) -> Result<()> {
        Ok(self.stores.users.upsert_user(profile).await?)
    }
}

fn ensure_self(bound: &UserId, claimed: &UserId) -> Result<()> {
    if bound == claimed {
        Ok(())
    } else {
        Err(MessagingError::Forbidden(format!(
            "{claimed} does not match the announced identity"
        )))
    }
}

fn settle(ticket: Option<Ticket>, message: &Message) {
    if let Some(ticket) = ticket {
        ticket.complete(message);
    }
}
