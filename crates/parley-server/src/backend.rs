//! Storage seams used by the messaging service.
//!
//! The real-time layer only talks to these traits. [`SqliteBackend`] is the
//! production implementation; tests swap in doubles that fail on demand.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task;

use parley_shared::{
    Conversation, ConversationId, MemberSet, Message, MessageId, UserId, UserProfile,
};
use parley_store::{Database, StoreError};

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_message(&self, message: &Message) -> StoreResult<()>;

    async fn find_message(&self, id: MessageId) -> StoreResult<Option<Message>>;

    /// Chronological page of history older than `before`.
    async fn history(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<Message>>;

    /// Messages addressed to `user` in the conversation that `user` has not
    /// seen yet.
    async fn unseen_for(
        &self,
        conversation_id: ConversationId,
        user: &UserId,
    ) -> StoreResult<Vec<Message>>;

    /// Append a seen entry for `user`. The flag is `true` only if this call
    /// added the entry.
    async fn append_seen(
        &self,
        id: MessageId,
        user: &UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<(Message, bool)>>;

    async fn soft_delete(&self, id: MessageId) -> StoreResult<Option<Message>>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn find_conversation(&self, id: ConversationId) -> StoreResult<Option<Conversation>>;

    /// Returns the conversation for `members` and whether it was created.
    async fn create_or_get(&self, members: &MemberSet) -> StoreResult<(Conversation, bool)>;

    /// Returns `false` when the conversation does not exist.
    async fn set_last_message(
        &self,
        id: ConversationId,
        message_id: MessageId,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn list_for_user(&self, user: &UserId) -> StoreResult<Vec<Conversation>>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, id: &UserId) -> StoreResult<Option<UserProfile>>;

    async fn upsert_user(&self, profile: &UserProfile) -> StoreResult<()>;
}

/// The store handles the messaging service works against.
#[derive(Clone)]
pub struct Stores {
    pub messages: Arc<dyn MessageStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub users: Arc<dyn UserDirectory>,
}

impl Stores {
    pub fn sqlite(backend: SqliteBackend) -> Self {
        Self {
            messages: Arc::new(backend.clone()),
            conversations: Arc::new(backend.clone()),
            users: Arc::new(backend),
        }
    }
}

/// All three seams over one SQLite database.
///
/// `rusqlite` is blocking, so every call runs on the blocking pool and holds
/// the connection lock only inside that thread.
#[derive(Clone)]
pub struct SqliteBackend {
    db: Arc<Mutex<Database>>,
}

impl SqliteBackend {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self::new(Database::open_in_memory().expect("in-memory database"))
    }

    async fn run<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: FnOnce(&Database) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let db = db.lock().unwrap_or_else(PoisonError::into_inner);
            op(&db)
        })
        .await
        .map_err(io::Error::from)?
    }
}

#[async_trait]
impl MessageStore for SqliteBackend {
    async fn create_message(&self, message: &Message) -> StoreResult<()> {
        let message = message.clone();
        self.run(move |db| db.insert_message(&message)).await
    }

    async fn find_message(&self, id: MessageId) -> StoreResult<Option<Message>> {
        self.run(move |db| db.get_message(id)).await
    }

    async fn history(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<Message>> {
        self.run(move |db| db.list_messages(conversation_id, limit, before))
            .await
    }

    async fn unseen_for(
        &self,
        conversation_id: ConversationId,
        user: &UserId,
    ) -> StoreResult<Vec<Message>> {
        let user = user.clone();
        self.run(move |db| db.unseen_for_receiver(conversation_id, &user))
            .await
    }

    async fn append_seen(
        &self,
        id: MessageId,
        user: &UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<(Message, bool)>> {
        let user = user.clone();
        self.run(move |db| db.append_seen(id, &user, at)).await
    }

    async fn soft_delete(&self, id: MessageId) -> StoreResult<Option<Message>> {
        self.run(move |db| db.soft_delete_message(id)).await
    }
}

#[async_trait]
impl ConversationStore for SqliteBackend {
    async fn find_conversation(&self, id: ConversationId) -> StoreResult<Option<Conversation>> {
        self.run(move |db| db.get_conversation(id)).await
    }

    async fn create_or_get(&self, members: &MemberSet) -> StoreResult<(Conversation, bool)> {
        let members = members.clone();
        self.run(move |db| db.create_or_get_conversation(&members))
            .await
    }

    async fn set_last_message(
        &self,
        id: ConversationId,
        message_id: MessageId,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.run(move |db| db.set_last_message(id, message_id, at))
            .await
    }

    async fn list_for_user(&self, user: &UserId) -> StoreResult<Vec<Conversation>> {
        let user = user.clone();
        self.run(move |db| db.list_conversations_for_user(&user))
            .await
    }
}

#[async_trait]
impl UserDirectory for SqliteBackend {
    async fn find_user(&self, id: &UserId) -> StoreResult<Option<UserProfile>> {
        let id = id.clone();
        self.run(move |db| db.get_user(&id)).await
    }

    async fn upsert_user(&self, profile: &UserProfile) -> StoreResult<()> {
        let profile = profile.clone();
        self.run(move |db| db.upsert_user(&profile)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_conversation_round_trip_through_trait() {
        let backend = SqliteBackend::in_memory();
        let members = MemberSet::new([UserId::from("bob"), UserId::from("alice")]).unwrap();

        let (created, fresh) = ConversationStore::create_or_get(&backend, &members)
            .await
            .unwrap();
        assert!(fresh);
        let (again, fresh) = backend.create_or_get(&members).await.unwrap();
        assert!(!fresh);
        assert_eq!(created.id, again.id);

        let found = backend.find_conversation(created.id).await.unwrap();
        assert_eq!(found.map(|c| c.members), Some(members.to_vec()));
    }

    #[tokio::test]
    async fn test_unknown_user_is_none() {
        let backend = SqliteBackend::in_memory();
        assert!(backend
            .find_user(&UserId::from("ghost"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_store_calls_leave_the_runtime_free() {
        let backend = SqliteBackend::in_memory();
        let guard = backend.db.lock().unwrap();

        // With the connection held, a store call waits on the blocking pool
        // while this runtime keeps scheduling other tasks.
        let pending = tokio::spawn({
            let backend = backend.clone();
            async move { backend.find_user(&UserId::from("ghost")).await }
        });
        let ticker = tokio::spawn(async { tokio::task::yield_now().await; 7 });
        assert_eq!(ticker.await.unwrap(), 7);
        assert!(!pending.is_finished());

        drop(guard);
        assert!(pending.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_writes_are_serialized() {
        let backend = SqliteBackend::in_memory();
        let writes = (0..8).map(|i| {
            let backend = backend.clone();
            tokio::spawn(async move {
                backend
                    .upsert_user(&UserProfile {
                        id: UserId::from(format!("user-{i}").as_str()),
                        display_name: format!("User {i}"),
                        avatar: None,
                    })
                    .await
            })
        });
        for write in writes.collect::<Vec<_>>() {
            write.await.unwrap().unwrap();
        }
        let found = backend.find_user(&UserId::from("user-3")).await.unwrap();
        assert_eq!(found.map(|p| p.display_name), Some("User 3".to_string()));
    }
}
