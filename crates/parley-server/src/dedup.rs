//! Short-lived suppression of retried sends.
//!
//! A send is identified by a fingerprint over `(sender, receiver, text)`.
//! The first send with a given fingerprint gets a [`Ticket`] and goes on to
//! persist. Identical sends inside the window get a [`Waiter`] that resolves
//! to the message the first one stored, so the caller can acknowledge
//! without persisting or delivering again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::debug;

use parley_shared::{Message, UserId};

pub type Fingerprint = [u8; 32];

/// Hash the parts of a send that identify it. Fields are length-prefixed
/// so `("ab", "c")` and `("a", "bc")` differ. Media is not part of it.
pub fn fingerprint(sender: &UserId, receiver: &UserId, text: &str) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();
    for part in [sender.as_str(), receiver.as_str(), text] {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    *hasher.finalize().as_bytes()
}

/// State of the first send that claimed a fingerprint.
#[derive(Debug, Clone)]
pub enum Outcome {
    Pending,
    Stored(Message),
    Failed,
}

struct Entry {
    first_seen: Instant,
    tx: Arc<watch::Sender<Outcome>>,
}

type Entries = HashMap<Fingerprint, Entry>;

#[derive(Clone)]
pub struct DuplicateGuard {
    entries: Arc<Mutex<Entries>>,
    window: Duration,
}

/// Result of [`DuplicateGuard::check`].
pub enum Verdict {
    /// No unexpired match. The caller owns the send and must settle the
    /// ticket.
    Fresh(Ticket),
    /// Retry of a send still inside the window.
    Duplicate(Waiter),
}

impl DuplicateGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            window,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn check(&self, sender: &UserId, receiver: &UserId, text: &str) -> Verdict {
        self.check_at(fingerprint(sender, receiver, text), Instant::now())
    }

    /// Check and record in one critical section.
    pub fn check_at(&self, key: Fingerprint, now: Instant) -> Verdict {
        let mut entries = self.lock();

        if let Some(entry) = entries.get(&key) {
            if now.saturating_duration_since(entry.first_seen) < self.window {
                return Verdict::Duplicate(Waiter {
                    rx: entry.tx.subscribe(),
                });
            }
        }

        let (tx, _) = watch::channel(Outcome::Pending);
        let tx = Arc::new(tx);
        entries.insert(
            key,
            Entry {
                first_seen: now,
                tx: Arc::clone(&tx),
            },
        );

        Verdict::Fresh(Ticket {
            entries: Arc::clone(&self.entries),
            key,
            tx,
            settled: false,
        })
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        let window = self.window;
        entries.retain(|_, entry| now.saturating_duration_since(entry.first_seen) < window);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "Swept duplicate entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Ownership of a fresh send. Dropping it unsettled counts as a failure.
pub struct Ticket {
    entries: Arc<Mutex<Entries>>,
    key: Fingerprint,
    tx: Arc<watch::Sender<Outcome>>,
    settled: bool,
}

impl Ticket {
    /// The send was persisted. Later duplicates inside the window resolve to
    /// `message`.
    pub fn complete(mut self, message: &Message) {
        self.settled = true;
        self.tx.send_replace(Outcome::Stored(message.clone()));
    }

    /// The send failed before persisting. Waiters are released and the
    /// fingerprint is free for a fresh attempt.
    pub fn abandon(mut self) {
        self.release();
    }

    fn release(&mut self) {
        self.settled = true;
        self.tx.send_replace(Outcome::Failed);

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        // A newer entry may already hold the key after expiry.
        if entries
            .get(&self.key)
            .is_some_and(|entry| Arc::ptr_eq(&entry.tx, &self.tx))
        {
            entries.remove(&self.key);
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if !self.settled {
            self.release();
        }
    }
}

/// Handle on the first send's outcome.
pub struct Waiter {
    rx: watch::Receiver<Outcome>,
}

impl Waiter {
    /// Resolves to the stored message, or `None` if the first send failed.
    pub async fn wait(mut self) -> Option<Message> {
        loop {
            let current = self.rx.borrow_and_update().clone();
            match current {
                Outcome::Stored(message) => return Some(message),
                Outcome::Failed => return None,
                Outcome::Pending => {}
            }
            if self.rx.changed().await.is_err() {
                let last = self.rx.borrow().clone();
                return match last {
                    Outcome::Stored(message) => Some(message),
                    _ => None,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parley_shared::{ConversationId, MessageId};

    fn stored(text: &str) -> Message {
        Message {
            id: MessageId::new(),
            conversation_id: ConversationId::new(),
            sender: UserId::from("alice"),
            receiver: UserId::from("bob"),
            text: Some(text.to_string()),
            media: None,
            seen: false,
            seen_by: Vec::new(),
            is_deleted: false,
            created_at: Utc::now(),
        }
    }

    fn key(text: &str) -> Fingerprint {
        fingerprint(&UserId::from("alice"), &UserId::from("bob"), text)
    }

    #[test]
    fn test_fingerprint_is_field_separated() {
        let a = fingerprint(&UserId::from("ab"), &UserId::from("c"), "x");
        let b = fingerprint(&UserId::from("a"), &UserId::from("bc"), "x");
        assert_ne!(a, b);
        assert_eq!(key("hi"), key("hi"));
        assert_ne!(key("hi"), key("hi!"));
    }

    #[tokio::test]
    async fn test_duplicate_inside_window_resolves_to_first() {
        let guard = DuplicateGuard::new(Duration::from_secs(5));
        let now = Instant::now();

        let Verdict::Fresh(ticket) = guard.check_at(key("hi"), now) else {
            panic!("first send must be fresh");
        };
        let Verdict::Duplicate(waiter) = guard.check_at(key("hi"), now + Duration::from_secs(1))
        else {
            panic!("retry must be a duplicate");
        };

        let message = stored("hi");
        ticket.complete(&message);
        assert_eq!(waiter.wait().await.map(|m| m.id), Some(message.id));
    }

    #[tokio::test]
    async fn test_waiter_blocks_until_settled() {
        let guard = DuplicateGuard::new(Duration::from_secs(5));
        let Verdict::Fresh(ticket) = guard.check_at(key("hi"), Instant::now()) else {
            panic!("first send must be fresh");
        };
        let Verdict::Duplicate(waiter) = guard.check_at(key("hi"), Instant::now()) else {
            panic!("retry must be a duplicate");
        };

        let message = stored("hi");
        let expected = message.id;
        let pending = tokio::spawn(waiter.wait());
        tokio::task::yield_now().await;
        ticket.complete(&message);

        assert_eq!(pending.await.unwrap().map(|m| m.id), Some(expected));
    }

    #[test]
    fn test_expired_entry_never_matches() {
        let guard = DuplicateGuard::new(Duration::from_secs(5));
        let now = Instant::now();

        let Verdict::Fresh(ticket) = guard.check_at(key("hi"), now) else {
            panic!("first send must be fresh");
        };
        ticket.complete(&stored("hi"));

        let later = now + Duration::from_secs(5);
        assert!(matches!(guard.check_at(key("hi"), later), Verdict::Fresh(_)));
    }

    #[tokio::test]
    async fn test_abandon_releases_waiters_and_key() {
        let guard = DuplicateGuard::new(Duration::from_secs(5));

        let Verdict::Fresh(ticket) = guard.check_at(key("hi"), Instant::now()) else {
            panic!("first send must be fresh");
        };
        let Verdict::Duplicate(waiter) = guard.check_at(key("hi"), Instant::now()) else {
            panic!("retry must be a duplicate");
        };

        ticket.abandon();
        assert!(waiter.wait().await.is_none());
        assert!(guard.is_empty());
        assert!(matches!(guard.check_at(key("hi"), Instant::now()), Verdict::Fresh(_)));
    }

    #[tokio::test]
    async fn test_dropped_ticket_counts_as_failure() {
        let guard = DuplicateGuard::new(Duration::from_secs(5));

        let Verdict::Fresh(ticket) = guard.check_at(key("hi"), Instant::now()) else {
            panic!("first send must be fresh");
        };
        let Verdict::Duplicate(waiter) = guard.check_at(key("hi"), Instant::now()) else {
            panic!("retry must be a duplicate");
        };

        drop(ticket);
        assert!(waiter.wait().await.is_none());
        assert!(guard.is_empty());
    }

    #[test]
    fn test_stale_ticket_does_not_remove_newer_entry() {
        let guard = DuplicateGuard::new(Duration::from_secs(5));
        let now = Instant::now();

        let Verdict::Fresh(old) = guard.check_at(key("hi"), now) else {
            panic!("first send must be fresh");
        };
        let Verdict::Fresh(_newer) = guard.check_at(key("hi"), now + Duration::from_secs(6))
        else {
            panic!("expired entry must not match");
        };

        old.abandon();
        assert_eq!(guard.len(), 1);
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let guard = DuplicateGuard::new(Duration::from_secs(5));
        let now = Instant::now();

        for (text, offset) in [("a", 0), ("b", 2), ("c", 4)] {
            if let Verdict::Fresh(ticket) = guard.check_at(key(text), now + Duration::from_secs(offset)) {
                ticket.complete(&stored(text));
            }
        }

        assert_eq!(guard.sweep_at(now + Duration::from_secs(7)), 2);
        assert_eq!(guard.len(), 1);
        assert_eq!(guard.sweep_at(now + Duration::from_secs(20)), 1);
        assert!(guard.is_empty());
    }

    #[test]
    fn test_different_text_is_never_merged() {
        let guard = DuplicateGuard::new(Duration::from_secs(5));
        let now = Instant::now();
        let first = guard.check_at(key("hi"), now);
        let second = guard.check_at(key("hello"), now);
        assert!(matches!(first, Verdict::Fresh(_)));
        assert!(matches!(second, Verdict::Fresh(_)));
    }
}
