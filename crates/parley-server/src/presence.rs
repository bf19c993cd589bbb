//! Process-local presence: which users are reachable right now, and through
//! which connection handles.
//!
//! Nothing here is persisted. On restart the registry starts empty and
//! clients re-announce themselves when they reconnect.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::debug;

use parley_shared::protocol::ServerEvent;
use parley_shared::{ConnId, UserId};

/// Sending half of a connection's outbound queue.
pub type Outbox = mpsc::UnboundedSender<ServerEvent>;

/// Addressable reference to one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnId,
    tx: Outbox,
}

impl ConnectionHandle {
    pub fn new(id: ConnId, tx: Outbox) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Queue an event for the socket writer. Returns `false` if the
    /// connection has already gone away.
    pub fn send(&self, event: ServerEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Result of [`PresenceRegistry::bind`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BindOutcome {
    /// The user had no handles before this bind.
    pub came_online: bool,
    /// Handles dropped from the registry because multi-device is off.
    pub displaced: Vec<ConnId>,
    /// The identity this connection was bound to before, if it went
    /// offline because of the rebind.
    pub previous_offline: Option<UserId>,
}

#[derive(Default)]
struct PresenceInner {
    /// Handles per user, oldest bind first.
    by_user: HashMap<UserId, Vec<ConnectionHandle>>,
    by_conn: HashMap<ConnId, UserId>,
}

impl PresenceInner {
    /// Drop `conn` from whatever identity it is bound to. Returns that
    /// identity if it has no handles left.
    fn detach(&mut self, conn: ConnId) -> Option<UserId> {
        let user = self.by_conn.remove(&conn)?;
        let handles = self.by_user.get_mut(&user)?;
        handles.retain(|h| h.id != conn);
        if handles.is_empty() {
            self.by_user.remove(&user);
            return Some(user);
        }
        None
    }
}

/// Identity -> live handles.
///
/// All operations take a short synchronous lock and never suspend.
pub struct PresenceRegistry {
    inner: Mutex<PresenceInner>,
    multi_device: bool,
}

impl PresenceRegistry {
    pub fn new(multi_device: bool) -> Self {
        Self {
            inner: Mutex::new(PresenceInner::default()),
            multi_device,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PresenceInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `handle` to `user`.
    ///
    /// Binding the same handle twice is a no-op apart from making it the
    /// most recent one. A handle bound to another identity is moved.
    pub fn bind(&self, user: &UserId, handle: ConnectionHandle) -> BindOutcome {
        let mut inner = self.lock();
        let mut outcome = BindOutcome::default();
        let conn = handle.id;

        match inner.by_conn.get(&conn) {
            Some(current) if current == user => {}
            Some(_) => outcome.previous_offline = inner.detach(conn),
            None => {}
        }

        let was_online = inner.by_user.get(user).is_some_and(|hs| !hs.is_empty());

        if !self.multi_device {
            let others: Vec<ConnId> = inner
                .by_user
                .get(user)
                .map(|hs| hs.iter().map(|h| h.id).filter(|id| *id != conn).collect())
                .unwrap_or_default();
            for other in others {
                inner.detach(other);
                outcome.displaced.push(other);
            }
        }

        let handles = inner.by_user.entry(user.clone()).or_default();
        outcome.came_online = !was_online;
        handles.retain(|h| h.id != conn);
        handles.push(handle);
        inner.by_conn.insert(conn, user.clone());

        debug!(
            user = %user,
            conn = %conn,
            handles = inner.by_user.get(user).map(Vec::len).unwrap_or(0),
            "bound connection"
        );

        outcome
    }

    /// Remove `conn` from the registry. Returns the user if this was their
    /// last handle. Unknown handles are ignored.
    pub fn unbind(&self, conn: ConnId) -> Option<UserId> {
        let went_offline = self.lock().detach(conn);
        if let Some(ref user) = went_offline {
            debug!(user = %user, conn = %conn, "last connection unbound");
        }
        went_offline
    }

    /// Every live handle of `user`, oldest bind first.
    pub fn lookup(&self, user: &UserId) -> Vec<ConnectionHandle> {
        self.lock().by_user.get(user).cloned().unwrap_or_default()
    }

    /// The most recently bound handle of `user`.
    #[allow(dead_code)]
    pub fn lookup_latest(&self, user: &UserId) -> Option<ConnectionHandle> {
        self.lock()
            .by_user
            .get(user)
            .and_then(|hs| hs.last().cloned())
    }

    pub fn user_of(&self, conn: ConnId) -> Option<UserId> {
        self.lock().by_conn.get(&conn).cloned()
    }

    #[allow(dead_code)]
    pub fn is_online(&self, user: &UserId) -> bool {
        self.lock().by_user.contains_key(user)
    }

    /// Online user ids, sorted.
    pub fn snapshot(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.lock().by_user.keys().cloned().collect();
        users.sort();
        users
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(ConnId::new(), tx), rx)
    }

    #[test]
    fn test_bind_lookup_unbind() {
        let registry = PresenceRegistry::new(true);
        let alice = UserId::from("alice");
        let (h, _rx) = handle();

        let outcome = registry.bind(&alice, h.clone());
        assert!(outcome.came_online);
        assert!(registry.is_online(&alice));
        assert_eq!(registry.lookup_latest(&alice).map(|h| h.id()), Some(h.id()));
        assert_eq!(registry.snapshot(), vec![alice.clone()]);

        assert_eq!(registry.unbind(h.id()), Some(alice.clone()));
        assert!(!registry.is_online(&alice));
        assert!(registry.lookup(&alice).is_empty());
    }

    #[test]
    fn test_rebinding_same_handle_is_idempotent() {
        let registry = PresenceRegistry::new(true);
        let alice = UserId::from("alice");
        let (h, _rx) = handle();

        registry.bind(&alice, h.clone());
        let again = registry.bind(&alice, h.clone());
        assert!(!again.came_online);
        assert_eq!(registry.lookup(&alice).len(), 1);
    }

    #[test]
    fn test_unbind_unknown_is_noop() {
        let registry = PresenceRegistry::new(true);
        assert_eq!(registry.unbind(ConnId::new()), None);
    }

    #[test]
    fn test_multi_device_stays_online_until_last_handle() {
        let registry = PresenceRegistry::new(true);
        let alice = UserId::from("alice");
        let (phone, _rx1) = handle();
        let (laptop, _rx2) = handle();

        registry.bind(&alice, phone.clone());
        let second = registry.bind(&alice, laptop.clone());
        assert!(!second.came_online);
        assert_eq!(registry.lookup(&alice).len(), 2);
        assert_eq!(
            registry.lookup_latest(&alice).map(|h| h.id()),
            Some(laptop.id())
        );

        assert_eq!(registry.unbind(phone.id()), None);
        assert!(registry.is_online(&alice));
        assert_eq!(registry.unbind(laptop.id()), Some(alice));
    }

    #[test]
    fn test_single_device_displaces_previous_handle() {
        let registry = PresenceRegistry::new(false);
        let alice = UserId::from("alice");
        let (old, _rx1) = handle();
        let (new, _rx2) = handle();

        registry.bind(&alice, old.clone());
        let outcome = registry.bind(&alice, new.clone());
        assert_eq!(outcome.displaced, vec![old.id()]);
        assert!(!outcome.came_online);
        assert_eq!(registry.lookup(&alice).len(), 1);

        // The displaced handle no longer points at alice.
        assert_eq!(registry.unbind(old.id()), None);
        assert!(registry.is_online(&alice));
    }

    #[test]
    fn test_rebinding_handle_to_other_identity() {
        let registry = PresenceRegistry::new(true);
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        let (h, _rx) = handle();

        registry.bind(&alice, h.clone());
        let outcome = registry.bind(&bob, h.clone());
        assert_eq!(outcome.previous_offline, Some(alice.clone()));
        assert!(outcome.came_online);
        assert!(!registry.is_online(&alice));
        assert_eq!(registry.user_of(h.id()), Some(bob));
    }

    #[test]
    fn test_send_to_closed_handle_reports_failure() {
        let (h, rx) = handle();
        drop(rx);
        assert!(!h.send(ServerEvent::OnlineUsers(Vec::new())));
    }
}
