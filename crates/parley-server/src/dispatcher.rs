//! Routing of outbound events to connections.
//!
//! Every live connection is registered here on accept, whether or not it has
//! announced an identity. Identity routing goes through the presence
//! registry, conversation routing through the room registry. Sending to a
//! handle that has gone away is a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use parley_shared::protocol::ServerEvent;
use parley_shared::{ConnId, ConversationId, EnrichedMessage, UserId};

use crate::presence::{ConnectionHandle, PresenceRegistry};
use crate::rooms::RoomRegistry;

#[derive(Clone)]
pub struct Dispatcher {
    connections: Arc<Mutex<HashMap<ConnId, ConnectionHandle>>>,
    presence: Arc<PresenceRegistry>,
    rooms: Arc<RoomRegistry>,
}

impl Dispatcher {
    pub fn new(presence: Arc<PresenceRegistry>, rooms: Arc<RoomRegistry>) -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            presence,
            rooms,
        }
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnId, ConnectionHandle>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, handle: ConnectionHandle) {
        self.lock().insert(handle.id(), handle);
    }

    pub fn unregister(&self, conn: ConnId) {
        self.lock().remove(&conn);
    }

    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }

    /// Push to one connection. Returns `false` if it is gone.
    pub fn to_conn(&self, conn: ConnId, event: ServerEvent) -> bool {
        let handle = self.lock().get(&conn).cloned();
        match handle {
            Some(handle) => push(&handle, event),
            None => {
                debug!(conn = %conn, "Connection gone, dropping event");
                false
            }
        }
    }

    /// Push to every handle bound to `user`. Returns how many accepted it.
    pub fn to_user(&self, user: &UserId, event: &ServerEvent) -> usize {
        let handles = self.presence.lookup(user);
        let delivered = handles.iter().filter(|h| push(h, event.clone())).count();
        trace!(user = %user, handles = handles.len(), delivered, "Pushed to user");
        delivered
    }

    /// Push to every connection in a conversation room, optionally skipping
    /// one.
    pub fn to_room(
        &self,
        room: ConversationId,
        event: &ServerEvent,
        except: Option<ConnId>,
    ) -> usize {
        let members = self.rooms.members(room);
        let handles: Vec<ConnectionHandle> = {
            let connections = self.lock();
            members
                .iter()
                .filter(|id| Some(**id) != except)
                .filter_map(|id| connections.get(id).cloned())
                .collect()
        };
        handles.iter().filter(|h| push(h, event.clone())).count()
    }

    /// Push to every live connection, optionally skipping one.
    pub fn broadcast_all(&self, event: &ServerEvent, except: Option<ConnId>) -> usize {
        let handles: Vec<ConnectionHandle> = self
            .lock()
            .values()
            .filter(|h| Some(h.id()) != except)
            .cloned()
            .collect();
        handles.iter().filter(|h| push(h, event.clone())).count()
    }

    /// Push a stored message to its receiver. Offline receivers pick it up
    /// from history later.
    pub fn deliver(&self, message: &EnrichedMessage) -> usize {
        let receiver = &message.message.receiver;
        let delivered = self.to_user(receiver, &ServerEvent::MessageReceived(message.clone()));
        if delivered == 0 {
            debug!(
                message = %message.message.id,
                receiver = %receiver,
                "Receiver offline, message left for history"
            );
        }
        delivered
    }

    /// Confirm a send to the connection it came from.
    pub fn acknowledge(&self, origin: ConnId, message: &EnrichedMessage) -> bool {
        self.to_conn(origin, ServerEvent::MessageSent(message.clone()))
    }
}

fn push(handle: &ConnectionHandle, event: ServerEvent) -> bool {
    let sent = handle.send(event);
    if !sent {
        debug!(conn = %handle.id(), "Handle closed, dropping event");
    }
    sent
}
