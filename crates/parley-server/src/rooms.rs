use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use parley_shared::{ConnId, ConversationId};

/// A conversation room: the connections subscribed to it.
#[derive(Debug, Default)]
struct Room {
    members: HashSet<ConnId>,
}

/// Conversation -> subscribed connections.
///
/// Membership is advisory and process-local. Empty rooms are dropped.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: Mutex<HashMap<ConversationId, Room>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConversationId, Room>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join a room, creating it if missing. Joining twice is a no-op.
    pub fn join(&self, room_id: ConversationId, conn: ConnId) -> bool {
        let mut rooms = self.lock();
        let room = rooms.entry(room_id).or_default();
        let added = room.members.insert(conn);

        debug!(
            room = %room_id,
            conn = %conn,
            participants = room.members.len(),
            "Connection joined conversation room"
        );

        added
    }

    /// Leave a room. Leaving a room never joined is a no-op.
    pub fn leave(&self, room_id: ConversationId, conn: ConnId) -> bool {
        let mut rooms = self.lock();
        let Some(room) = rooms.get_mut(&room_id) else {
            return false;
        };
        let removed = room.members.remove(&conn);
        let remaining = room.members.len();
        if remaining == 0 {
            rooms.remove(&room_id);
        }

        if removed {
            debug!(
                room = %room_id,
                conn = %conn,
                participants = remaining,
                "Connection left conversation room"
            );
        }

        removed
    }

    /// Remove `conn` from every room. Returns how many it was in.
    pub fn leave_all(&self, conn: ConnId) -> usize {
        let mut rooms = self.lock();
        let mut left = 0;
        rooms.retain(|_, room| {
            if room.members.remove(&conn) {
                left += 1;
            }
            !room.members.is_empty()
        });
        left
    }

    pub fn members(&self, room_id: ConversationId) -> Vec<ConnId> {
        self.lock()
            .get(&room_id)
            .map(|room| room.members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.lock().len()
    }
}
