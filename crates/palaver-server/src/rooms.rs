use std::collections::{HashMap, VecDeque};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use palaver_core::{ConnectionId, RelayError, RoomEvent, RoomId};

/// Retained events per room. The upstream behavior of keeping every event
/// forever is an unbounded-memory hazard; the ring keeps the newest N.
pub const DEFAULT_HISTORY_LIMIT: usize = 500;

/// One chat room: its member set and its ordered event history.
///
/// A `Room` is only ever reached through [`RoomRegistry::with_room`], which
/// serializes all same-room mutation. Nothing here is synchronized on its own.
pub struct Room {
    id: RoomId,
    members: HashMap<ConnectionId, String>,
    history: VecDeque<RoomEvent>,
    history_limit: usize,
}

impl Room {
    fn new(id: RoomId, history_limit: usize) -> Self {
        Self {
            id,
            members: HashMap::new(),
            history: VecDeque::new(),
            history_limit,
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    /// Add a member and append its join event.
    pub fn join(&mut self, handle: &ConnectionId, username: &str) -> Result<RoomEvent, RelayError> {
        if self.members.contains_key(handle) {
            return Err(RelayError::AlreadyMember);
        }
        self.members.insert(handle.clone(), username.to_owned());
        let event = RoomEvent::joined(username);
        self.append(event.clone());
        Ok(event)
    }

    /// Remove a member and append its leave event. `NotMember` is benign:
    /// a disconnect-triggered leave can race an earlier removal.
    pub fn leave(&mut self, handle: &ConnectionId) -> Result<RoomEvent, RelayError> {
        let username = self.members.remove(handle).ok_or(RelayError::NotMember)?;
        let event = RoomEvent::left(username);
        self.append(event.clone());
        Ok(event)
    }

    /// Append a message under the member's stored display name.
    /// Rejects non-members without touching history.
    pub fn post_message(
        &mut self,
        handle: &ConnectionId,
        content: &str,
    ) -> Result<RoomEvent, RelayError> {
        let username = self.members.get(handle).ok_or(RelayError::Unauthorized)?;
        let event = RoomEvent::message(username.clone(), content);
        self.append(event.clone());
        Ok(event)
    }

    /// The retained history in append order.
    pub fn snapshot_history(&self) -> Vec<RoomEvent> {
        self.history.iter().cloned().collect()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn member_ids(&self) -> impl Iterator<Item = &ConnectionId> {
        self.members.keys()
    }

    pub fn is_member(&self, handle: &ConnectionId) -> bool {
        self.members.contains_key(handle)
    }

    fn append(&mut self, event: RoomEvent) {
        self.history.push_back(event);
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
    }
}

/// Owner of every live room, keyed by room id.
///
/// The map entry lock is the per-room critical section: `with_room` holds it
/// for the duration of the closure, so membership changes, history appends
/// and the fan-out of the resulting event are one atomic step per room while
/// distinct rooms proceed independently.
pub struct RoomRegistry {
    rooms: DashMap<RoomId, Room>,
    history_limit: usize,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl RoomRegistry {
    pub fn new(history_limit: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            history_limit,
        }
    }

    /// Mint a fresh room. The token space makes collisions vanishingly
    /// unlikely; an occupied token is simply re-rolled.
    pub fn create_room(&self) -> RoomId {
        loop {
            let id = RoomId::generate();
            match self.rooms.entry(id.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(Room::new(id.clone(), self.history_limit));
                    return id;
                }
                Entry::Occupied(_) => continue,
            }
        }
    }

    /// Run `f` with exclusive access to the room, or `RoomNotFound`.
    pub fn with_room<T>(
        &self,
        id: &RoomId,
        f: impl FnOnce(&mut Room) -> Result<T, RelayError>,
    ) -> Result<T, RelayError> {
        match self.rooms.get_mut(id) {
            Some(mut room) => f(&mut room),
            None => Err(RelayError::RoomNotFound),
        }
    }

    /// Drop the room if it has no members. Idempotent; atomic with respect
    /// to joins, which hold the entry lock this checks under.
    pub fn remove_if_empty(&self, id: &RoomId) -> bool {
        self.rooms
            .remove_if(id, |_, room| room.member_count() == 0)
            .is_some()
    }

    pub fn contains(&self, id: &RoomId) -> bool {
        self.rooms.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
