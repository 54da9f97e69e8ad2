//! Room registry: per-room fan-out groups, created on first subscriber
//! and removed when the last one leaves.
//!
//! Each room is a tokio broadcast channel. Frames are tagged with the
//! publishing connection's id so receivers can skip their own publishes;
//! everything else is forwarded verbatim.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

/// A relayed frame: `(publishing connection id, raw frame text)`.
pub type RelayFrame = (u64, Arc<String>);

struct Room {
    sender: broadcast::Sender<RelayFrame>,
    members: usize,
}

/// All live rooms, keyed by public room identifier.
///
/// Room state is owned here explicitly rather than in module globals: a
/// registry per relay instance is the whole universe of rooms.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Room>>,
    capacity: usize,
}

impl RoomRegistry {
    /// `capacity` is the per-subscriber buffer; slow subscribers beyond it
    /// lose the oldest frames (there is no delivery guarantee anyway).
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Join a room, creating it if this is the first subscriber.
    pub async fn join(
        &self,
        room_id: &str,
    ) -> (broadcast::Sender<RelayFrame>, broadcast::Receiver<RelayFrame>) {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(room_id.to_owned()).or_insert_with(|| {
            log::info!("room {room_id} opened");
            Room {
                sender: broadcast::channel(self.capacity).0,
                members: 0,
            }
        });
        room.members += 1;
        (room.sender.clone(), room.sender.subscribe())
    }

    /// Leave a room; the room is dropped once empty.
    pub async fn leave(&self, room_id: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get_mut(room_id) {
            room.members = room.members.saturating_sub(1);
            if room.members == 0 {
                rooms.remove(room_id);
                log::info!("room {room_id} closed (empty)");
            }
        }
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Number of subscribers in a room.
    pub async fn member_count(&self, room_id: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map_or(0, |room| room.members)
    }
}
