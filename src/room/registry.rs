//! Room directory (spec §3: "a registry keyed by `channelId`").

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::Room;
use crate::error::ErrorKind;
use crate::media::MediaEngine;

/// Process-wide `channelId -> Room` directory plus the media engine every
/// room's [`crate::media::Router`] is built from.
pub struct RoomRegistry {
    media_engine: MediaEngine,
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    allow_room_creation: bool,
}

impl RoomRegistry {
    pub fn new(media_engine: MediaEngine, allow_room_creation: bool) -> Self {
        Self {
            media_engine,
            rooms: Mutex::new(HashMap::new()),
            allow_room_creation,
        }
    }

    pub async fn get(&self, channel_id: &str) -> Option<Arc<Room>> {
        self.rooms.lock().await.get(channel_id).cloned()
    }

    /// Resolve a room, creating it if `allow_room_creation` permits and it
    /// doesn't exist yet (spec §4.4: "the first joiner may implicitly
    /// create the room unless creation is gated off").
    pub async fn get_or_create(&self, client_id: &str, room_id: &str) -> Result<Arc<Room>, ErrorKind> {
        let channel_id = format!("{client_id}:{room_id}");
        let mut rooms = self.rooms.lock().await;
        if let Some(room) = rooms.get(&channel_id) {
            return Ok(room.clone());
        }
        if !self.allow_room_creation {
            return Err(ErrorKind::NotFound);
        }
        let router = self.media_engine.create_router();
        let room = Arc::new(Room::new(client_id.to_string(), room_id.to_string(), router));
        rooms.insert(channel_id, room.clone());
        Ok(room)
    }

    /// Remove `channel_id` from the directory. The empty-room GC timer
    /// passes `force: false`, so a benign race — the timer firing just as
    /// the room re-populates — doesn't evict a live room; it only removes
    /// the room if it is still empty. The admin-absence timer passes
    /// `force: true`: spec §4.8 says its expiry "dissolves the room"
    /// unconditionally, regardless of remaining non-admin membership,
    /// since that rule is distinct from the empty-room one.
    pub async fn dissolve(&self, channel_id: &str, force: bool) {
        let mut rooms = self.rooms.lock().await;
        if let Some(room) = rooms.get(channel_id) {
            if force || room.is_empty().await {
                rooms.remove(channel_id);
            }
        }
    }

    pub async fn all_rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.lock().await.values().cloned().collect()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }
}
