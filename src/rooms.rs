//! Room metadata lookup and password gating, consumed at its interface:
//! storage and hashing live outside the engine. A room is entered only
//! after this gate passes; the session itself never sees passwords.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomMeta {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
}

/// Hash-compare gate: open rooms admit anyone, protected rooms require a
/// matching hash of the supplied password.
pub fn verify_password(meta: &RoomMeta, supplied_hash: Option<&str>) -> bool {
    match (&meta.password_hash, supplied_hash) {
        (None, _) => true,
        (Some(stored), Some(supplied)) => stored == supplied,
        (Some(_), None) => false,
    }
}

pub trait RoomDirectory: Send + Sync {
    fn lookup(&self, room_id: &str) -> Option<RoomMeta>;
}

/// In-memory directory for the demo binary and tests.
#[derive(Debug, Default)]
pub struct MemoryRoomDirectory {
    rooms: HashMap<String, RoomMeta>,
}

impl MemoryRoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, room_id: impl Into<String>, meta: RoomMeta) {
        self.rooms.insert(room_id.into(), meta);
    }
}

impl RoomDirectory for MemoryRoomDirectory {
    fn lookup(&self, room_id: &str) -> Option<RoomMeta> {
        self.rooms.get(room_id).cloned()
    }
}
