//! In-process relay hub: rooms of subscribers wired together with
//! channels. Backs the demo binary and the integration tests; a
//! production deployment implements `RelayChannel` over a real transport.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::models::PresenceRecord;
use crate::relay::{RelayChannel, RelayEvent};

const EVENT_BUFFER: usize = 256;

#[derive(Default)]
struct RoomState {
    subscribers: HashMap<String, Subscriber>,
}

struct Subscriber {
    tx: mpsc::Sender<RelayEvent>,
    presence: Option<PresenceRecord>,
}

/// Shared hub; clone freely, subscribe per participant.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    rooms: Arc<Mutex<HashMap<String, RoomState>>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a room topic under a presence key. Returns the publishing
    /// handle and the event stream for this subscriber.
    pub async fn subscribe(
        &self,
        room_id: &str,
        key: &str,
    ) -> (MemoryRelayHandle, mpsc::Receiver<RelayEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let mut rooms = self.rooms.lock().await;
        rooms
            .entry(room_id.to_string())
            .or_default()
            .subscribers
            .insert(key.to_string(), Subscriber { tx, presence: None });

        let handle = MemoryRelayHandle {
            rooms: self.rooms.clone(),
            room_id: room_id.to_string(),
            key: key.to_string(),
        };
        (handle, rx)
    }
}

pub struct MemoryRelayHandle {
    rooms: Arc<Mutex<HashMap<String, RoomState>>>,
    room_id: String,
    key: String,
}

#[async_trait]
impl RelayChannel for MemoryRelayHandle {
    async fn send(&self, payload: Value) -> Result<(), String> {
        let targets: Vec<mpsc::Sender<RelayEvent>> = {
            let rooms = self.rooms.lock().await;
            let room = rooms
                .get(&self.room_id)
                .ok_or_else(|| format!("room {} has no subscribers", self.room_id))?;
            room.subscribers.values().map(|s| s.tx.clone()).collect()
        };
        for tx in targets {
            let _ = tx
                .send(RelayEvent::Broadcast {
                    payload: payload.clone(),
                })
                .await;
        }
        Ok(())
    }

    async fn track(&self, presence: PresenceRecord) -> Result<(), String> {
        // Roster snapshot for the newcomer, plus a join event for everyone
        // already tracked, so both sides of every pair observe the join.
        let (targets, own_tx, existing) = {
            let mut rooms = self.rooms.lock().await;
            let room = rooms
                .get_mut(&self.room_id)
                .ok_or_else(|| format!("room {} not subscribed", self.room_id))?;

            let existing: Vec<PresenceRecord> = room
                .subscribers
                .values()
                .filter_map(|s| s.presence.clone())
                .collect();

            let own_tx = match room.subscribers.get_mut(&self.key) {
                Some(me) => {
                    me.presence = Some(presence.clone());
                    me.tx.clone()
                }
                None => {
                    return Err(format!("subscriber {} left room {}", self.key, self.room_id))
                }
            };

            let targets: Vec<mpsc::Sender<RelayEvent>> =
                room.subscribers.values().map(|s| s.tx.clone()).collect();
            (targets, own_tx, existing)
        };

        for tx in targets {
            let _ = tx
                .send(RelayEvent::PresenceJoin {
                    key: presence.user_id.clone(),
                    new_presences: vec![presence.clone()],
                })
                .await;
        }
        let _ = own_tx
            .send(RelayEvent::PresenceSync {
                participants: existing.clone(),
            })
            .await;
        for record in existing {
            let _ = own_tx
                .send(RelayEvent::PresenceJoin {
                    key: record.user_id.clone(),
                    new_presences: vec![record],
                })
                .await;
        }
        Ok(())
    }

    async fn unsubscribe(&self) {
        let targets: Vec<mpsc::Sender<RelayEvent>> = {
            let mut rooms = self.rooms.lock().await;
            let Some(room) = rooms.get_mut(&self.room_id) else {
                return;
            };
            let Some(left) = room.subscribers.remove(&self.key) else {
                return;
            };
            debug!(room = %self.room_id, key = %self.key, "relay subscriber left");
            let targets = if left.presence.is_some() {
                room.subscribers.values().map(|s| s.tx.clone()).collect()
            } else {
                Vec::new()
            };
            if room.subscribers.is_empty() {
                rooms.remove(&self.room_id);
            }
            targets
        };
        for tx in targets {
            let _ = tx
                .send(RelayEvent::PresenceLeave {
                    key: self.key.clone(),
                })
                .await;
        }
    }
}
