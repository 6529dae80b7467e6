//! The room's presence/broadcast relay, consumed as an external
//! collaborator: a store-and-forward fan-out used only for small
//! negotiation messages, never file payloads.

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;

use crate::models::PresenceRecord;

/// Events delivered by a room subscription.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// Snapshot of everyone currently tracked in the room.
    PresenceSync { participants: Vec<PresenceRecord> },
    PresenceJoin {
        key: String,
        new_presences: Vec<PresenceRecord>,
    },
    PresenceLeave { key: String },
    /// A broadcast payload, visible to all subscribers including the
    /// sender. Parsed into a `SignalMessage` at the session boundary.
    Broadcast { payload: Value },
}

/// Publishing half of a room subscription. The receiving half is the
/// `mpsc::Receiver<RelayEvent>` handed out at subscribe time.
#[async_trait]
pub trait RelayChannel: Send {
    /// Fire-and-forget broadcast to every room subscriber, self included.
    async fn send(&self, payload: Value) -> Result<(), String>;

    /// Announce local presence; triggers join events for the others and a
    /// roster sync for the caller.
    async fn track(&self, presence: PresenceRecord) -> Result<(), String>;

    /// Leave the room topic. Called exactly once on teardown; extra calls
    /// are harmless.
    async fn unsubscribe(&self);
}
