use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{ChatMessage, FileTransfer, PeerInfo};

/// Granular session events for UI layers that want deltas instead of
/// polling the state snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum AppEvent {
    PeerJoined(PeerInfo),
    PeerLeft { peer_id: String },
    ChannelOpened { peer_id: String },
    NewChatMessage(ChatMessage),
    TransferStarted(FileTransfer),
    TransferProgress { id: String, progress: u8 },
    TransferCompleted { id: String },
    TransferFailed { id: String },
}

pub type EventSender = broadcast::Sender<AppEvent>;
pub type EventReceiver = broadcast::Receiver<AppEvent>;

pub fn create_event_bus() -> (EventSender, EventReceiver) {
    broadcast::channel(256)
}
