//! One direct connection plus one ordered, reliable message channel per
//! remote peer, behind a trait so the session loop can be driven by the
//! real WebRTC stack or an in-memory transport in tests.

pub mod rtc;

use async_trait::async_trait;

use crate::models::PeerMessage;

/// Connection lifecycle signals, mirrored from the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events surfaced by a connector to the session loop.
#[derive(Debug)]
pub enum PeerEvent {
    ConnectionState {
        peer_id: String,
        state: PeerConnState,
    },
    /// Locally gathered ICE candidate that must reach the remote peer
    /// over the signaling relay.
    IceCandidate {
        peer_id: String,
        candidate: String,
    },
    ChannelOpen { peer_id: String },
    ChannelClosed { peer_id: String },
    /// A decoded message from the peer's data channel. Malformed frames
    /// are logged and dropped inside the connector.
    Message {
        peer_id: String,
        message: PeerMessage,
    },
}

/// Owns the per-peer connections and channels. All methods are
/// best-effort at this layer; ordering and recovery live in the chunking
/// scheme and the session's negotiation logic.
#[async_trait]
pub trait PeerConnector: Send {
    /// Create a connection as initiator (the local side opens the message
    /// channel) and return the local offer for the relay.
    async fn create_offer(&mut self, peer_id: &str) -> Result<String, String>;

    /// Create/complete a connection as responder and return the answer.
    async fn handle_offer(&mut self, peer_id: &str, offer: &str) -> Result<String, String>;

    /// Apply a remote answer on an initiated connection.
    async fn handle_answer(&mut self, peer_id: &str, answer: &str) -> Result<(), String>;

    /// Apply a remote ICE candidate. Errors when the connection cannot
    /// accept candidates yet; the caller buffers and retries.
    async fn add_ice_candidate(&mut self, peer_id: &str, candidate: &str) -> Result<(), String>;

    /// Build an ICE-restart offer for a failed connection.
    async fn restart_ice(&mut self, peer_id: &str) -> Result<String, String>;

    /// Fire-and-forget fan-out to every peer whose channel is open;
    /// closed channels are skipped silently.
    async fn broadcast(&mut self, message: &PeerMessage);

    async fn close_peer(&mut self, peer_id: &str);

    async fn close_all(&mut self);

    fn has_peer(&self, peer_id: &str) -> bool;

    /// Peers whose data channel is currently open.
    fn open_peers(&self) -> Vec<String>;
}
