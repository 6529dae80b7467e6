pub mod chunker;
pub mod events;
pub mod models;
pub mod peer;
pub mod relay;
pub mod rooms;
pub mod session;
pub mod signaling;
pub mod state;

use tokio::sync::mpsc;

use crate::peer::rtc::{RtcConfig, RtcPeerManager};
use crate::peer::PeerEvent;
use crate::relay::{RelayChannel, RelayEvent};
use crate::session::{spawn_session, SessionConfig};
use crate::state::SessionHandle;

const PEER_EVENT_BUFFER: usize = 256;

/// Join a room with the production WebRTC connector. The caller supplies
/// an already-subscribed relay channel; presence is announced as soon as
/// the session loop starts.
pub fn spawn_webrtc_session<R>(
    config: SessionConfig,
    rtc_config: RtcConfig,
    relay: R,
    relay_rx: mpsc::Receiver<RelayEvent>,
) -> SessionHandle
where
    R: RelayChannel + 'static + Sync,
{
    let (peer_tx, peer_rx) = mpsc::channel::<PeerEvent>(PEER_EVENT_BUFFER);
    let connector = RtcPeerManager::new(rtc_config, peer_tx);
    spawn_session(config, connector, relay, relay_rx, peer_rx)
}
