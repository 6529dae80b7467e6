//! The session controller: the top-level orchestrator that joins a
//! room's presence group, drives negotiation and the peer connector, and
//! exposes chat/file operations plus observable state.

pub mod engine;

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use crate::chunker::CHUNK_SIZE;
use crate::events::create_event_bus;
use crate::peer::{PeerConnector, PeerEvent};
use crate::relay::{RelayChannel, RelayEvent};
use crate::state::{SessionHandle, SessionState};

const COMMAND_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub room_id: String,
    pub user_id: String,
    pub username: String,
    /// Fragment size for file payloads.
    pub chunk_size: usize,
    /// Negotiations stuck in flight longer than this are torn down.
    pub negotiation_timeout: Duration,
    /// Delay before the single ICE-restart retry after a failure signal.
    pub ice_restart_delay: Duration,
}

impl SessionConfig {
    pub fn new(
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            user_id: user_id.into(),
            username: username.into(),
            chunk_size: CHUNK_SIZE,
            negotiation_timeout: Duration::from_secs(30),
            ice_restart_delay: Duration::from_secs(1),
        }
    }
}

/// Commands sent into the session event loop.
#[derive(Debug)]
pub enum SessionCommand {
    SendChat {
        text: String,
    },
    SendFile {
        path: PathBuf,
        reply: oneshot::Sender<Result<String, String>>,
    },
    TransferData {
        id: String,
        reply: oneshot::Sender<Result<Vec<u8>, String>>,
    },
    /// Internal: a spawned reader finished loading an outgoing file.
    FileLoaded {
        id: String,
        result: Result<Vec<u8>, String>,
    },
    /// Internal: the delayed ICE-restart retry fired for a failed peer.
    RetryIce {
        peer_id: String,
    },
    Shutdown,
}

/// Wire up channels and spawn the session loop. The caller supplies the
/// relay subscription and a connector already bound to a peer-event
/// channel (the receiving half comes in as `peer_rx`).
pub fn spawn_session<P, R>(
    config: SessionConfig,
    connector: P,
    relay: R,
    relay_rx: mpsc::Receiver<RelayEvent>,
    peer_rx: mpsc::Receiver<PeerEvent>,
) -> SessionHandle
where
    P: PeerConnector + 'static,
    R: RelayChannel + 'static + Sync,
{
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (state_tx, state_rx) = watch::channel(SessionState::default());
    let (event_tx, _) = create_event_bus();

    tokio::spawn(engine::run_session(
        config,
        connector,
        relay,
        relay_rx,
        peer_rx,
        cmd_rx,
        cmd_tx.clone(),
        state_tx,
        event_tx.clone(),
    ));

    SessionHandle::new(cmd_tx, state_rx, event_tx)
}
