use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};

use crate::events::{EventReceiver, EventSender};
use crate::models::{ChatMessage, FileTransfer, PeerInfo};
use crate::session::SessionCommand;

/// Read-only snapshot of everything the UI renders, published by the
/// session loop after each mutation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionState {
    pub peers: Vec<PeerInfo>,
    pub messages: Vec<ChatMessage>,
    pub transfers: Vec<FileTransfer>,
    /// Sticky: true once at least one data channel has ever opened.
    pub connected: bool,
}

/// The single surface the UI talks to. Cloneable; dropping every handle
/// closes the command channel, which tears the session down.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<SessionState>,
    event_tx: EventSender,
}

impl SessionHandle {
    pub(crate) fn new(
        cmd_tx: mpsc::Sender<SessionCommand>,
        state_rx: watch::Receiver<SessionState>,
        event_tx: EventSender,
    ) -> Self {
        Self {
            cmd_tx,
            state_rx,
            event_tx,
        }
    }

    /// Send a chat message to every connected peer. The local echo always
    /// succeeds, even with zero peers connected.
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<(), String> {
        self.cmd_tx
            .send(SessionCommand::SendChat { text: text.into() })
            .await
            .map_err(|e| e.to_string())
    }

    /// Offer a file to every connected peer. Returns the transfer id.
    pub async fn send_file(&self, path: impl Into<PathBuf>) -> Result<String, String> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::SendFile {
                path: path.into(),
                reply,
            })
            .await
            .map_err(|e| e.to_string())?;
        rx.await.map_err(|e| e.to_string())?
    }

    /// Fetch the reassembled bytes of a completed transfer. Answers with
    /// an error while the transfer has not fully arrived.
    pub async fn transfer_data(&self, id: &str) -> Result<Vec<u8>, String> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::TransferData {
                id: id.to_string(),
                reply,
            })
            .await
            .map_err(|e| e.to_string())?;
        rx.await.map_err(|e| e.to_string())?
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn subscribe_events(&self) -> EventReceiver {
        self.event_tx.subscribe()
    }

    /// Tear the session down: closes all peer connections and leaves the
    /// room. Safe to call more than once.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown).await;
    }
}
