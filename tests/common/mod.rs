//! In-memory peer transport for scenario tests: connectors registered on
//! a shared hub deliver messages straight into each other's session
//! loops, with offer/answer handshakes opening the channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};

use roomdrop::models::PeerMessage;
use roomdrop::peer::{PeerConnector, PeerEvent};
use roomdrop::state::SessionState;

const EVENT_BUFFER: usize = 256;

/// Registry of peer-event channels keyed by user id.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    endpoints: Arc<Mutex<HashMap<String, mpsc::Sender<PeerEvent>>>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a connector for `user_id` plus the event stream its session
    /// loop will consume.
    pub async fn connector(&self, user_id: &str) -> (LoopbackConnector, mpsc::Receiver<PeerEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        self.endpoints
            .lock()
            .await
            .insert(user_id.to_string(), tx.clone());
        let connector = LoopbackConnector {
            local_id: user_id.to_string(),
            hub: self.clone(),
            event_tx: tx,
            links: HashMap::new(),
            applied_candidates: Arc::new(Mutex::new(HashMap::new())),
        };
        (connector, rx)
    }

    /// Direct sender into a session's peer-event stream, for injecting
    /// events as if a remote peer produced them.
    pub async fn sender(&self, user_id: &str) -> mpsc::Sender<PeerEvent> {
        self.endpoints
            .lock()
            .await
            .get(user_id)
            .cloned()
            .expect("no such endpoint")
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum LinkState {
    OfferPending,
    Ready,
}

pub struct LoopbackConnector {
    local_id: String,
    hub: LoopbackHub,
    event_tx: mpsc::Sender<PeerEvent>,
    links: HashMap<String, LinkState>,
    /// ICE candidates accepted per peer, for assertions. Clone the Arc
    /// before handing the connector to `spawn_session`.
    pub applied_candidates: Arc<Mutex<HashMap<String, Vec<String>>>>,
}

#[async_trait]
impl PeerConnector for LoopbackConnector {
    async fn create_offer(&mut self, peer_id: &str) -> Result<String, String> {
        self.links.insert(peer_id.to_string(), LinkState::OfferPending);
        Ok(format!("offer:{}", self.local_id))
    }

    async fn handle_offer(&mut self, peer_id: &str, _offer: &str) -> Result<String, String> {
        self.links.insert(peer_id.to_string(), LinkState::Ready);
        let _ = self
            .event_tx
            .send(PeerEvent::ChannelOpen {
                peer_id: peer_id.to_string(),
            })
            .await;
        Ok(format!("answer:{}", self.local_id))
    }

    async fn handle_answer(&mut self, peer_id: &str, _answer: &str) -> Result<(), String> {
        match self.links.get(peer_id) {
            Some(LinkState::OfferPending) => {
                self.links.insert(peer_id.to_string(), LinkState::Ready);
                let _ = self
                    .event_tx
                    .send(PeerEvent::ChannelOpen {
                        peer_id: peer_id.to_string(),
                    })
                    .await;
                Ok(())
            }
            _ => Err(format!("no offer in flight for {}", peer_id)),
        }
    }

    async fn add_ice_candidate(&mut self, peer_id: &str, candidate: &str) -> Result<(), String> {
        if !self.links.contains_key(peer_id) {
            return Err(format!("no connection for {}", peer_id));
        }
        self.applied_candidates
            .lock()
            .await
            .entry(peer_id.to_string())
            .or_default()
            .push(candidate.to_string());
        Ok(())
    }

    async fn restart_ice(&mut self, peer_id: &str) -> Result<String, String> {
        if !self.links.contains_key(peer_id) {
            return Err(format!("no connection for {}", peer_id));
        }
        Ok(format!("restart-offer:{}", self.local_id))
    }

    async fn broadcast(&mut self, message: &PeerMessage) {
        let targets: Vec<mpsc::Sender<PeerEvent>> = {
            let endpoints = self.hub.endpoints.lock().await;
            self.links
                .iter()
                .filter(|(_, state)| **state == LinkState::Ready)
                .filter_map(|(peer_id, _)| endpoints.get(peer_id).cloned())
                .collect()
        };
        for tx in targets {
            let _ = tx
                .send(PeerEvent::Message {
                    peer_id: self.local_id.clone(),
                    message: message.clone(),
                })
                .await;
        }
    }

    async fn close_peer(&mut self, peer_id: &str) {
        self.links.remove(peer_id);
    }

    async fn close_all(&mut self) {
        self.links.clear();
    }

    fn has_peer(&self, peer_id: &str) -> bool {
        self.links.contains_key(peer_id)
    }

    fn open_peers(&self) -> Vec<String> {
        self.links
            .iter()
            .filter(|(_, state)| **state == LinkState::Ready)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Poll a session's watch state until the predicate holds.
pub async fn wait_for(
    rx: &mut watch::Receiver<SessionState>,
    what: &str,
    mut pred: impl FnMut(&SessionState) -> bool,
) {
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if pred(&rx.borrow()) {
                return;
            }
            if rx.changed().await.is_err() {
                panic!("session ended while waiting for {}", what);
            }
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", what);
}
