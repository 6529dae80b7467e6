use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::models::PeerMessage;
use crate::peer::{PeerConnState, PeerConnector, PeerEvent};

/// Label of the message channel; the initiator creates it, the responder
/// adopts it by label.
pub const DATA_CHANNEL_LABEL: &str = "file-transfer";

/// How long to wait between buffered-amount polls while a channel drains.
const DRAIN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct RtcConfig {
    pub ice_servers: Vec<String>,
    /// Chunk sends wait while the channel buffer is above this.
    pub max_buffered_amount: usize,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
                "stun:stun3.l.google.com:19302".to_string(),
                "stun:stun4.l.google.com:19302".to_string(),
            ],
            max_buffered_amount: 1024 * 1024,
        }
    }
}

/// Manages all WebRTC peer connections and their data channels.
pub struct RtcPeerManager {
    config: RtcConfig,
    connections: HashMap<String, Arc<RTCPeerConnection>>,
    /// Shared with on_data_channel callbacks so both the offerer and the
    /// answerer side can send.
    data_channels: Arc<Mutex<HashMap<String, Arc<RTCDataChannel>>>>,
    /// Open-state cache maintained from channel open/close callbacks.
    open_flags: Arc<std::sync::Mutex<HashMap<String, bool>>>,
    event_tx: mpsc::Sender<PeerEvent>,
}

impl RtcPeerManager {
    pub fn new(config: RtcConfig, event_tx: mpsc::Sender<PeerEvent>) -> Self {
        Self {
            config,
            connections: HashMap::new(),
            data_channels: Arc::new(Mutex::new(HashMap::new())),
            open_flags: Arc::new(std::sync::Mutex::new(HashMap::new())),
            event_tx,
        }
    }

    /// Internal: create a new RTCPeerConnection with event handlers wired
    /// into the session's peer-event channel.
    async fn create_peer_connection(
        &mut self,
        peer_id: &str,
    ) -> Result<Arc<RTCPeerConnection>, String> {
        // A stale connection to the same peer is replaced, not stacked.
        if self.connections.contains_key(peer_id) {
            self.close_peer(peer_id).await;
        }

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| format!("Failed to register codecs: {}", e))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| format!("Failed to register interceptors: {}", e))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| format!("Failed to create peer connection: {}", e))?,
        );

        let event_tx = self.event_tx.clone();
        let pid = peer_id.to_string();

        let event_tx_state = event_tx.clone();
        let pid_state = pid.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = event_tx_state.clone();
            let pid = pid_state.clone();
            Box::pin(async move {
                info!("Connection state with {}: {}", pid, state);
                let mapped = match state {
                    RTCPeerConnectionState::Connected => Some(PeerConnState::Connected),
                    RTCPeerConnectionState::Disconnected => Some(PeerConnState::Disconnected),
                    RTCPeerConnectionState::Failed => Some(PeerConnState::Failed),
                    RTCPeerConnectionState::Closed => Some(PeerConnState::Closed),
                    RTCPeerConnectionState::Connecting => Some(PeerConnState::Connecting),
                    _ => None,
                };
                if let Some(state) = mapped {
                    let _ = tx
                        .send(PeerEvent::ConnectionState { peer_id: pid, state })
                        .await;
                }
            })
        }));

        let event_tx_ice = event_tx.clone();
        let pid_ice = pid.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = event_tx_ice.clone();
            let pid = pid_ice.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    let json = match candidate.to_json() {
                        Ok(init) => serde_json::to_string(&init).unwrap_or_default(),
                        Err(e) => {
                            warn!("Failed to serialize ICE candidate: {}", e);
                            return;
                        }
                    };
                    let _ = tx
                        .send(PeerEvent::IceCandidate {
                            peer_id: pid,
                            candidate: json,
                        })
                        .await;
                }
            })
        }));

        // Responder side: adopt the channel offered by the initiator.
        let event_tx_dc = event_tx.clone();
        let pid_dc = pid.clone();
        let dc_channels = self.data_channels.clone();
        let dc_flags = self.open_flags.clone();
        pc.on_data_channel(Box::new(move |dc| {
            let tx = event_tx_dc.clone();
            let pid = pid_dc.clone();
            let channels = dc_channels.clone();
            let flags = dc_flags.clone();
            Box::pin(async move {
                info!("Received data channel '{}' from {}", dc.label(), pid);
                if dc.label() == DATA_CHANNEL_LABEL {
                    Self::setup_data_channel(&channels, &flags, &tx, &pid, dc).await;
                }
            })
        }));

        self.connections.insert(peer_id.to_string(), pc.clone());
        info!("Created peer connection for {}", peer_id);

        Ok(pc)
    }

    /// Store the channel for sending and wire its open/close/message
    /// handlers into the peer-event stream.
    async fn setup_data_channel(
        data_channels: &Arc<Mutex<HashMap<String, Arc<RTCDataChannel>>>>,
        open_flags: &Arc<std::sync::Mutex<HashMap<String, bool>>>,
        event_tx: &mpsc::Sender<PeerEvent>,
        peer_id: &str,
        dc: Arc<RTCDataChannel>,
    ) {
        data_channels
            .lock()
            .await
            .insert(peer_id.to_string(), dc.clone());

        let tx_open = event_tx.clone();
        let pid_open = peer_id.to_string();
        let flags_open = open_flags.clone();
        dc.on_open(Box::new(move || {
            let tx = tx_open.clone();
            let pid = pid_open.clone();
            let flags = flags_open.clone();
            Box::pin(async move {
                info!("Data channel opened with peer {}", pid);
                if let Ok(mut flags) = flags.lock() {
                    flags.insert(pid.clone(), true);
                }
                let _ = tx.send(PeerEvent::ChannelOpen { peer_id: pid }).await;
            })
        }));

        let tx_close = event_tx.clone();
        let pid_close = peer_id.to_string();
        let flags_close = open_flags.clone();
        dc.on_close(Box::new(move || {
            let tx = tx_close.clone();
            let pid = pid_close.clone();
            let flags = flags_close.clone();
            Box::pin(async move {
                info!("Data channel closed with peer {}", pid);
                if let Ok(mut flags) = flags.lock() {
                    flags.insert(pid.clone(), false);
                }
                let _ = tx.send(PeerEvent::ChannelClosed { peer_id: pid }).await;
            })
        }));

        let tx_msg = event_tx.clone();
        let pid_msg = peer_id.to_string();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = tx_msg.clone();
            let pid = pid_msg.clone();
            Box::pin(async move {
                match serde_json::from_slice::<PeerMessage>(&msg.data) {
                    Ok(message) => {
                        let _ = tx.send(PeerEvent::Message { peer_id: pid, message }).await;
                    }
                    Err(e) => {
                        warn!("Dropping malformed message from {}: {}", pid, e);
                    }
                }
            })
        }));
    }

    fn connection(&self, peer_id: &str) -> Result<&Arc<RTCPeerConnection>, String> {
        self.connections
            .get(peer_id)
            .ok_or_else(|| format!("No peer connection for {}", peer_id))
    }
}

#[async_trait]
impl PeerConnector for RtcPeerManager {
    async fn create_offer(&mut self, peer_id: &str) -> Result<String, String> {
        let pc = self.create_peer_connection(peer_id).await?;

        // Initiator creates the message channel.
        let dc = pc
            .create_data_channel(DATA_CHANNEL_LABEL, None)
            .await
            .map_err(|e| format!("Failed to create data channel: {}", e))?;
        Self::setup_data_channel(&self.data_channels, &self.open_flags, &self.event_tx, peer_id, dc)
            .await;

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| format!("Failed to create offer: {}", e))?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(|e| format!("Failed to set local description: {}", e))?;

        let sdp = serde_json::to_string(&offer).map_err(|e| format!("Failed to serialize SDP: {}", e))?;
        info!("Created offer for peer {}", peer_id);
        Ok(sdp)
    }

    async fn handle_offer(&mut self, peer_id: &str, offer: &str) -> Result<String, String> {
        let offer: RTCSessionDescription =
            serde_json::from_str(offer).map_err(|e| format!("Failed to parse offer SDP: {}", e))?;

        if !self.connections.contains_key(peer_id) {
            self.create_peer_connection(peer_id).await?;
        }
        let pc = self.connection(peer_id)?;

        pc.set_remote_description(offer)
            .await
            .map_err(|e| format!("Failed to set remote description: {}", e))?;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| format!("Failed to create answer: {}", e))?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(|e| format!("Failed to set local description: {}", e))?;

        let sdp =
            serde_json::to_string(&answer).map_err(|e| format!("Failed to serialize answer SDP: {}", e))?;
        info!("Created answer for peer {}", peer_id);
        Ok(sdp)
    }

    async fn handle_answer(&mut self, peer_id: &str, answer: &str) -> Result<(), String> {
        let answer: RTCSessionDescription =
            serde_json::from_str(answer).map_err(|e| format!("Failed to parse answer SDP: {}", e))?;

        let pc = self.connection(peer_id)?;
        pc.set_remote_description(answer)
            .await
            .map_err(|e| format!("Failed to set remote description: {}", e))?;
        info!("Applied answer from peer {}", peer_id);
        Ok(())
    }

    async fn add_ice_candidate(&mut self, peer_id: &str, candidate: &str) -> Result<(), String> {
        let candidate: RTCIceCandidateInit =
            serde_json::from_str(candidate).map_err(|e| format!("Failed to parse ICE candidate: {}", e))?;

        let pc = self.connection(peer_id)?;
        pc.add_ice_candidate(candidate)
            .await
            .map_err(|e| format!("Failed to add ICE candidate: {}", e))?;
        debug!("Added ICE candidate from peer {}", peer_id);
        Ok(())
    }

    async fn restart_ice(&mut self, peer_id: &str) -> Result<String, String> {
        let pc = self.connection(peer_id)?;
        let offer = pc
            .create_offer(Some(RTCOfferOptions {
                ice_restart: true,
                voice_activity_detection: false,
            }))
            .await
            .map_err(|e| format!("Failed to create restart offer: {}", e))?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(|e| format!("Failed to set local description: {}", e))?;

        let sdp = serde_json::to_string(&offer).map_err(|e| format!("Failed to serialize SDP: {}", e))?;
        info!("Created ICE-restart offer for peer {}", peer_id);
        Ok(sdp)
    }

    async fn broadcast(&mut self, message: &PeerMessage) {
        let payload = match serde_json::to_vec(message) {
            Ok(bytes) => bytes::Bytes::from(bytes),
            Err(e) => {
                warn!("Failed to serialize peer message: {}", e);
                return;
            }
        };
        let is_chunk = matches!(message, PeerMessage::FileChunk { .. });

        let channels = self.data_channels.lock().await;
        for (pid, dc) in channels.iter() {
            if dc.ready_state() != RTCDataChannelState::Open {
                continue;
            }
            if is_chunk {
                // Backpressure: let the SCTP buffer drain before the next
                // chunk instead of overrunning it in a tight loop.
                while dc.buffered_amount().await > self.config.max_buffered_amount {
                    tokio::time::sleep(DRAIN_POLL).await;
                }
            }
            if let Err(e) = dc.send(&payload).await {
                debug!("Failed to send to {}: {}", pid, e);
            }
        }
    }

    async fn close_peer(&mut self, peer_id: &str) {
        self.data_channels.lock().await.remove(peer_id);
        if let Ok(mut flags) = self.open_flags.lock() {
            flags.remove(peer_id);
        }
        if let Some(pc) = self.connections.remove(peer_id) {
            if let Err(e) = pc.close().await {
                warn!("Error closing peer connection to {}: {}", peer_id, e);
            }
            info!("Closed peer connection to {}", peer_id);
        }
    }

    async fn close_all(&mut self) {
        let peer_ids: Vec<String> = self.connections.keys().cloned().collect();
        for peer_id in peer_ids {
            self.close_peer(&peer_id).await;
        }
    }

    fn has_peer(&self, peer_id: &str) -> bool {
        self.connections.contains_key(peer_id)
    }

    fn open_peers(&self) -> Vec<String> {
        match self.open_flags.lock() {
            Ok(flags) => flags
                .iter()
                .filter(|(_, open)| **open)
                .map(|(id, _)| id.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}
