use std::collections::{HashMap, HashSet};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chunker::{self, AssembleStatus, ChunkAssembler};
use crate::events::{AppEvent, EventSender};
use crate::models::{
    ChatMessage, FileTransfer, PeerInfo, PeerMessage, PresenceRecord, SignalMessage, TransferStatus,
};
use crate::peer::{PeerConnState, PeerConnector, PeerEvent};
use crate::relay::{RelayChannel, RelayEvent};
use crate::session::{SessionCommand, SessionConfig};
use crate::signaling::{should_initiate, NegotiationTable, SignalingState};
use crate::state::SessionState;

const SWEEP_PERIOD: std::time::Duration = std::time::Duration::from_secs(5);

/// Run the session event loop. Owns every piece of mutable session state;
/// all other components talk to it over the channels passed in here.
#[allow(clippy::too_many_arguments)]
pub async fn run_session<P, R>(
    config: SessionConfig,
    mut connector: P,
    relay: R,
    mut relay_rx: mpsc::Receiver<RelayEvent>,
    mut peer_rx: mpsc::Receiver<PeerEvent>,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    cmd_tx: mpsc::Sender<SessionCommand>,
    state_tx: watch::Sender<SessionState>,
    event_tx: EventSender,
) where
    P: PeerConnector,
    R: RelayChannel,
{
    info!(
        "Session starting: user {} in room {}",
        config.user_id, config.room_id
    );

    let mut negotiation = NegotiationTable::new();
    let mut peers: Vec<PeerInfo> = Vec::new();
    // Display names learned from presence, ahead of any connection.
    let mut usernames: HashMap<String, String> = HashMap::new();
    let mut messages: Vec<ChatMessage> = Vec::new();
    let mut transfers: Vec<FileTransfer> = Vec::new();
    // Reassembly state per transfer id, allocated on the first chunk.
    let mut assemblers: HashMap<String, ChunkAssembler> = HashMap::new();
    let mut conn_states: HashMap<String, PeerConnState> = HashMap::new();
    let mut ice_retried: HashSet<String> = HashSet::new();
    let mut connected = false;

    if let Err(e) = relay
        .track(PresenceRecord {
            user_id: config.user_id.clone(),
            username: config.username.clone(),
            joined_at: Utc::now().timestamp_millis(),
        })
        .await
    {
        warn!("Failed to announce presence: {}", e);
    }

    let mut sweep = tokio::time::interval(SWEEP_PERIOD);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    None | Some(SessionCommand::Shutdown) => {
                        info!("Session for {} shutting down", config.user_id);
                        connector.close_all().await;
                        negotiation.clear();
                        relay.unsubscribe().await;
                        break;
                    }

                    Some(SessionCommand::SendChat { text }) => {
                        let timestamp = Utc::now().timestamp_millis();
                        let chat = ChatMessage {
                            id: Uuid::new_v4().to_string(),
                            user_id: config.user_id.clone(),
                            username: config.username.clone(),
                            message: text.clone(),
                            timestamp_millis: timestamp,
                        };
                        // Optimistic local echo; delivery is best-effort.
                        let _ = event_tx.send(AppEvent::NewChatMessage(chat.clone()));
                        messages.push(chat);
                        connector
                            .broadcast(&PeerMessage::Chat {
                                user_id: config.user_id.clone(),
                                username: config.username.clone(),
                                message: text,
                                timestamp,
                            })
                            .await;
                    }

                    Some(SessionCommand::SendFile { path, reply }) => {
                        let result = match tokio::fs::metadata(&path).await {
                            Err(e) => Err(format!("Failed to read {}: {}", path.display(), e)),
                            Ok(meta) if !meta.is_file() => {
                                Err(format!("{} is not a file", path.display()))
                            }
                            Ok(meta) => {
                                let id = Uuid::new_v4().to_string();
                                let name = path
                                    .file_name()
                                    .map(|n| n.to_string_lossy().into_owned())
                                    .unwrap_or_else(|| "file".to_string());
                                let transfer = FileTransfer {
                                    id: id.clone(),
                                    name: name.clone(),
                                    size: meta.len(),
                                    progress: 0,
                                    status: TransferStatus::Transferring,
                                    from_user_id: config.user_id.clone(),
                                    from_username: config.username.clone(),
                                    data: None,
                                };
                                let _ = event_tx.send(AppEvent::TransferStarted(transfer.clone()));
                                transfers.push(transfer);

                                connector
                                    .broadcast(&PeerMessage::FileOffer {
                                        id: id.clone(),
                                        name,
                                        size: meta.len(),
                                        from_user_id: config.user_id.clone(),
                                        from_username: config.username.clone(),
                                    })
                                    .await;

                                let loader_tx = cmd_tx.clone();
                                let load_id = id.clone();
                                tokio::spawn(async move {
                                    let result =
                                        tokio::fs::read(&path).await.map_err(|e| e.to_string());
                                    let _ = loader_tx
                                        .send(SessionCommand::FileLoaded { id: load_id, result })
                                        .await;
                                });
                                Ok(id)
                            }
                        };
                        let _ = reply.send(result);
                    }

                    Some(SessionCommand::FileLoaded { id, result }) => match result {
                        Err(e) => {
                            error!("Failed to load outgoing file for transfer {}: {}", id, e);
                            if let Some(t) = transfers.iter_mut().find(|t| t.id == id) {
                                t.status = TransferStatus::Failed;
                            }
                            let _ = event_tx.send(AppEvent::TransferFailed { id });
                        }
                        Ok(data) => {
                            if let Some(t) = transfers.iter_mut().find(|t| t.id == id) {
                                t.data = Some(data.clone());
                                t.status = TransferStatus::Completed;
                                t.progress = 100;
                            }
                            let _ = event_tx.send(AppEvent::TransferCompleted { id: id.clone() });

                            if data.is_empty() {
                                // Zero chunks would leave receivers pending
                                // forever; ship the whole-file variant.
                                connector.broadcast(&PeerMessage::FileData { id, data }).await;
                            } else {
                                let total = chunker::total_chunks(data.len(), config.chunk_size);
                                for (index, chunk) in data.chunks(config.chunk_size).enumerate() {
                                    connector
                                        .broadcast(&PeerMessage::FileChunk {
                                            id: id.clone(),
                                            chunk_index: index as u32,
                                            total_chunks: total,
                                            data: chunk.to_vec(),
                                        })
                                        .await;
                                }
                                debug!("Sent {} chunks for transfer {}", total, id);
                            }
                        }
                    },

                    Some(SessionCommand::TransferData { id, reply }) => {
                        let result = match transfers.iter().find(|t| t.id == id) {
                            None => Err(format!("Unknown transfer {}", id)),
                            Some(t) => match (t.status, &t.data) {
                                (TransferStatus::Completed, Some(data)) => Ok(data.clone()),
                                _ => Err("File data is not ready yet".to_string()),
                            },
                        };
                        let _ = reply.send(result);
                    }

                    Some(SessionCommand::RetryIce { peer_id }) => {
                        if conn_states.get(&peer_id) == Some(&PeerConnState::Failed)
                            && connector.has_peer(&peer_id)
                        {
                            // Restart is a renegotiation; only the
                            // deterministic initiator drives it.
                            if should_initiate(&config.user_id, &peer_id) {
                                match connector.restart_ice(&peer_id).await {
                                    Ok(offer) => {
                                        negotiation.reset(&peer_id);
                                        negotiation.begin_offer(&peer_id, Instant::now());
                                        send_signal(
                                            &relay,
                                            SignalMessage::Offer {
                                                from: config.user_id.clone(),
                                                to: peer_id.clone(),
                                                offer,
                                            },
                                        )
                                        .await;
                                    }
                                    Err(e) => warn!("ICE restart for {} failed: {}", peer_id, e),
                                }
                            } else {
                                debug!("Waiting for {} to restart ICE", peer_id);
                            }
                        }
                    }
                }
            }

            Some(event) = relay_rx.recv() => {
                match event {
                    RelayEvent::PresenceSync { participants } => {
                        debug!("Presence sync: {} participants", participants.len());
                    }

                    RelayEvent::PresenceJoin { key: _, new_presences } => {
                        for presence in new_presences {
                            let peer_id = presence.user_id;
                            if peer_id == config.user_id {
                                continue;
                            }
                            usernames.insert(peer_id.clone(), presence.username.clone());
                            if connector.has_peer(&peer_id) {
                                debug!("Already connected to {}, skipping", peer_id);
                                continue;
                            }
                            if should_initiate(&config.user_id, &peer_id) {
                                if !negotiation.begin_offer(&peer_id, Instant::now()) {
                                    debug!(
                                        "Negotiation with {} already {:?}, not re-offering",
                                        peer_id,
                                        negotiation.state(&peer_id)
                                    );
                                    continue;
                                }
                                info!("Initiating connection to {}", peer_id);
                                match connector.create_offer(&peer_id).await {
                                    Ok(offer) => {
                                        upsert_peer(
                                            &mut peers,
                                            &peer_id,
                                            &presence.username,
                                            &event_tx,
                                        );
                                        send_signal(
                                            &relay,
                                            SignalMessage::Offer {
                                                from: config.user_id.clone(),
                                                to: peer_id.clone(),
                                                offer,
                                            },
                                        )
                                        .await;
                                    }
                                    Err(e) => {
                                        error!("Error creating offer for {}: {}", peer_id, e);
                                        negotiation.reset(&peer_id);
                                    }
                                }
                            } else {
                                debug!("Waiting for offer from {}", peer_id);
                            }
                        }
                    }

                    RelayEvent::PresenceLeave { key } => {
                        if key != config.user_id {
                            info!("User left: {}", key);
                            remove_peer(
                                &mut connector,
                                &mut peers,
                                &mut negotiation,
                                &mut transfers,
                                &mut assemblers,
                                &mut conn_states,
                                &mut ice_retried,
                                &event_tx,
                                &key,
                            )
                            .await;
                        }
                    }

                    RelayEvent::Broadcast { payload } => {
                        let signal = match serde_json::from_value::<SignalMessage>(payload) {
                            Ok(signal) => signal,
                            Err(e) => {
                                debug!("Dropping unrecognized broadcast payload: {}", e);
                                continue;
                            }
                        };
                        if signal.recipient() != config.user_id {
                            continue;
                        }
                        match signal {
                            SignalMessage::Offer { from, offer, .. } => {
                                if !negotiation.begin_answer(&from, Instant::now()) {
                                    debug!(
                                        "Ignoring offer from {}, current state {:?}",
                                        from,
                                        negotiation.state(&from)
                                    );
                                    continue;
                                }
                                info!("Received offer from {}", from);
                                let username = usernames
                                    .get(&from)
                                    .cloned()
                                    .unwrap_or_else(|| from.chars().take(8).collect());
                                match connector.handle_offer(&from, &offer).await {
                                    Ok(answer) => {
                                        upsert_peer(&mut peers, &from, &username, &event_tx);
                                        flush_candidates(&mut connector, &mut negotiation, &from)
                                            .await;
                                        send_signal(
                                            &relay,
                                            SignalMessage::Answer {
                                                from: config.user_id.clone(),
                                                to: from.clone(),
                                                answer,
                                            },
                                        )
                                        .await;
                                        negotiation.mark_connected(&from);
                                    }
                                    Err(e) => {
                                        error!("Error handling offer from {}: {}", from, e);
                                        negotiation.reset(&from);
                                    }
                                }
                            }

                            SignalMessage::Answer { from, answer, .. } => {
                                if negotiation.state(&from) != SignalingState::OfferSent {
                                    debug!(
                                        "Ignoring answer from {}, current state {:?}",
                                        from,
                                        negotiation.state(&from)
                                    );
                                    continue;
                                }
                                info!("Received answer from {}", from);
                                match connector.handle_answer(&from, &answer).await {
                                    Ok(()) => {
                                        flush_candidates(&mut connector, &mut negotiation, &from)
                                            .await;
                                        negotiation.accept_answer(&from);
                                    }
                                    Err(e) => {
                                        error!("Error handling answer from {}: {}", from, e);
                                        negotiation.reset(&from);
                                    }
                                }
                            }

                            SignalMessage::IceCandidate { from, candidate, .. } => {
                                if negotiation.has_state(&from) && connector.has_peer(&from) {
                                    if let Err(e) =
                                        connector.add_ice_candidate(&from, &candidate).await
                                    {
                                        debug!("Buffering ICE candidate from {}: {}", from, e);
                                        negotiation.buffer_candidate(&from, candidate);
                                    }
                                } else {
                                    debug!(
                                        "Buffering ICE candidate from {}, no active connection",
                                        from
                                    );
                                    negotiation.buffer_candidate(&from, candidate);
                                }
                            }
                        }
                    }
                }
            }

            Some(event) = peer_rx.recv() => {
                match event {
                    PeerEvent::ConnectionState { peer_id, state } => {
                        conn_states.insert(peer_id.clone(), state);
                        match state {
                            PeerConnState::Connected => {
                                negotiation.mark_connected(&peer_id);
                                connected = true;
                            }
                            PeerConnState::Failed => {
                                if ice_retried.insert(peer_id.clone()) {
                                    info!(
                                        "Connection failed with {}, scheduling ICE restart",
                                        peer_id
                                    );
                                    let retry_tx = cmd_tx.clone();
                                    let delay = config.ice_restart_delay;
                                    tokio::spawn(async move {
                                        tokio::time::sleep(delay).await;
                                        let _ = retry_tx
                                            .send(SessionCommand::RetryIce { peer_id })
                                            .await;
                                    });
                                } else {
                                    info!("Connection with {} failed again, dropping", peer_id);
                                    remove_peer(
                                        &mut connector,
                                        &mut peers,
                                        &mut negotiation,
                                        &mut transfers,
                                        &mut assemblers,
                                        &mut conn_states,
                                        &mut ice_retried,
                                        &event_tx,
                                        &peer_id,
                                    )
                                    .await;
                                }
                            }
                            PeerConnState::Disconnected | PeerConnState::Closed => {
                                remove_peer(
                                    &mut connector,
                                    &mut peers,
                                    &mut negotiation,
                                    &mut transfers,
                                    &mut assemblers,
                                    &mut conn_states,
                                    &mut ice_retried,
                                    &event_tx,
                                    &peer_id,
                                )
                                .await;
                            }
                            PeerConnState::Connecting => {}
                        }
                    }

                    PeerEvent::IceCandidate { peer_id, candidate } => {
                        send_signal(
                            &relay,
                            SignalMessage::IceCandidate {
                                from: config.user_id.clone(),
                                to: peer_id,
                                candidate,
                            },
                        )
                        .await;
                    }

                    PeerEvent::ChannelOpen { peer_id } => {
                        connected = true;
                        if let Some(p) = peers.iter_mut().find(|p| p.id == peer_id) {
                            p.channel_open = true;
                        }
                        let _ = event_tx.send(AppEvent::ChannelOpened { peer_id });
                    }

                    PeerEvent::ChannelClosed { peer_id } => {
                        info!("Data channel closed with {}", peer_id);
                        remove_peer(
                            &mut connector,
                            &mut peers,
                            &mut negotiation,
                            &mut transfers,
                            &mut assemblers,
                            &mut conn_states,
                            &mut ice_retried,
                            &event_tx,
                            &peer_id,
                        )
                        .await;
                    }

                    PeerEvent::Message { peer_id, message } => match message {
                        PeerMessage::Chat { user_id, username, message, timestamp } => {
                            let chat = ChatMessage {
                                id: Uuid::new_v4().to_string(),
                                user_id,
                                username,
                                message,
                                timestamp_millis: timestamp,
                            };
                            let _ = event_tx.send(AppEvent::NewChatMessage(chat.clone()));
                            messages.push(chat);
                        }

                        PeerMessage::FileOffer { id, name, size, from_user_id, from_username } => {
                            if transfers.iter().any(|t| t.id == id) {
                                debug!("Duplicate file offer {} from {}", id, peer_id);
                                continue;
                            }
                            let transfer = FileTransfer {
                                id,
                                name,
                                size,
                                progress: 0,
                                status: TransferStatus::Pending,
                                from_user_id,
                                from_username,
                                data: None,
                            };
                            let _ = event_tx.send(AppEvent::TransferStarted(transfer.clone()));
                            transfers.push(transfer);
                        }

                        PeerMessage::FileData { id, data } => {
                            if let Some(t) = transfers.iter_mut().find(|t| t.id == id) {
                                t.data = Some(data);
                                t.status = TransferStatus::Completed;
                                t.progress = 100;
                                assemblers.remove(&id);
                                let _ = event_tx.send(AppEvent::TransferCompleted { id });
                            } else {
                                debug!("Whole-file payload for unknown transfer {} from {}", id, peer_id);
                            }
                        }

                        PeerMessage::FileChunk { id, chunk_index, total_chunks, data } => {
                            if transfers
                                .iter()
                                .any(|t| t.id == id && t.status == TransferStatus::Completed)
                            {
                                debug!("Ignoring late chunk for completed transfer {}", id);
                                continue;
                            }
                            let status = {
                                let asm = assemblers
                                    .entry(id.clone())
                                    .or_insert_with(|| ChunkAssembler::new(total_chunks));
                                if asm.total() != total_chunks {
                                    warn!(
                                        "Chunk for {} declares {} total chunks, expected {}",
                                        id,
                                        total_chunks,
                                        asm.total()
                                    );
                                    continue;
                                }
                                asm.insert(chunk_index, data)
                            };
                            match status {
                                Err(e) => warn!("Dropping chunk for {}: {}", id, e),
                                Ok(AssembleStatus::Progress(progress)) => {
                                    if let Some(t) = transfers.iter_mut().find(|t| t.id == id) {
                                        t.progress = progress;
                                        let _ = event_tx
                                            .send(AppEvent::TransferProgress { id, progress });
                                    }
                                }
                                Ok(AssembleStatus::Complete(bytes)) => {
                                    assemblers.remove(&id);
                                    if let Some(t) = transfers.iter_mut().find(|t| t.id == id) {
                                        t.data = Some(bytes);
                                        t.status = TransferStatus::Completed;
                                        t.progress = 100;
                                        let _ =
                                            event_tx.send(AppEvent::TransferCompleted { id });
                                    } else {
                                        debug!("Completed chunks for unknown transfer {}", id);
                                    }
                                }
                            }
                        }
                    },
                }
            }

            _ = sweep.tick() => {
                for peer_id in negotiation.stale_peers(Instant::now(), config.negotiation_timeout) {
                    warn!("Negotiation with {} timed out, cleaning up", peer_id);
                    remove_peer(
                        &mut connector,
                        &mut peers,
                        &mut negotiation,
                        &mut transfers,
                        &mut assemblers,
                        &mut conn_states,
                        &mut ice_retried,
                        &event_tx,
                        &peer_id,
                    )
                    .await;
                }
            }
        }

        publish_state(&state_tx, &peers, &messages, &transfers, connected);
    }
}

/// Encode and publish a signaling payload; failures are logged, never
/// fatal.
async fn send_signal<R: RelayChannel>(relay: &R, message: SignalMessage) {
    match serde_json::to_value(&message) {
        Ok(payload) => {
            if let Err(e) = relay.send(payload).await {
                warn!("Failed to publish signal: {}", e);
            }
        }
        Err(e) => warn!("Failed to encode signal: {}", e),
    }
}

/// Apply every buffered ICE candidate for a peer, in arrival order.
async fn flush_candidates<P: PeerConnector>(
    connector: &mut P,
    negotiation: &mut NegotiationTable,
    peer_id: &str,
) {
    let candidates = negotiation.drain_candidates(peer_id);
    if candidates.is_empty() {
        return;
    }
    debug!(
        "Processing {} buffered ICE candidates for {}",
        candidates.len(),
        peer_id
    );
    for candidate in candidates {
        if let Err(e) = connector.add_ice_candidate(peer_id, &candidate).await {
            warn!("Failed to add buffered ICE candidate for {}: {}", peer_id, e);
        }
    }
}

fn upsert_peer(peers: &mut Vec<PeerInfo>, peer_id: &str, username: &str, event_tx: &EventSender) {
    if peers.iter().any(|p| p.id == peer_id) {
        return;
    }
    let info = PeerInfo {
        id: peer_id.to_string(),
        username: username.to_string(),
        channel_open: false,
    };
    let _ = event_tx.send(AppEvent::PeerJoined(info.clone()));
    peers.push(info);
}

/// Tear down everything tied to one peer: connection, negotiation state,
/// buffered candidates, and transfers that can no longer complete.
#[allow(clippy::too_many_arguments)]
async fn remove_peer<P: PeerConnector>(
    connector: &mut P,
    peers: &mut Vec<PeerInfo>,
    negotiation: &mut NegotiationTable,
    transfers: &mut [FileTransfer],
    assemblers: &mut HashMap<String, ChunkAssembler>,
    conn_states: &mut HashMap<String, PeerConnState>,
    ice_retried: &mut HashSet<String>,
    event_tx: &EventSender,
    peer_id: &str,
) {
    connector.close_peer(peer_id).await;
    negotiation.remove(peer_id);
    conn_states.remove(peer_id);
    ice_retried.remove(peer_id);

    let had_peer = peers.iter().any(|p| p.id == peer_id);
    peers.retain(|p| p.id != peer_id);
    if had_peer {
        let _ = event_tx.send(AppEvent::PeerLeft {
            peer_id: peer_id.to_string(),
        });
    }

    for transfer in transfers.iter_mut().filter(|t| t.from_user_id == peer_id) {
        if matches!(
            transfer.status,
            TransferStatus::Pending | TransferStatus::Transferring
        ) {
            transfer.status = TransferStatus::Failed;
            assemblers.remove(&transfer.id);
            let _ = event_tx.send(AppEvent::TransferFailed {
                id: transfer.id.clone(),
            });
        }
    }
}

fn publish_state(
    state_tx: &watch::Sender<SessionState>,
    peers: &[PeerInfo],
    messages: &[ChatMessage],
    transfers: &[FileTransfer],
    connected: bool,
) {
    // Snapshots carry transfer metadata only; payload bytes stay with the
    // session and are served through the transfer-data command.
    let transfers = transfers
        .iter()
        .map(|t| FileTransfer {
            data: None,
            ..t.clone()
        })
        .collect();
    let _ = state_tx.send(SessionState {
        peers: peers.to_vec(),
        messages: messages.to_vec(),
        transfers,
        connected,
    });
}
