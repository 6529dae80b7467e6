mod common;

use std::fs;
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use common::{wait_for, LoopbackHub};
use roomdrop::models::{PeerMessage, PresenceRecord, TransferStatus};
use roomdrop::peer::PeerEvent;
use roomdrop::relay::memory::MemoryRelay;
use roomdrop::relay::{RelayChannel, RelayEvent};
use roomdrop::session::{spawn_session, SessionConfig};
use roomdrop::state::SessionHandle;

const ROOM: &str = "test-room";

fn record(id: &str) -> PresenceRecord {
    PresenceRecord {
        user_id: id.to_string(),
        username: id.to_string(),
        joined_at: 0,
    }
}

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn join(hub: &LoopbackHub, relay: &MemoryRelay, user: &str, name: &str) -> SessionHandle {
    let (connector, peer_rx) = hub.connector(user).await;
    let (relay_handle, relay_rx) = relay.subscribe(ROOM, user).await;
    spawn_session(
        SessionConfig::new(ROOM, user, name),
        connector,
        relay_handle,
        relay_rx,
        peer_rx,
    )
}

#[tokio::test]
async fn two_party_chat() {
    let hub = LoopbackHub::new();
    let relay = MemoryRelay::new();

    let alice = join(&hub, &relay, "alice", "Alice").await;
    let bob = join(&hub, &relay, "bob", "Bob").await;

    let mut alice_state = alice.state();
    let mut bob_state = bob.state();
    wait_for(&mut alice_state, "alice connected", |s| s.connected).await;
    wait_for(&mut bob_state, "bob connected", |s| s.connected).await;

    alice.send_chat("hello").await.unwrap();

    wait_for(&mut bob_state, "bob receives the chat", |s| {
        matches!(s.messages.last(), Some(m) if m.user_id == "alice" && m.message == "hello")
    })
    .await;
    wait_for(&mut alice_state, "alice keeps the local echo", |s| {
        matches!(s.messages.last(), Some(m) if m.user_id == "alice" && m.message == "hello")
    })
    .await;

    // both sides list each other exactly once
    wait_for(&mut bob_state, "bob sees alice", |s| {
        s.peers.iter().filter(|p| p.id == "alice").count() == 1
    })
    .await;
}

#[tokio::test]
async fn file_transfer_end_to_end() {
    let tmp_dir = std::env::temp_dir().join("roomdrop_transfer_test");
    fs::create_dir_all(&tmp_dir).expect("failed to create temp dir");
    let path = tmp_dir.join("payload.bin");
    let content = sample(50_000);
    fs::write(&path, &content).expect("failed to write payload");

    let hub = LoopbackHub::new();
    let relay = MemoryRelay::new();
    let alice = join(&hub, &relay, "alice", "Alice").await;
    let bob = join(&hub, &relay, "bob", "Bob").await;

    let mut alice_state = alice.state();
    let mut bob_state = bob.state();
    wait_for(&mut alice_state, "alice connected", |s| s.connected).await;
    wait_for(&mut bob_state, "bob connected", |s| s.connected).await;

    let id = alice.send_file(&path).await.unwrap();

    let sender_id = id.clone();
    wait_for(&mut alice_state, "sender marks the transfer complete", move |s| {
        s.transfers
            .iter()
            .any(|t| t.id == sender_id && t.status == TransferStatus::Completed && t.progress == 100)
    })
    .await;

    let receiver_id = id.clone();
    wait_for(&mut bob_state, "receiver completes the transfer", move |s| {
        s.transfers
            .iter()
            .any(|t| t.id == receiver_id && t.status == TransferStatus::Completed && t.progress == 100)
    })
    .await;

    let bytes = bob.transfer_data(&id).await.unwrap();
    assert_eq!(bytes.len(), 50_000);
    assert_eq!(bytes, content);

    fs::remove_dir_all(&tmp_dir).expect("failed to remove temp dir");
}

#[tokio::test]
async fn chunks_reassemble_in_reverse_order() {
    let hub = LoopbackHub::new();
    let relay = MemoryRelay::new();
    let bob = join(&hub, &relay, "bob", "Bob").await;
    let bob_tx = hub.sender("bob").await;
    let mut bob_state = bob.state();

    let content = sample(50_000);
    let chunks: Vec<Vec<u8>> = content.chunks(16_384).map(|c| c.to_vec()).collect();
    assert_eq!(chunks.len(), 4);
    assert_eq!(chunks[3].len(), 852);

    bob_tx
        .send(PeerEvent::Message {
            peer_id: "alice".into(),
            message: PeerMessage::FileOffer {
                id: "t1".into(),
                name: "payload.bin".into(),
                size: 50_000,
                from_user_id: "alice".into(),
                from_username: "Alice".into(),
            },
        })
        .await
        .unwrap();

    // half the chunks, highest index first: progress climbs, stays pending
    for i in [3u32, 2] {
        bob_tx
            .send(PeerEvent::Message {
                peer_id: "alice".into(),
                message: PeerMessage::FileChunk {
                    id: "t1".into(),
                    chunk_index: i,
                    total_chunks: 4,
                    data: chunks[i as usize].clone(),
                },
            })
            .await
            .unwrap();
    }
    wait_for(&mut bob_state, "halfway progress", |s| {
        s.transfers
            .iter()
            .any(|t| t.id == "t1" && t.progress == 50 && t.status == TransferStatus::Pending)
    })
    .await;
    assert!(
        bob.transfer_data("t1").await.is_err(),
        "partial transfer must not be downloadable"
    );

    for i in [1u32, 0] {
        bob_tx
            .send(PeerEvent::Message {
                peer_id: "alice".into(),
                message: PeerMessage::FileChunk {
                    id: "t1".into(),
                    chunk_index: i,
                    total_chunks: 4,
                    data: chunks[i as usize].clone(),
                },
            })
            .await
            .unwrap();
    }
    wait_for(&mut bob_state, "reassembly completes", |s| {
        s.transfers
            .iter()
            .any(|t| t.id == "t1" && t.status == TransferStatus::Completed && t.progress == 100)
    })
    .await;

    let bytes = bob.transfer_data("t1").await.unwrap();
    assert_eq!(bytes.len(), 50_000);
    assert_eq!(bytes, content);
}

#[tokio::test]
async fn whole_file_variant_completes_without_chunks() {
    let hub = LoopbackHub::new();
    let relay = MemoryRelay::new();
    let bob = join(&hub, &relay, "bob", "Bob").await;
    let bob_tx = hub.sender("bob").await;
    let mut bob_state = bob.state();

    let content = sample(300);
    bob_tx
        .send(PeerEvent::Message {
            peer_id: "alice".into(),
            message: PeerMessage::FileOffer {
                id: "w1".into(),
                name: "small.bin".into(),
                size: 300,
                from_user_id: "alice".into(),
                from_username: "Alice".into(),
            },
        })
        .await
        .unwrap();
    bob_tx
        .send(PeerEvent::Message {
            peer_id: "alice".into(),
            message: PeerMessage::FileData {
                id: "w1".into(),
                data: content.clone(),
            },
        })
        .await
        .unwrap();

    wait_for(&mut bob_state, "whole-file transfer completes", |s| {
        s.transfers
            .iter()
            .any(|t| t.id == "w1" && t.status == TransferStatus::Completed && t.progress == 100)
    })
    .await;
    assert_eq!(bob.transfer_data("w1").await.unwrap(), content);
}

#[tokio::test]
async fn duplicate_offers_get_one_answer() {
    let hub = LoopbackHub::new();
    let relay = MemoryRelay::new();
    // "aaa" sorts before "alice", so alice waits as responder.
    let _alice = join(&hub, &relay, "alice", "Alice").await;

    let (fake, mut fake_rx) = relay.subscribe(ROOM, "aaa").await;
    fake.track(record("aaa")).await.unwrap();

    let offer = json!({"type": "offer", "from": "aaa", "to": "alice", "offer": "offer:aaa"});
    fake.send(offer.clone()).await.unwrap();
    fake.send(offer).await.unwrap();

    let mut answers = 0;
    while let Ok(Some(event)) = timeout(Duration::from_millis(500), fake_rx.recv()).await {
        if let RelayEvent::Broadcast { payload } = event {
            if payload["type"] == "answer" && payload["to"] == "aaa" {
                answers += 1;
            }
        }
    }
    assert_eq!(answers, 1, "exactly one answer per negotiation attempt");
}

#[tokio::test]
async fn early_ice_candidate_is_applied_after_connection() {
    let hub = LoopbackHub::new();
    let relay = MemoryRelay::new();

    let (connector, peer_rx) = hub.connector("bob").await;
    let applied = connector.applied_candidates.clone();
    let (relay_handle, relay_rx) = relay.subscribe(ROOM, "bob").await;
    let _bob = spawn_session(
        SessionConfig::new(ROOM, "bob", "Bob"),
        connector,
        relay_handle,
        relay_rx,
        peer_rx,
    );

    let (fake, _fake_rx) = relay.subscribe(ROOM, "aaa").await;
    // candidate first: no negotiation state, no connection
    fake.send(json!({
        "type": "ice-candidate", "from": "aaa", "to": "bob", "candidate": "cand-1"
    }))
    .await
    .unwrap();
    fake.track(record("aaa")).await.unwrap();
    fake.send(json!({"type": "offer", "from": "aaa", "to": "bob", "offer": "offer:aaa"}))
        .await
        .unwrap();

    let applied_now = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(candidates) = applied.lock().await.get("aaa") {
                if !candidates.is_empty() {
                    return candidates.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("buffered candidate was never applied");
    assert_eq!(applied_now, vec!["cand-1"]);
}

#[tokio::test]
async fn peer_leave_during_negotiation_clears_state() {
    let hub = LoopbackHub::new();
    let relay = MemoryRelay::new();
    let alice = join(&hub, &relay, "alice", "Alice").await;
    let mut alice_state = alice.state();

    // "zed" sorts after "alice", so alice initiates; zed never answers.
    let (fake, mut fake_rx) = relay.subscribe(ROOM, "zed").await;
    fake.track(record("zed")).await.unwrap();

    let got_offer = timeout(Duration::from_secs(5), async {
        loop {
            match fake_rx.recv().await {
                Some(RelayEvent::Broadcast { payload })
                    if payload["type"] == "offer" && payload["to"] == "zed" =>
                {
                    return;
                }
                Some(_) => {}
                None => panic!("relay closed"),
            }
        }
    })
    .await;
    assert!(got_offer.is_ok(), "alice never offered to zed");
    wait_for(&mut alice_state, "alice tracks the pending peer", |s| {
        s.peers.iter().any(|p| p.id == "zed")
    })
    .await;

    fake.unsubscribe().await;
    wait_for(&mut alice_state, "peer state fully cleared", |s| s.peers.is_empty()).await;

    // a fresh join renegotiates from scratch, proving nothing stale remains
    let (fake2, mut fake2_rx) = relay.subscribe(ROOM, "zed").await;
    fake2.track(record("zed")).await.unwrap();
    let reoffered = timeout(Duration::from_secs(5), async {
        loop {
            match fake2_rx.recv().await {
                Some(RelayEvent::Broadcast { payload })
                    if payload["type"] == "offer" && payload["to"] == "zed" =>
                {
                    return;
                }
                Some(_) => {}
                None => panic!("relay closed"),
            }
        }
    })
    .await;
    assert!(reoffered.is_ok(), "alice did not renegotiate after the leave");
}

#[tokio::test]
async fn chat_without_peers_is_local_only() {
    let hub = LoopbackHub::new();
    let relay = MemoryRelay::new();
    let alice = join(&hub, &relay, "alice", "Alice").await;
    let mut alice_state = alice.state();

    alice.send_chat("anyone here?").await.unwrap();
    wait_for(&mut alice_state, "local echo lands", |s| {
        matches!(s.messages.last(), Some(m) if m.message == "anyone here?")
    })
    .await;
    assert!(!alice_state.borrow().connected);
}

#[tokio::test]
async fn transfer_fails_when_the_sender_leaves() {
    let hub = LoopbackHub::new();
    let relay = MemoryRelay::new();
    let bob = join(&hub, &relay, "bob", "Bob").await;
    let bob_tx = hub.sender("bob").await;
    let mut bob_state = bob.state();

    let (fake, _fake_rx) = relay.subscribe(ROOM, "zed").await;
    fake.track(record("zed")).await.unwrap();

    let content = sample(40_000);
    let chunks: Vec<Vec<u8>> = content.chunks(16_384).map(|c| c.to_vec()).collect();
    bob_tx
        .send(PeerEvent::Message {
            peer_id: "zed".into(),
            message: PeerMessage::FileOffer {
                id: "t9".into(),
                name: "doomed.bin".into(),
                size: 40_000,
                from_user_id: "zed".into(),
                from_username: "zed".into(),
            },
        })
        .await
        .unwrap();
    bob_tx
        .send(PeerEvent::Message {
            peer_id: "zed".into(),
            message: PeerMessage::FileChunk {
                id: "t9".into(),
                chunk_index: 0,
                total_chunks: chunks.len() as u32,
                data: chunks[0].clone(),
            },
        })
        .await
        .unwrap();

    wait_for(&mut bob_state, "partial transfer recorded", |s| {
        s.transfers
            .iter()
            .any(|t| t.id == "t9" && t.status == TransferStatus::Pending && t.progress > 0)
    })
    .await;
    assert!(bob.transfer_data("t9").await.is_err());

    fake.unsubscribe().await;
    wait_for(&mut bob_state, "orphaned transfer fails", |s| {
        s.transfers
            .iter()
            .any(|t| t.id == "t9" && t.status == TransferStatus::Failed)
    })
    .await;
}
