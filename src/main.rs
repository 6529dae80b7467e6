use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use roomdrop::models::TransferStatus;
use roomdrop::peer::rtc::RtcConfig;
use roomdrop::relay::memory::MemoryRelay;
use roomdrop::rooms::{verify_password, MemoryRoomDirectory, RoomDirectory, RoomMeta};
use roomdrop::session::SessionConfig;
use roomdrop::state::SessionState;

/// Demo: two participants in one process join the same room over the
/// in-memory relay, negotiate real WebRTC connections, and exchange a
/// chat message plus an optional file.
#[derive(Parser)]
#[command(name = "roomdrop", about = "P2P room chat and file drop")]
struct Cli {
    /// Room to join
    #[arg(long, default_value = "lobby")]
    room: String,

    /// Chat message the first participant sends
    #[arg(long, default_value = "hello from roomdrop")]
    message: String,

    /// Optional file the first participant offers to the room
    #[arg(long)]
    file: Option<PathBuf>,
}

async fn wait_for(
    rx: &mut watch::Receiver<SessionState>,
    what: &str,
    mut pred: impl FnMut(&SessionState) -> bool,
) -> Result<(), String> {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if pred(&rx.borrow()) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    })
    .await
    .map_err(|_| format!("timed out waiting for {}", what))
}

#[tokio::main]
async fn main() -> Result<(), String> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    // Room gate: lookup and password verification happen before the
    // engine is ever invoked.
    let mut directory = MemoryRoomDirectory::new();
    directory.insert(
        &cli.room,
        RoomMeta {
            name: cli.room.clone(),
            password_hash: None,
        },
    );
    let meta = directory
        .lookup(&cli.room)
        .ok_or_else(|| format!("room {} not found", cli.room))?;
    if !verify_password(&meta, None) {
        return Err(format!("room {} rejected the password", meta.name));
    }

    let hub = MemoryRelay::new();

    let (alice_relay, alice_rx) = hub.subscribe(&cli.room, "alice").await;
    let alice = roomdrop::spawn_webrtc_session(
        SessionConfig::new(&cli.room, "alice", "Alice"),
        RtcConfig::default(),
        alice_relay,
        alice_rx,
    );

    let (bob_relay, bob_rx) = hub.subscribe(&cli.room, "bob").await;
    let bob = roomdrop::spawn_webrtc_session(
        SessionConfig::new(&cli.room, "bob", "Bob"),
        RtcConfig::default(),
        bob_relay,
        bob_rx,
    );

    let mut alice_state = alice.state();
    let mut bob_state = bob.state();

    wait_for(&mut alice_state, "alice to connect", |s| s.connected).await?;
    wait_for(&mut bob_state, "bob to connect", |s| s.connected).await?;
    info!("Both participants connected");

    alice.send_chat(&cli.message).await?;
    let expected = cli.message.clone();
    wait_for(&mut bob_state, "chat delivery", move |s| {
        s.messages.iter().any(|m| m.message == expected)
    })
    .await?;
    info!("Chat delivered");

    if let Some(path) = cli.file {
        let id = alice.send_file(path).await?;
        let want = id.clone();
        wait_for(&mut bob_state, "file transfer", move |s| {
            s.transfers
                .iter()
                .any(|t| t.id == want && t.status == TransferStatus::Completed)
        })
        .await?;
        let bytes = bob.transfer_data(&id).await?;
        info!("File transfer complete: {} bytes received", bytes.len());
    }

    alice.shutdown().await;
    bob.shutdown().await;
    Ok(())
}
