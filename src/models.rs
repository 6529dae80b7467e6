use serde::{Deserialize, Serialize};

/// Serde helper: serialize binary payloads as base64 strings instead of
/// JSON arrays of numbers, which would blow past the data channel
/// message size ceiling.
pub mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
        serializer.serialize_str(&b64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}

// ============================================================
// Session state records
// ============================================================

/// Identity announced over the room's presence channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    pub username: String,
    pub joined_at: i64,
}

/// A remote participant with an active connection attempt.
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub id: String,
    pub username: String,
    /// True once this peer's data channel is open for sending.
    pub channel_open: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub id: String,
    pub user_id: String,
    pub username: String,
    pub message: String,
    pub timestamp_millis: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Transferring,
    Completed,
    Failed,
}

/// One file transfer attempt, local or remote. Never removed from the
/// session's collection, only status-updated.
#[derive(Debug, Clone, Serialize)]
pub struct FileTransfer {
    pub id: String,
    pub name: String,
    pub size: u64,
    /// 0-100; reaches exactly 100 only once every chunk has arrived.
    pub progress: u8,
    pub status: TransferStatus,
    pub from_user_id: String,
    pub from_username: String,
    /// Full reassembled bytes, present once the transfer completed.
    /// State snapshots omit it; downloads go through the session handle.
    #[serde(skip)]
    pub data: Option<Vec<u8>>,
}

// ============================================================
// Relay signaling payloads
// ============================================================

/// Negotiation messages exchanged over the room's broadcast relay.
/// The relay is visible to every room member, so each payload carries
/// explicit `from`/`to` fields and non-addressed receivers discard it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    Offer {
        from: String,
        to: String,
        offer: String,
    },
    Answer {
        from: String,
        to: String,
        answer: String,
    },
    IceCandidate {
        from: String,
        to: String,
        candidate: String,
    },
}

impl SignalMessage {
    pub fn sender(&self) -> &str {
        match self {
            SignalMessage::Offer { from, .. }
            | SignalMessage::Answer { from, .. }
            | SignalMessage::IceCandidate { from, .. } => from,
        }
    }

    pub fn recipient(&self) -> &str {
        match self {
            SignalMessage::Offer { to, .. }
            | SignalMessage::Answer { to, .. }
            | SignalMessage::IceCandidate { to, .. } => to,
        }
    }
}

// ============================================================
// Peer data channel payloads
// ============================================================

/// Everything that travels over a peer's data channel, JSON-serialized.
/// Unknown or malformed tags are a parse error at the boundary and the
/// message is dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PeerMessage {
    #[serde(rename_all = "camelCase")]
    Chat {
        user_id: String,
        username: String,
        message: String,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    FileOffer {
        id: String,
        name: String,
        size: u64,
        from_user_id: String,
        from_username: String,
    },
    /// Whole-file variant: the entire payload in a single message.
    FileData {
        id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    #[serde(rename_all = "camelCase")]
    FileChunk {
        id: String,
        chunk_index: u32,
        total_chunks: u32,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
}
