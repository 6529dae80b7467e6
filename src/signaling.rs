//! Per-peer negotiation bookkeeping: who initiates, which offer/answer
//! messages are still valid, and which ICE candidates are waiting for a
//! connection that can accept them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Negotiation progress for one peer. An absent entry means `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Idle,
    OfferSent,
    AnswerPending,
    Connected,
}

/// Deterministic initiator rule: of any two participants, exactly the one
/// with the lexicographically smaller id initiates. Both sides derive the
/// same answer from the same pair of ids, so no coordination is needed.
pub fn should_initiate(local_id: &str, remote_id: &str) -> bool {
    local_id < remote_id
}

/// Owned table of negotiation state and buffered ICE candidates, keyed by
/// peer id. Mutated only from the session event loop.
#[derive(Debug, Default)]
pub struct NegotiationTable {
    states: HashMap<String, (SignalingState, Instant)>,
    pending_candidates: HashMap<String, Vec<String>>,
}

impl NegotiationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, peer_id: &str) -> SignalingState {
        self.states
            .get(peer_id)
            .map(|(s, _)| *s)
            .unwrap_or(SignalingState::Idle)
    }

    pub fn has_state(&self, peer_id: &str) -> bool {
        self.states.contains_key(peer_id)
    }

    /// Start the initiator path. Only valid from `Idle`; a second call for
    /// the same peer is rejected so a negotiation is never stacked.
    pub fn begin_offer(&mut self, peer_id: &str, now: Instant) -> bool {
        if self.state(peer_id) != SignalingState::Idle {
            return false;
        }
        self.states
            .insert(peer_id.to_string(), (SignalingState::OfferSent, now));
        true
    }

    /// Start the responder path on an incoming offer. Offers received in
    /// any state but `Idle` are stale or duplicated and rejected.
    pub fn begin_answer(&mut self, peer_id: &str, now: Instant) -> bool {
        if self.state(peer_id) != SignalingState::Idle {
            return false;
        }
        self.states
            .insert(peer_id.to_string(), (SignalingState::AnswerPending, now));
        true
    }

    /// Accept an incoming answer. Only valid while in `OfferSent`.
    pub fn accept_answer(&mut self, peer_id: &str) -> bool {
        match self.states.get_mut(peer_id) {
            Some(entry) if entry.0 == SignalingState::OfferSent => {
                entry.0 = SignalingState::Connected;
                true
            }
            _ => false,
        }
    }

    pub fn mark_connected(&mut self, peer_id: &str) {
        if let Some(entry) = self.states.get_mut(peer_id) {
            entry.0 = SignalingState::Connected;
        } else {
            self.states
                .insert(peer_id.to_string(), (SignalingState::Connected, Instant::now()));
        }
    }

    /// Forget the negotiation state (a failed step), keeping buffered
    /// candidates so a retried negotiation can still use them.
    pub fn reset(&mut self, peer_id: &str) {
        self.states.remove(peer_id);
    }

    /// Full per-peer cleanup on leave/disconnect/teardown.
    pub fn remove(&mut self, peer_id: &str) {
        self.states.remove(peer_id);
        self.pending_candidates.remove(peer_id);
    }

    pub fn clear(&mut self) {
        self.states.clear();
        self.pending_candidates.clear();
    }

    pub fn buffer_candidate(&mut self, peer_id: &str, candidate: String) {
        self.pending_candidates
            .entry(peer_id.to_string())
            .or_default()
            .push(candidate);
    }

    /// Take all buffered candidates for a peer, in arrival order.
    pub fn drain_candidates(&mut self, peer_id: &str) -> Vec<String> {
        self.pending_candidates.remove(peer_id).unwrap_or_default()
    }

    /// Peers whose negotiation has been in flight longer than `timeout`
    /// without reaching `Connected`.
    pub fn stale_peers(&self, now: Instant, timeout: Duration) -> Vec<String> {
        self.states
            .iter()
            .filter(|(_, (state, since))| {
                matches!(state, SignalingState::OfferSent | SignalingState::AnswerPending)
                    && now.duration_since(*since) >= timeout
            })
            .map(|(id, _)| id.clone())
            .collect()
    }
}
