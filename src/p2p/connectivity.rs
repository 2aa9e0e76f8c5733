//! Connectivity checks between candidate pairs
//!
//! Binding requests and responses travel directly between the two agents'
//! sockets to prove that a candidate pair is reachable.
//!
//! # Protocol Overview
//!
//! ```text
//! Agent A                                            Agent B
//!   │                                                    │
//!   │─── 0xB1 BindingRequest (txn_id, priority) ───────►│
//!   │                                                    │
//!   │◄─── 0xB1 BindingResponse (txn_id, mapped) ────────│
//!   │                                                    │
//!   │   (pair succeeded, path is usable)                 │
//!   │                                                    │
//!   │─── 0xB1 BindingRequest (use_candidate) ──────────►│  controlling side
//!   │◄─── 0xB1 BindingResponse ─────────────────────────│  nominates
//! ```
//!
//! # Candidate Pair Priority (RFC 8445 Section 6.1.2.3)
//!
//! ```text
//! pair_priority = 2^32 * MIN(G,D) + 2 * MAX(G,D) + (G > D ? 1 : 0)
//! ```
//! where G = controlling agent priority, D = controlled agent priority

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::candidate::Candidate;

// ============================================================================
// Constants
// ============================================================================

pub const TRANSACTION_ID_LEN: usize = 12;

/// Leading byte of a binding datagram
pub const BINDING_TAG: u8 = 0xB1;

/// Initial retransmit interval
pub const INITIAL_RTO: Duration = Duration::from_millis(100);

/// Maximum retransmit interval
pub const MAX_RTO: Duration = Duration::from_millis(1600);

/// Maximum number of sends per check
pub const MAX_TRANSMITS: u32 = 5;

/// A check still unanswered this long after its first send has failed
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between any two binding requests from one agent
pub const PACE_INTERVAL: Duration = Duration::from_millis(20);

// ============================================================================
// Binding Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRequest {
    pub transaction_id: [u8; TRANSACTION_ID_LEN],
    /// Priority the sender would assign a peer reflexive candidate for itself
    pub priority: u32,
    /// Set by the controlling agent to nominate the pair
    pub use_candidate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingResponse {
    pub transaction_id: [u8; TRANSACTION_ID_LEN],
    pub success: bool,
    /// Source address the request was seen from
    pub mapped_address: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindingMessage {
    Request(BindingRequest),
    Response(BindingResponse),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingCodecError {
    #[error("not a binding datagram")]
    NotBinding,
    #[error("binding codec error: {0}")]
    Codec(String),
}

impl BindingRequest {
    pub fn new(priority: u32, use_candidate: bool) -> Self {
        Self {
            transaction_id: generate_transaction_id(),
            priority,
            use_candidate,
        }
    }
}

impl BindingResponse {
    pub fn success(transaction_id: [u8; TRANSACTION_ID_LEN], mapped_address: SocketAddr) -> Self {
        Self {
            transaction_id,
            success: true,
            mapped_address: Some(mapped_address),
        }
    }
}

/// Random transaction id; falls back to clock and pid if the system RNG fails
pub fn generate_transaction_id() -> [u8; TRANSACTION_ID_LEN] {
    let mut id = [0u8; TRANSACTION_ID_LEN];
    if SystemRandom::new().fill(&mut id).is_ok() {
        return id;
    }

    log::warn!("System RNG unavailable, using clock-based transaction id");
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    id[0..8].copy_from_slice(&nanos.to_le_bytes());
    id[8..12].copy_from_slice(&std::process::id().to_le_bytes());
    id
}

pub fn encode_binding(msg: &BindingMessage) -> Result<Vec<u8>, BindingCodecError> {
    let body = bincode::serialize(msg).map_err(|e| BindingCodecError::Codec(e.to_string()))?;
    let mut buf = Vec::with_capacity(body.len() + 1);
    buf.push(BINDING_TAG);
    buf.extend_from_slice(&body);
    Ok(buf)
}

pub fn decode_binding(data: &[u8]) -> Result<BindingMessage, BindingCodecError> {
    match data.split_first() {
        Some((&BINDING_TAG, body)) => {
            bincode::deserialize(body).map_err(|e| BindingCodecError::Codec(e.to_string()))
        }
        _ => Err(BindingCodecError::NotBinding),
    }
}

// ============================================================================
// Candidate Pairs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Frozen,
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub local: Candidate,
    pub remote: Candidate,
    /// Higher is checked first
    pub priority: u64,
    /// Pairs sharing a foundation are unfrozen together
    pub foundation: String,
    pub state: CheckState,
    /// Sends of the current transaction
    pub transmit_count: u32,
    pub first_sent: Option<Instant>,
    pub last_sent: Option<Instant>,
    pub transaction_id: Option<[u8; TRANSACTION_ID_LEN]>,
    pub nominated: bool,
}

impl CandidatePair {
    pub fn new(local: Candidate, remote: Candidate, is_controlling: bool) -> Self {
        let priority = calculate_pair_priority(local.priority, remote.priority, is_controlling);
        let foundation = format!("{}:{}", local.foundation, remote.foundation);

        Self {
            local,
            remote,
            priority,
            foundation,
            state: CheckState::Frozen,
            transmit_count: 0,
            first_sent: None,
            last_sent: None,
            transaction_id: None,
            nominated: false,
        }
    }

    /// Retransmit timeout after the current number of sends
    pub fn current_rto(&self) -> Duration {
        let multiplier = 1u32 << self.transmit_count.min(4);
        (INITIAL_RTO * multiplier).min(MAX_RTO)
    }

    fn rto_elapsed(&self, now: Instant) -> bool {
        match self.last_sent {
            Some(sent) => now.saturating_duration_since(sent) >= self.current_rto(),
            None => true,
        }
    }

    pub fn needs_retransmit(&self, now: Instant) -> bool {
        self.state == CheckState::InProgress
            && self.transmit_count < MAX_TRANSMITS
            && self.rto_elapsed(now)
    }

    /// Out of sends with the last one unanswered, or past the check timeout
    pub fn is_timed_out(&self, now: Instant) -> bool {
        if self.state != CheckState::InProgress {
            return false;
        }
        let exhausted = self.transmit_count >= MAX_TRANSMITS && self.rto_elapsed(now);
        let expired = self
            .first_sent
            .map(|first| now.saturating_duration_since(first) >= CHECK_TIMEOUT)
            .unwrap_or(false);
        exhausted || expired
    }

    /// Begin a new transaction on this pair
    pub fn start_check(&mut self, now: Instant) -> BindingRequest {
        let own_prflx_priority = Candidate::peer_reflexive(self.local.address).priority;
        let request = BindingRequest::new(own_prflx_priority, self.nominated);
        self.transaction_id = Some(request.transaction_id);
        self.state = CheckState::InProgress;
        self.transmit_count = 1;
        self.first_sent = Some(now);
        self.last_sent = Some(now);
        request
    }

    fn retransmit(&mut self, now: Instant) -> Option<BindingRequest> {
        let transaction_id = self.transaction_id?;
        self.transmit_count += 1;
        self.last_sent = Some(now);
        Some(BindingRequest {
            transaction_id,
            priority: Candidate::peer_reflexive(self.local.address).priority,
            use_candidate: self.nominated,
        })
    }

    /// Apply a response; false when the transaction does not belong to this pair
    pub fn handle_response(&mut self, response: &BindingResponse) -> bool {
        if self.state != CheckState::InProgress || self.transaction_id != Some(response.transaction_id)
        {
            return false;
        }

        self.state = if response.success {
            CheckState::Succeeded
        } else {
            CheckState::Failed
        };
        true
    }
}

/// RFC 8445 Section 6.1.2.3; G is the controlling side's candidate priority
pub fn calculate_pair_priority(
    local_priority: u32,
    remote_priority: u32,
    is_controlling: bool,
) -> u64 {
    let (g, d) = if is_controlling {
        (local_priority as u64, remote_priority as u64)
    } else {
        (remote_priority as u64, local_priority as u64)
    };

    let tie_breaker = if g > d { 1u64 } else { 0u64 };
    (1u64 << 32) * g.min(d) + 2 * g.max(d) + tie_breaker
}

// ============================================================================
// Check List
// ============================================================================

/// Candidate pairs of one agent and the schedule of their checks.
///
/// Every local candidate shares the agent's single socket, so pairs are
/// pruned to one per remote address (the highest priority local wins).
#[derive(Debug)]
pub struct CheckList {
    pairs: Vec<CandidatePair>,
    start_time: Option<Instant>,
    is_controlling: bool,
    last_check_time: Option<Instant>,
}

impl CheckList {
    pub fn new(is_controlling: bool) -> Self {
        Self {
            pairs: Vec::new(),
            start_time: None,
            is_controlling,
            last_check_time: None,
        }
    }

    pub fn is_controlling(&self) -> bool {
        self.is_controlling
    }

    /// Pair every local with every remote of the same address family.
    /// Returns the number of new pairs.
    pub fn add_pairs(&mut self, local_candidates: &[Candidate], remote_candidates: &[Candidate]) -> usize {
        let mut added = 0;

        for remote in remote_candidates {
            for local in local_candidates {
                if local.address.is_ipv4() != remote.address.is_ipv4() {
                    continue;
                }

                let pair = CandidatePair::new(local.clone(), remote.clone(), self.is_controlling);
                match self.find_by_remote(remote.address) {
                    Some(idx) => {
                        let existing = &mut self.pairs[idx];
                        let untouched =
                            matches!(existing.state, CheckState::Frozen | CheckState::Waiting);
                        if untouched && pair.priority > existing.priority {
                            existing.local = pair.local;
                            existing.remote = pair.remote;
                            existing.priority = pair.priority;
                            existing.foundation = pair.foundation;
                        }
                    }
                    None => {
                        self.pairs.push(pair);
                        added += 1;
                    }
                }
            }
        }

        self.pairs.sort_by(|a, b| b.priority.cmp(&a.priority));
        self.unfreeze_initial_pairs();
        added
    }

    /// Unfreeze the first pair of each foundation that has nothing active
    fn unfreeze_initial_pairs(&mut self) {
        let mut active: HashSet<String> = self
            .pairs
            .iter()
            .filter(|p| p.state != CheckState::Frozen)
            .map(|p| p.foundation.clone())
            .collect();

        for pair in &mut self.pairs {
            if pair.state == CheckState::Frozen && active.insert(pair.foundation.clone()) {
                pair.state = CheckState::Waiting;
            }
        }
    }

    /// Add a pair for a remote learned from an incoming check and schedule it.
    /// Returns the pair's index, existing or new.
    pub fn add_peer_reflexive(&mut self, local: Candidate, remote: Candidate) -> Option<usize> {
        let addr = remote.address;
        if self.find_by_remote(addr).is_none() {
            let mut pair = CandidatePair::new(local, remote, self.is_controlling);
            pair.state = CheckState::Waiting;
            self.pairs.push(pair);
            self.pairs.sort_by(|a, b| b.priority.cmp(&a.priority));
        }
        self.find_by_remote(addr)
    }

    pub fn find_by_remote(&self, addr: SocketAddr) -> Option<usize> {
        self.pairs.iter().position(|p| p.remote.address == addr)
    }

    /// Schedule a triggered check on a pair that is idle or failed
    pub fn trigger(&mut self, index: usize) {
        if let Some(pair) = self.pairs.get_mut(index) {
            if matches!(pair.state, CheckState::Frozen | CheckState::Failed) {
                pair.state = CheckState::Waiting;
                pair.transmit_count = 0;
                pair.transaction_id = None;
            }
        }
    }

    /// Start the check clock. Later calls keep the original start.
    pub fn start(&mut self, now: Instant) {
        if self.start_time.is_none() {
            self.start_time = Some(now);
        }
    }

    pub fn is_started(&self) -> bool {
        self.start_time.is_some()
    }

    /// Next binding request to send, respecting pacing.
    ///
    /// Retransmissions go first, then the highest priority waiting pair.
    /// When nothing is waiting or in flight, the best frozen pair is thawed.
    pub fn next_request(&mut self, now: Instant) -> Option<(usize, BindingRequest, SocketAddr)> {
        self.start_time?;

        if let Some(last) = self.last_check_time {
            if now.saturating_duration_since(last) < PACE_INTERVAL {
                return None;
            }
        }

        for (idx, pair) in self.pairs.iter_mut().enumerate() {
            if pair.needs_retransmit(now) {
                if let Some(request) = pair.retransmit(now) {
                    self.last_check_time = Some(now);
                    return Some((idx, request, pair.remote.address));
                }
            }
        }

        let mut next = self.pairs.iter().position(|p| p.state == CheckState::Waiting);
        if next.is_none() && !self.pairs.iter().any(|p| p.state == CheckState::InProgress) {
            next = self.pairs.iter().position(|p| p.state == CheckState::Frozen);
        }

        let idx = next?;
        let request = self.pairs[idx].start_check(now);
        self.last_check_time = Some(now);
        Some((idx, request, self.pairs[idx].remote.address))
    }

    /// Apply a response. Returns the index of the matching pair.
    pub fn handle_response(&mut self, response: &BindingResponse) -> Option<usize> {
        let idx = self.pairs.iter_mut().position(|p| p.handle_response(response))?;

        if self.pairs[idx].state == CheckState::Succeeded {
            let foundation = self.pairs[idx].foundation.clone();
            for pair in &mut self.pairs {
                if pair.state == CheckState::Frozen && pair.foundation == foundation {
                    pair.state = CheckState::Waiting;
                }
            }
        }

        Some(idx)
    }

    /// Fail every in-flight check that ran out of time. Returns how many failed.
    /// A nomination that times out is withdrawn along with the pair.
    pub fn handle_timeouts(&mut self, now: Instant) -> usize {
        let mut failed = 0;
        for pair in &mut self.pairs {
            if pair.is_timed_out(now) {
                log::debug!("Check to {} timed out", pair.remote.address);
                pair.state = CheckState::Failed;
                pair.nominated = false;
                failed += 1;
            }
        }
        failed
    }

    pub fn best_succeeded(&self) -> Option<usize> {
        self.pairs
            .iter()
            .enumerate()
            .filter(|(_, p)| p.state == CheckState::Succeeded)
            .max_by_key(|(_, p)| p.priority)
            .map(|(idx, _)| idx)
    }

    /// Succeeded pair carrying a nomination
    pub fn nominated_pair(&self) -> Option<&CandidatePair> {
        self.pairs
            .iter()
            .find(|p| p.nominated && p.state == CheckState::Succeeded)
    }

    /// A nominating check is still in flight
    pub fn nomination_pending(&self) -> bool {
        self.pairs
            .iter()
            .any(|p| p.nominated && p.state == CheckState::InProgress)
    }

    /// Every pair reached a final state (false while empty)
    pub fn is_complete(&self) -> bool {
        !self.pairs.is_empty()
            && self
                .pairs
                .iter()
                .all(|p| matches!(p.state, CheckState::Succeeded | CheckState::Failed))
    }

    pub fn has_succeeded(&self) -> bool {
        self.pairs.iter().any(|p| p.state == CheckState::Succeeded)
    }

    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    pub fn pairs_by_state(&self, state: CheckState) -> impl Iterator<Item = &CandidatePair> {
        self.pairs.iter().filter(move |p| p.state == state)
    }

    pub fn get_pair(&self, index: usize) -> Option<&CandidatePair> {
        self.pairs.get(index)
    }

    /// Controlling side: re-check a succeeded pair with the nomination flag set
    pub fn nominate(&mut self, index: usize, now: Instant) -> Option<(BindingRequest, SocketAddr)> {
        let pair = self.pairs.get_mut(index)?;
        if pair.state != CheckState::Succeeded {
            return None;
        }
        pair.nominated = true;
        let request = pair.start_check(now);
        Some((request, pair.remote.address))
    }

    /// Controlled side: the remote nominated this pair
    pub fn mark_nominated(&mut self, index: usize) {
        if let Some(pair) = self.pairs.get_mut(index) {
            pair.nominated = true;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
