//! Per-peer negotiation agent
//!
//! One agent runs the full connection attempt to one remote peer:
//! 1. Gather local candidates (host addresses, STUN mapping)
//! 2. Exchange descriptions and candidates through the signaling channel
//! 3. Run paced connectivity checks on candidate pairs
//! 4. Nominate a pair and keep it alive
//!
//! The agent does no I/O of its own. Datagrams and signaling messages it
//! wants sent are queued and drained by the pool once its locks are released.
//!
//! # State Machine
//!
//! ```text
//! New → Checking → Connected → Completed
//!          ↓           ↓           ↓
//!        Failed    Disconnected ◄──┘   (3 missed keepalives)
//! ```
//!
//! A Connected agent whose pairs have all failed also ends in Failed.
//! Failed and Disconnected agents are replaced by the pool, never revived.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::candidate::{gather_host_candidates, gather_reflexive_candidate, Candidate, CandidateType};
use super::connectivity::{
    decode_binding, encode_binding, BindingMessage, BindingRequest, BindingResponse, CheckList,
    CheckState, BINDING_TAG, TRANSACTION_ID_LEN,
};
use super::keepalive::{
    decode_keepalive, encode_keepalive_response, Keepalive, KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE,
};
use super::stun;
use crate::peer_id::PeerId;
use crate::signaling::{is_agent_ping, MessageKind, SignalMessage};

// ============================================================================
// Constants
// ============================================================================

/// An agent that has not reached Connected this long after starting fails
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Give up on the STUN server after this long and finish gathering without it
pub const STUN_TIMEOUT: Duration = Duration::from_millis(1500);

/// Interval between STUN request retransmissions
const STUN_RETRANSMIT: Duration = Duration::from_millis(500);

/// Controlling side waits this long after the first success before nominating
pub const NOMINATION_DELAY: Duration = Duration::from_millis(100);

/// Leading byte of a game data datagram
pub const DATA_TAG: u8 = 0xD0;

/// Largest game payload that fits one UDP datagram after the tag
pub const MAX_PAYLOAD: usize = 65_507 - 1;

// ============================================================================
// Agent State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
}

impl AgentState {
    /// Whether game data can flow
    pub fn is_usable(&self) -> bool {
        matches!(self, AgentState::Connected | AgentState::Completed)
    }

    /// Failed and Disconnected agents stay that way until replaced
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentState::Failed | AgentState::Disconnected)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How the selected path reaches the peer. Display only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    Unknown,
    Direct,
    Relayed,
    /// Peer reached on a private or shared range (LAN or overlay network)
    OtherLocalNetwork,
}

// ============================================================================
// Signaling Payloads
// ============================================================================

/// Sent once when negotiation starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDescription {
    pub session_id: u64,
    pub candidates: Vec<Candidate>,
}

/// One trickled candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub session_id: u64,
    pub candidate: Candidate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatheringDone {
    pub session_id: u64,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("malformed {kind} payload: {reason}")]
    Malformed { kind: MessageKind, reason: String },
    #[error("{0} is not a negotiation message")]
    NotNegotiation(MessageKind),
    #[error("payload for stale session {0}")]
    StaleSession(u64),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("no route to {0}")]
    NoRoute(PeerId),
    #[error("payload of {0} bytes exceeds datagram size")]
    TooLarge(usize),
    #[error("send failed: {0}")]
    Io(#[from] io::Error),
}

// ============================================================================
// Datagram Classification
// ============================================================================

/// Kinds of datagram seen on an agent socket
#[derive(Debug, PartialEq, Eq)]
pub enum Datagram<'a> {
    Stun,
    Binding,
    Keepalive { is_response: bool, sequence: u32 },
    Data(&'a [u8]),
    Unknown,
}

pub fn classify_datagram(data: &[u8]) -> Datagram<'_> {
    if stun::is_stun(data) {
        return Datagram::Stun;
    }
    match data.first() {
        Some(&BINDING_TAG) => Datagram::Binding,
        Some(&KEEPALIVE_REQUEST) | Some(&KEEPALIVE_RESPONSE) => match decode_keepalive(data) {
            Some((is_response, sequence)) => Datagram::Keepalive {
                is_response,
                sequence,
            },
            None => Datagram::Unknown,
        },
        Some(&DATA_TAG) => Datagram::Data(&data[1..]),
        _ => Datagram::Unknown,
    }
}

fn generate_session_id() -> u64 {
    let mut bytes = [0u8; 8];
    if SystemRandom::new().fill(&mut bytes).is_err() {
        log::warn!("System RNG unavailable, using clock-based session id");
        return std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
    }
    u64::from_be_bytes(bytes)
}

// ============================================================================
// Agent
// ============================================================================

#[derive(Debug)]
struct StunQuery {
    server: SocketAddr,
    transaction_id: [u8; TRANSACTION_ID_LEN],
    request: Vec<u8>,
    started: Instant,
    last_sent: Instant,
}

/// Negotiation state for one remote peer
#[derive(Debug)]
pub struct Agent {
    peer: PeerId,
    state: AgentState,
    connection_kind: ConnectionKind,
    is_controlling: bool,
    session_id: u64,
    remote_session: Option<u64>,
    local_candidates: Vec<Candidate>,
    remote_candidates: Vec<Candidate>,
    check_list: CheckList,
    local_gathering_done: bool,
    remote_gathering_done: bool,
    stun: Option<StunQuery>,
    started_at: Option<Instant>,
    first_success: Option<Instant>,
    nomination_sent: bool,
    selected: Option<SocketAddr>,
    keepalive: Option<Keepalive>,
    /// Last signaling or game traffic from the peer
    last_activity: Instant,
    outgoing_datagrams: VecDeque<(SocketAddr, Vec<u8>)>,
    outgoing_signals: Vec<SignalMessage>,
}

impl Agent {
    pub fn new(peer: PeerId, is_controlling: bool, now: Instant) -> Self {
        Self {
            peer,
            state: AgentState::New,
            connection_kind: ConnectionKind::Unknown,
            is_controlling,
            session_id: generate_session_id(),
            remote_session: None,
            local_candidates: Vec::new(),
            remote_candidates: Vec::new(),
            check_list: CheckList::new(is_controlling),
            local_gathering_done: false,
            remote_gathering_done: false,
            stun: None,
            started_at: None,
            first_success: None,
            nomination_sent: false,
            selected: None,
            keepalive: None,
            last_activity: now,
            outgoing_datagrams: VecDeque::new(),
            outgoing_signals: Vec::new(),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn connection_kind(&self) -> ConnectionKind {
        self.connection_kind
    }

    pub fn status(&self) -> (AgentState, ConnectionKind) {
        (self.state, self.connection_kind)
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn remote_session(&self) -> Option<u64> {
        self.remote_session
    }

    pub fn is_controlling(&self) -> bool {
        self.is_controlling
    }

    pub fn selected_address(&self) -> Option<SocketAddr> {
        self.selected
    }

    pub fn local_candidates(&self) -> &[Candidate] {
        &self.local_candidates
    }

    pub fn remote_candidates(&self) -> &[Candidate] {
        &self.remote_candidates
    }

    /// Role can only change before negotiation starts
    pub fn set_controlling(&mut self, is_controlling: bool) {
        if self.state == AgentState::New && self.is_controlling != is_controlling {
            self.is_controlling = is_controlling;
            self.check_list = CheckList::new(is_controlling);
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    // ------------------------------------------------------------------------
    // Gathering
    // ------------------------------------------------------------------------

    /// Begin negotiating: gather host candidates, query STUN and publish the
    /// local description. No-op unless the agent is New.
    pub fn start(
        &mut self,
        now: Instant,
        local_addrs: &[SocketAddr],
        include_loopback: bool,
        stun_server: Option<SocketAddr>,
    ) {
        if self.state != AgentState::New {
            return;
        }

        self.state = AgentState::Checking;
        self.started_at = Some(now);
        self.local_candidates = gather_host_candidates(local_addrs, include_loopback);
        self.check_list.start(now);

        log::info!(
            "Agent {} starting negotiation (session {:016x}, {}, {} host candidates)",
            self.peer,
            self.session_id,
            if self.is_controlling { "controlling" } else { "controlled" },
            self.local_candidates.len()
        );

        self.push_signal(
            MessageKind::AgentLocalDescription,
            &LocalDescription {
                session_id: self.session_id,
                candidates: self.local_candidates.clone(),
            },
        );

        match stun_server {
            Some(server) => {
                let (transaction_id, request) = stun::binding_request();
                self.outgoing_datagrams.push_back((server, request.clone()));
                self.stun = Some(StunQuery {
                    server,
                    transaction_id,
                    request,
                    started: now,
                    last_sent: now,
                });
            }
            None => self.finish_gathering(),
        }

        let remote = self.remote_candidates.clone();
        self.check_list.add_pairs(&self.local_candidates, &remote);
    }

    fn finish_gathering(&mut self) {
        if self.local_gathering_done {
            return;
        }
        self.local_gathering_done = true;
        self.stun = None;
        self.push_signal(
            MessageKind::AgentGatheringDone,
            &GatheringDone {
                session_id: self.session_id,
            },
        );
    }

    fn handle_stun(&mut self, data: &[u8]) {
        let query = match &self.stun {
            Some(query) => query,
            None => return,
        };

        match stun::parse_binding_response(data, &query.transaction_id) {
            Ok(mapped) => {
                let base = self
                    .local_candidates
                    .first()
                    .map(|c| c.address)
                    .unwrap_or_else(|| SocketAddr::new([0, 0, 0, 0].into(), mapped.port()));
                let no_nat = self.local_candidates.iter().any(|c| c.address == mapped);

                log::debug!("Agent {} STUN mapping {}", self.peer, mapped);

                if !no_nat {
                    if let Some(srflx) = gather_reflexive_candidate(mapped, base) {
                        self.local_candidates.push(srflx.clone());
                        let remote = self.remote_candidates.clone();
                        self.check_list.add_pairs(std::slice::from_ref(&srflx), &remote);
                        self.push_signal(
                            MessageKind::AgentCandidate,
                            &CandidatePayload {
                                session_id: self.session_id,
                                candidate: srflx,
                            },
                        );
                    }
                }
                self.finish_gathering();
            }
            Err(e) => log::debug!("Agent {} ignoring STUN datagram: {}", self.peer, e),
        }
    }

    // ------------------------------------------------------------------------
    // Signaling
    // ------------------------------------------------------------------------

    /// Whether an inbound description should replace this agent with a
    /// fresh one. Agents still negotiating adopt the new session in place.
    pub fn should_replace(&self, description: &LocalDescription) -> bool {
        match self.state {
            AgentState::New | AgentState::Checking => false,
            AgentState::Failed | AgentState::Disconnected => true,
            AgentState::Connected | AgentState::Completed => self
                .remote_session
                .map_or(false, |known| known != description.session_id),
        }
    }

    /// Apply one inbound negotiation message
    pub fn apply_signal(
        &mut self,
        kind: MessageKind,
        data: &str,
        now: Instant,
    ) -> Result<(), NegotiationError> {
        self.touch(now);

        match kind {
            MessageKind::AgentLocalDescription => {
                let description: LocalDescription = parse_payload(kind, data)?;
                if self.remote_session != Some(description.session_id) {
                    log::debug!(
                        "Agent {} remote session {:016x}",
                        self.peer,
                        description.session_id
                    );
                    self.remote_session = Some(description.session_id);
                    self.remote_gathering_done = false;
                }
                for candidate in description.candidates {
                    self.add_remote_candidate(candidate);
                }
            }
            MessageKind::AgentCandidate => {
                let payload: CandidatePayload = parse_payload(kind, data)?;
                self.check_session(payload.session_id)?;
                self.add_remote_candidate(payload.candidate);
            }
            MessageKind::AgentGatheringDone if is_agent_ping(kind, data) => {}
            MessageKind::AgentGatheringDone => {
                let payload: GatheringDone = parse_payload(kind, data)?;
                self.check_session(payload.session_id)?;
                self.remote_gathering_done = true;
            }
            other => return Err(NegotiationError::NotNegotiation(other)),
        }

        self.update_state(now);
        Ok(())
    }

    fn check_session(&mut self, session_id: u64) -> Result<(), NegotiationError> {
        match self.remote_session {
            Some(known) if known != session_id => Err(NegotiationError::StaleSession(session_id)),
            Some(_) => Ok(()),
            None => {
                self.remote_session = Some(session_id);
                Ok(())
            }
        }
    }

    fn add_remote_candidate(&mut self, candidate: Candidate) {
        if self.remote_candidates.iter().any(|c| c.address == candidate.address) {
            return;
        }
        log::debug!("Agent {} remote candidate {}", self.peer, candidate);
        self.remote_candidates.push(candidate.clone());
        if self.state != AgentState::New {
            self.check_list
                .add_pairs(&self.local_candidates, std::slice::from_ref(&candidate));
        }
    }

    fn push_signal<T: Serialize>(&mut self, kind: MessageKind, payload: &T) {
        match serde_json::to_string(payload) {
            Ok(data) => self
                .outgoing_signals
                .push(SignalMessage::new(self.peer, kind, data)),
            Err(e) => log::error!("Agent {} failed to encode {}: {}", self.peer, kind, e),
        }
    }

    // ------------------------------------------------------------------------
    // Datagrams
    // ------------------------------------------------------------------------

    /// Handle one datagram received on the agent's socket. Returns the
    /// payload when it carried game data.
    pub fn on_datagram(&mut self, from: SocketAddr, data: &[u8], now: Instant) -> Option<Vec<u8>> {
        let payload = match classify_datagram(data) {
            Datagram::Stun => {
                self.handle_stun(data);
                None
            }
            Datagram::Binding => {
                match decode_binding(data) {
                    Ok(BindingMessage::Request(request)) => self.handle_binding_request(from, request),
                    Ok(BindingMessage::Response(response)) => {
                        if self.check_list.handle_response(&response).is_none() {
                            log::trace!("Agent {} unmatched binding response", self.peer);
                        }
                    }
                    Err(e) => log::debug!("Agent {} bad binding from {}: {}", self.peer, from, e),
                }
                None
            }
            Datagram::Keepalive { is_response, sequence } => {
                if is_response {
                    if let Some(keepalive) = self.keepalive.as_mut() {
                        keepalive.record_response(sequence, now);
                    }
                } else {
                    self.outgoing_datagrams
                        .push_back((from, encode_keepalive_response(sequence).to_vec()));
                }
                None
            }
            Datagram::Data(payload) => {
                if !self.state.is_usable() {
                    log::trace!("Agent {} dropping data before connect", self.peer);
                    None
                } else if !self.is_verified_path(from) {
                    log::debug!("Agent {} dropping data from unverified {}", self.peer, from);
                    None
                } else {
                    self.touch(now);
                    Some(payload.to_vec())
                }
            }
            Datagram::Unknown => {
                log::trace!("Agent {} unknown datagram from {}", self.peer, from);
                None
            }
        };

        self.update_state(now);
        payload
    }

    /// The selected address, or the remote end of a pair that passed its check
    fn is_verified_path(&self, from: SocketAddr) -> bool {
        self.selected == Some(from)
            || self
                .check_list
                .pairs_by_state(CheckState::Succeeded)
                .any(|pair| pair.remote.address == from)
    }

    fn handle_binding_request(&mut self, from: SocketAddr, request: BindingRequest) {
        let response = BindingMessage::Response(BindingResponse::success(request.transaction_id, from));
        match encode_binding(&response) {
            Ok(encoded) => self.outgoing_datagrams.push_back((from, encoded)),
            Err(e) => {
                log::error!("Agent {} failed to encode binding response: {}", self.peer, e);
                return;
            }
        }

        if self.state == AgentState::New || self.state.is_terminal() {
            return;
        }

        let index = match self.check_list.find_by_remote(from) {
            Some(index) => Some(index),
            None => {
                let local = match self.local_candidates.iter().find(|c| c.address.is_ipv4() == from.is_ipv4()) {
                    Some(local) => local.clone(),
                    None => return,
                };
                let mut remote = Candidate::peer_reflexive(from);
                remote.priority = request.priority;
                log::debug!("Agent {} peer reflexive candidate {}", self.peer, from);
                self.remote_candidates.push(remote.clone());
                self.check_list.add_peer_reflexive(local, remote)
            }
        };

        if let Some(index) = index {
            self.check_list.trigger(index);
            if request.use_candidate && !self.is_controlling {
                self.check_list.mark_nominated(index);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    /// Drive retransmissions, checks, nomination and keepalives
    pub fn tick(&mut self, now: Instant) {
        if let Some(query) = self.stun.as_mut() {
            if now.saturating_duration_since(query.started) >= STUN_TIMEOUT {
                log::debug!("Agent {} STUN query to {} timed out", self.peer, query.server);
                self.finish_gathering();
            } else if now.saturating_duration_since(query.last_sent) >= STUN_RETRANSMIT {
                query.last_sent = now;
                self.outgoing_datagrams
                    .push_back((query.server, query.request.clone()));
            }
        }

        if matches!(self.state, AgentState::Checking | AgentState::Connected | AgentState::Completed) {
            self.check_list.handle_timeouts(now);
            if let Some((_, request, addr)) = self.check_list.next_request(now) {
                self.queue_binding(addr, request);
            }
        }

        if let Some(keepalive) = self.keepalive.as_mut() {
            if keepalive.check_timeout(now) {
                log::warn!(
                    "Agent {} lost path to {} (keepalives unanswered)",
                    self.peer,
                    keepalive.remote_addr()
                );
                self.state = AgentState::Disconnected;
                self.selected = None;
            } else if let Some((addr, message)) = keepalive.poll(now) {
                self.outgoing_datagrams.push_back((addr, message.to_vec()));
            }
        }

        self.update_state(now);
    }

    fn queue_binding(&mut self, addr: SocketAddr, request: BindingRequest) {
        match encode_binding(&BindingMessage::Request(request)) {
            Ok(encoded) => self.outgoing_datagrams.push_back((addr, encoded)),
            Err(e) => log::error!("Agent {} failed to encode binding request: {}", self.peer, e),
        }
    }

    fn update_state(&mut self, now: Instant) {
        match self.state {
            AgentState::Checking => {
                if self.check_list.has_succeeded() {
                    self.first_success = Some(now);
                    self.state = AgentState::Connected;
                    self.select_best(now);
                    log::info!(
                        "Agent {} connected via {:?} ({:?})",
                        self.peer,
                        self.selected,
                        self.connection_kind
                    );
                } else if self.negotiation_exhausted(now) {
                    log::warn!("Agent {} negotiation failed", self.peer);
                    self.state = AgentState::Failed;
                    self.stun = None;
                    return;
                }
            }
            AgentState::Connected => {
                if !self.check_list.has_succeeded() && self.check_list.is_complete() {
                    log::warn!("Agent {} lost every working pair", self.peer);
                    self.state = AgentState::Failed;
                    self.selected = None;
                    self.keepalive = None;
                    return;
                }
                self.select_best(now);
            }
            _ => {}
        }

        if self.state == AgentState::Connected {
            let nomination_lost = self.nomination_sent
                && !self.check_list.nomination_pending()
                && self.check_list.nominated_pair().is_none();
            if nomination_lost {
                log::debug!("Agent {} nomination went unanswered, retrying", self.peer);
                self.nomination_sent = false;
            }

            if self.is_controlling && !self.nomination_sent {
                let delay_passed = self
                    .first_success
                    .map(|t| now.saturating_duration_since(t) >= NOMINATION_DELAY)
                    .unwrap_or(false);
                if delay_passed || self.check_list.is_complete() {
                    if let Some(best) = self.check_list.best_succeeded() {
                        if let Some((request, addr)) = self.check_list.nominate(best, now) {
                            log::debug!("Agent {} nominating {}", self.peer, addr);
                            self.nomination_sent = true;
                            self.queue_binding(addr, request);
                        }
                    }
                }
            }

            if let Some(pair) = self.check_list.nominated_pair() {
                let addr = pair.remote.address;
                self.state = AgentState::Completed;
                self.set_selected(addr, now);
                log::info!("Agent {} completed on {}", self.peer, addr);
            }
        }
    }

    /// Neither side can produce a working pair any more
    fn negotiation_exhausted(&self, now: Instant) -> bool {
        let timed_out = self
            .started_at
            .map(|t| now.saturating_duration_since(t) >= NEGOTIATION_TIMEOUT)
            .unwrap_or(false);
        if timed_out {
            return true;
        }

        let gathering_done = self.local_gathering_done && self.remote_gathering_done;
        let nothing_left = self.check_list.pair_count() == 0 || self.check_list.is_complete();
        gathering_done && nothing_left
    }

    fn select_best(&mut self, now: Instant) {
        if let Some(index) = self.check_list.best_succeeded() {
            if let Some(addr) = self.check_list.get_pair(index).map(|p| p.remote.address) {
                self.set_selected(addr, now);
            }
        }
    }

    fn set_selected(&mut self, addr: SocketAddr, now: Instant) {
        self.selected = Some(addr);
        self.connection_kind = self.classify_selected(addr);
        match self.keepalive.as_mut() {
            Some(keepalive) => keepalive.set_remote(addr),
            None => self.keepalive = Some(Keepalive::new(addr, now)),
        }
    }

    fn classify_selected(&self, addr: SocketAddr) -> ConnectionKind {
        let pair = self
            .check_list
            .pairs_by_state(CheckState::Succeeded)
            .find(|p| p.remote.address == addr);
        let pair = match pair {
            Some(pair) => pair,
            None => return ConnectionKind::Direct,
        };

        if pair.local.is_relay() || pair.remote.is_relay() {
            ConnectionKind::Relayed
        } else if pair.remote.candidate_type == CandidateType::Host && pair.remote.is_private_network() {
            ConnectionKind::OtherLocalNetwork
        } else {
            ConnectionKind::Direct
        }
    }

    // ------------------------------------------------------------------------
    // Data
    // ------------------------------------------------------------------------

    /// Frame a game payload for the selected path
    pub fn prepare_send(&self, payload: &[u8]) -> Result<(SocketAddr, Vec<u8>), SendError> {
        let addr = match (self.state.is_usable(), self.selected) {
            (true, Some(addr)) => addr,
            _ => return Err(SendError::NoRoute(self.peer)),
        };
        if payload.len() > MAX_PAYLOAD {
            return Err(SendError::TooLarge(payload.len()));
        }

        let mut datagram = Vec::with_capacity(payload.len() + 1);
        datagram.push(DATA_TAG);
        datagram.extend_from_slice(payload);
        Ok((addr, datagram))
    }

    pub fn take_datagrams(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.outgoing_datagrams.drain(..).collect()
    }

    pub fn take_signals(&mut self) -> Vec<SignalMessage> {
        std::mem::take(&mut self.outgoing_signals)
    }
}

fn parse_payload<T: for<'de> Deserialize<'de>>(kind: MessageKind, data: &str) -> Result<T, NegotiationError> {
    serde_json::from_str(data).map_err(|e| NegotiationError::Malformed {
        kind,
        reason: e.to_string(),
    })
}

/// Parse a local description payload without an agent
pub fn parse_description(data: &str) -> Result<LocalDescription, NegotiationError> {
    parse_payload(MessageKind::AgentLocalDescription, data)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        PeerId::from_bytes([n; 16])
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    /// Deliver every queued datagram between two agents until both are quiet
    fn pump(a: &mut Agent, a_addr: SocketAddr, b: &mut Agent, b_addr: SocketAddr, now: Instant) {
        for _ in 0..10 {
            let from_a = a.take_datagrams();
            let from_b = b.take_datagrams();
            if from_a.is_empty() && from_b.is_empty() {
                break;
            }
            for (to, data) in from_a {
                if to == b_addr {
                    b.on_datagram(a_addr, &data, now);
                }
            }
            for (to, data) in from_b {
                if to == a_addr {
                    a.on_datagram(b_addr, &data, now);
                }
            }
        }
    }

    fn exchange_signals(from: &mut Agent, to: &mut Agent, now: Instant) {
        for msg in from.take_signals() {
            to.apply_signal(msg.kind, &msg.data, now).unwrap();
        }
    }

    #[test]
    fn test_classify_datagram() {
        assert_eq!(classify_datagram(&[DATA_TAG, 1, 2]), Datagram::Data(&[1, 2]));
        assert_eq!(
            classify_datagram(&encode_keepalive_response(3)),
            Datagram::Keepalive { is_response: true, sequence: 3 }
        );
        assert_eq!(classify_datagram(&[BINDING_TAG, 0]), Datagram::Binding);
        assert_eq!(classify_datagram(&stun::binding_request().1), Datagram::Stun);
        assert_eq!(classify_datagram(&[0x42]), Datagram::Unknown);
        assert_eq!(classify_datagram(&[]), Datagram::Unknown);
    }

    #[test]
    fn test_start_publishes_description() {
        let now = Instant::now();
        let mut agent = Agent::new(peer(2), true, now);
        agent.start(now, &[addr("192.168.1.10:4000"), addr("127.0.0.1:4000")], false, None);

        assert_eq!(agent.state(), AgentState::Checking);
        let signals = agent.take_signals();
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].kind, MessageKind::AgentLocalDescription);
        assert_eq!(signals[0].peer, peer(2));
        assert_eq!(signals[1].kind, MessageKind::AgentGatheringDone);

        let description = parse_description(&signals[0].data).unwrap();
        assert_eq!(description.session_id, agent.session_id());
        assert_eq!(description.candidates.len(), 1);

        // Starting twice does nothing
        agent.start(now, &[addr("192.168.1.10:4000")], false, None);
        assert!(agent.take_signals().is_empty());
    }

    #[test]
    fn test_stun_timeout_finishes_gathering() {
        let now = Instant::now();
        let mut agent = Agent::new(peer(2), true, now);
        agent.start(now, &[addr("192.168.1.10:4000")], false, Some(addr("198.51.100.1:3478")));

        let signals = agent.take_signals();
        assert_eq!(signals.len(), 1);
        let datagrams = agent.take_datagrams();
        assert_eq!(datagrams[0].0, addr("198.51.100.1:3478"));

        agent.tick(now + STUN_RETRANSMIT);
        assert_eq!(agent.take_datagrams().len(), 1);

        agent.tick(now + STUN_TIMEOUT);
        let signals = agent.take_signals();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, MessageKind::AgentGatheringDone);
    }

    #[test]
    fn test_negotiation_timeout_fails() {
        let now = Instant::now();
        let mut agent = Agent::new(peer(2), true, now);
        agent.start(now, &[addr("192.168.1.10:4000")], false, None);

        agent.tick(now + Duration::from_secs(5));
        assert_eq!(agent.state(), AgentState::Checking);
        agent.tick(now + NEGOTIATION_TIMEOUT);
        assert_eq!(agent.state(), AgentState::Failed);
        assert!(agent.prepare_send(b"x").is_err());
    }

    #[test]
    fn test_malformed_and_stale_payloads() {
        let now = Instant::now();
        let mut agent = Agent::new(peer(2), true, now);

        assert!(matches!(
            agent.apply_signal(MessageKind::AgentCandidate, "{oops", now),
            Err(NegotiationError::Malformed { .. })
        ));

        let description = serde_json::to_string(&LocalDescription { session_id: 7, candidates: vec![] }).unwrap();
        agent.apply_signal(MessageKind::AgentLocalDescription, &description, now).unwrap();

        let stale = serde_json::to_string(&GatheringDone { session_id: 8 }).unwrap();
        assert_eq!(
            agent.apply_signal(MessageKind::AgentGatheringDone, &stale, now),
            Err(NegotiationError::StaleSession(8))
        );
        assert_eq!(
            agent.apply_signal(MessageKind::GameAd, "", now),
            Err(NegotiationError::NotNegotiation(MessageKind::GameAd))
        );
    }

    /// Bring a controlling agent to Connected against one remote host
    /// candidate by answering its first check directly
    fn connected_agent(local: SocketAddr, remote: SocketAddr, now: Instant) -> (Agent, Instant) {
        let mut agent = Agent::new(peer(2), true, now);
        agent.start(now, &[local], false, None);
        agent.take_signals();
        let description = serde_json::to_string(&LocalDescription {
            session_id: 9,
            candidates: vec![Candidate::host(remote)],
        })
        .unwrap();
        agent.apply_signal(MessageKind::AgentLocalDescription, &description, now).unwrap();
        let done = serde_json::to_string(&GatheringDone { session_id: 9 }).unwrap();
        agent.apply_signal(MessageKind::AgentGatheringDone, &done, now).unwrap();

        let t = now + Duration::from_millis(20);
        agent.tick(t);
        for (to, data) in agent.take_datagrams() {
            if let Ok(BindingMessage::Request(request)) = decode_binding(&data) {
                let response = BindingMessage::Response(BindingResponse::success(request.transaction_id, local));
                agent.on_datagram(to, &encode_binding(&response).unwrap(), t);
            }
        }
        assert_eq!(agent.state(), AgentState::Connected);
        (agent, t)
    }

    #[test]
    fn test_replacement_rule() {
        let now = Instant::now();
        let mut agent = Agent::new(peer(2), true, now);
        let description = LocalDescription { session_id: 1, candidates: vec![] };
        assert!(!agent.should_replace(&description));

        agent.start(now, &[], false, None);
        assert!(!agent.should_replace(&description));
        agent.tick(now + NEGOTIATION_TIMEOUT);
        assert_eq!(agent.state(), AgentState::Failed);
        assert!(agent.should_replace(&description));

        // A finished agent is replaced even when the peer kept its session
        let same = LocalDescription { session_id: 9, candidates: vec![] };
        let (connected, _) = connected_agent(addr("192.168.1.10:4000"), addr("192.168.1.20:5000"), now);
        assert!(!connected.should_replace(&same));
        assert!(connected.should_replace(&description));
    }

    #[test]
    fn test_ping_marker_only_refreshes() {
        let now = Instant::now();
        let mut agent = Agent::new(peer(2), false, now);
        let description = serde_json::to_string(&LocalDescription { session_id: 7, candidates: vec![] }).unwrap();
        agent.apply_signal(MessageKind::AgentLocalDescription, &description, now).unwrap();

        let later = now + Duration::from_secs(30);
        let ping = SignalMessage::agent_ping(peer(1));
        agent.apply_signal(ping.kind, &ping.data, later).unwrap();
        assert_eq!(agent.last_activity(), later);
        assert_eq!(agent.remote_session(), Some(7));
        assert_eq!(agent.state(), AgentState::New);
    }

    #[test]
    fn test_unanswered_nomination_does_not_stall() {
        let now = Instant::now();
        let local = addr("192.168.1.10:4000");
        let (mut agent, mut t) = connected_agent(local, addr("192.168.1.20:5000"), now);

        // Nomination goes out and nothing ever answers it
        t += NOMINATION_DELAY;
        agent.tick(t);
        let nominations = agent.take_datagrams();
        assert!(nominations.iter().any(|(_, data)| matches!(
            decode_binding(data),
            Ok(BindingMessage::Request(BindingRequest { use_candidate: true, .. }))
        )));

        for _ in 0..300 {
            t += Duration::from_millis(20);
            agent.tick(t);
            agent.take_datagrams();
        }

        assert_eq!(agent.state(), AgentState::Failed);
        assert_eq!(agent.selected_address(), None);
        assert!(matches!(agent.prepare_send(b"x"), Err(SendError::NoRoute(_))));
    }

    #[test]
    fn test_two_agents_connect_and_complete() {
        let now = Instant::now();
        let a_addr = addr("192.168.1.10:4000");
        let b_addr = addr("192.168.1.20:5000");

        let mut a = Agent::new(peer(2), true, now);
        let mut b = Agent::new(peer(1), false, now);

        a.start(now, &[a_addr], false, None);
        b.start(now, &[b_addr], false, None);
        exchange_signals(&mut a, &mut b, now);
        exchange_signals(&mut b, &mut a, now);

        let mut t = now;
        for _ in 0..20 {
            t += Duration::from_millis(20);
            a.tick(t);
            b.tick(t);
            pump(&mut a, a_addr, &mut b, b_addr, t);
        }

        assert_eq!(a.state(), AgentState::Completed);
        assert_eq!(b.state(), AgentState::Completed);
        assert_eq!(a.selected_address(), Some(b_addr));
        assert_eq!(a.connection_kind(), ConnectionKind::OtherLocalNetwork);

        let (to, datagram) = a.prepare_send(b"hello").unwrap();
        assert_eq!(to, b_addr);
        assert_eq!(b.on_datagram(a_addr, &datagram, t), Some(b"hello".to_vec()));

        // Same bytes from an address no check ever verified are dropped
        assert_eq!(b.on_datagram(addr("192.168.1.99:4000"), &datagram, t), None);
    }

    #[test]
    fn test_keepalive_loss_disconnects() {
        let now = Instant::now();
        let a_addr = addr("203.0.113.10:4000");
        let b_addr = addr("198.51.100.20:5000");

        let mut a = Agent::new(peer(2), true, now);
        let mut b = Agent::new(peer(1), false, now);
        a.start(now, &[a_addr], false, None);
        b.start(now, &[b_addr], false, None);
        exchange_signals(&mut a, &mut b, now);
        exchange_signals(&mut b, &mut a, now);

        let mut t = now;
        for _ in 0..20 {
            t += Duration::from_millis(20);
            a.tick(t);
            b.tick(t);
            pump(&mut a, a_addr, &mut b, b_addr, t);
        }
        assert_eq!(a.state(), AgentState::Completed);
        assert_eq!(a.connection_kind(), ConnectionKind::Direct);

        // Peer goes silent
        for _ in 0..4 {
            t += Duration::from_secs(15);
            a.tick(t);
            a.take_datagrams();
            t += Duration::from_secs(5);
            a.tick(t);
        }
        assert_eq!(a.state(), AgentState::Disconnected);
        assert!(matches!(a.prepare_send(b"x"), Err(SendError::NoRoute(_))));
    }
}
