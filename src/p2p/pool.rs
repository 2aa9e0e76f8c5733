//! Agent pool
//!
//! Owns one negotiation agent per known peer, the UDP socket each agent
//! uses, and the I/O thread that drives them all.
//!
//! ```text
//!   session ──ensure/ping/step──►┌──────────────┐──signals──► SignalSink
//!                                │  AgentPool   │
//!   game ◄──── InboundQueue ◄────│ I/O thread   │◄──► UDP sockets (mio)
//!                                └──────────────┘
//! ```
//!
//! Locking: the pool map lock is taken before any agent lock, never the
//! other way round. Signals produced by agents are sent through the sink
//! only after every lock has been released.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use super::agent::{parse_description, Agent, AgentState, ConnectionKind, SendError};
use super::candidate::enumerate_local_addresses;
use super::stun::StunResolver;
use crate::metrics::Metrics;
use crate::peer_id::PeerId;
use crate::signaling::{is_agent_ping, MessageKind, SignalMessage, SignalSink};

// ============================================================================
// Constants
// ============================================================================

/// Agents without peer activity for this long are removed (unless checking)
pub const AGENT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Period of the I/O thread's timer tick
pub const TICK_INTERVAL: Duration = Duration::from_millis(20);

/// Inbound game packets older than this are discarded unread
pub const INBOUND_STALE_AFTER: Duration = Duration::from_secs(10);

/// Queue bound; the oldest packet is evicted to make room
pub const MAX_INBOUND_PACKETS: usize = 4096;

const WAKE_TOKEN: Token = Token(0);

const RECV_BUF_LEN: usize = 65_536;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("agent socket error: {0}")]
    Socket(#[from] io::Error),
    #[error("no agent may be created for {0}")]
    InvalidPeer(PeerId),
    #[error("agent pool is shut down")]
    ShutDown,
}

// ============================================================================
// Inbound Queue
// ============================================================================

/// Game data received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GamePacket {
    pub sender: PeerId,
    pub data: Vec<u8>,
    pub received_at: Instant,
}

/// Packets waiting for the game, with a condition the game can wait on
pub struct InboundQueue {
    packets: Mutex<VecDeque<GamePacket>>,
    ready: Condvar,
    metrics: Arc<Metrics>,
}

impl InboundQueue {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            packets: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            metrics,
        }
    }

    /// Queue a packet, first discarding stale ones at the front and
    /// evicting the oldest when full
    pub fn push(&self, packet: GamePacket) {
        let mut packets = self.packets.lock();
        let now = packet.received_at;
        while packets.front().map_or(false, |oldest| self.is_stale(oldest, now)) {
            packets.pop_front();
            Metrics::inc(&self.metrics.packets_dropped_stale);
        }
        if packets.len() >= MAX_INBOUND_PACKETS {
            packets.pop_front();
            Metrics::inc(&self.metrics.packets_dropped_overflow);
        }
        packets.push_back(packet);
        drop(packets);

        Metrics::inc(&self.metrics.packets_queued);
        self.ready.notify_all();
    }

    fn is_stale(&self, packet: &GamePacket, now: Instant) -> bool {
        now.saturating_duration_since(packet.received_at) > INBOUND_STALE_AFTER
    }

    /// Oldest fresh packet; stale ones ahead of it are discarded
    pub fn pop(&self, now: Instant) -> Option<GamePacket> {
        let mut packets = self.packets.lock();
        while let Some(packet) = packets.pop_front() {
            if self.is_stale(&packet, now) {
                Metrics::inc(&self.metrics.packets_dropped_stale);
                continue;
            }
            return Some(packet);
        }
        None
    }

    /// Every fresh packet in arrival order
    pub fn drain(&self, now: Instant) -> Vec<GamePacket> {
        let mut packets = self.packets.lock();
        let mut fresh = Vec::with_capacity(packets.len());
        for packet in packets.drain(..) {
            if self.is_stale(&packet, now) {
                Metrics::inc(&self.metrics.packets_dropped_stale);
            } else {
                fresh.push(packet);
            }
        }
        fresh
    }

    /// Block until a packet is queued or `timeout` passes. True if non-empty.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut packets = self.packets.lock();
        while packets.is_empty() {
            if self.ready.wait_until(&mut packets, deadline).timed_out() {
                break;
            }
        }
        !packets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Agent Handle
// ============================================================================

struct AgentSlot {
    agent: Agent,
    socket: UdpSocket,
}

/// A pooled agent together with its socket
pub struct AgentHandle {
    peer: PeerId,
    token: Token,
    local_port: u16,
    slot: Mutex<AgentSlot>,
}

impl AgentHandle {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn state(&self) -> AgentState {
        self.slot.lock().agent.state()
    }

    pub fn status(&self) -> (AgentState, ConnectionKind) {
        self.slot.lock().agent.status()
    }

    /// Run `f` with the agent locked
    pub fn with_agent<R>(&self, f: impl FnOnce(&mut Agent) -> R) -> R {
        f(&mut self.slot.lock().agent)
    }
}

/// Send queued datagrams and hand back queued signals
fn flush(slot: &mut AgentSlot) -> Vec<SignalMessage> {
    for (addr, datagram) in slot.agent.take_datagrams() {
        match slot.socket.send_to(&datagram, addr) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::trace!("Socket busy, dropped datagram to {}", addr);
            }
            Err(e) => log::debug!("Datagram to {} failed: {}", addr, e),
        }
    }
    slot.agent.take_signals()
}

// ============================================================================
// Agent Pool
// ============================================================================

struct PoolInner {
    agents: HashMap<PeerId, Arc<AgentHandle>>,
    tokens: HashMap<Token, PeerId>,
    next_token: usize,
    local_id: Option<PeerId>,
}

/// Negotiation settings shared by every agent
#[derive(Debug, Clone, Default)]
pub struct PoolOptions {
    pub include_loopback: bool,
    /// STUN server as host:port
    pub stun_server: Option<String>,
}

pub struct AgentPool {
    inner: Mutex<PoolInner>,
    sink: Arc<dyn SignalSink>,
    options: PoolOptions,
    stun: Option<StunResolver>,
    registry: Registry,
    waker: Waker,
    poll: Mutex<Option<Poll>>,
    io_thread: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    inbound: Arc<InboundQueue>,
    metrics: Arc<Metrics>,
}

impl AgentPool {
    pub fn new(
        options: PoolOptions,
        sink: Arc<dyn SignalSink>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, PoolError> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

        // Resolution starts now so the first agents can use it
        let stun = options.stun_server.as_deref().map(StunResolver::new);
        if let Some(resolver) = &stun {
            resolver.address(Instant::now());
        }

        Ok(Self {
            inner: Mutex::new(PoolInner {
                agents: HashMap::new(),
                tokens: HashMap::new(),
                next_token: 1,
                local_id: None,
            }),
            sink,
            options,
            stun,
            registry,
            waker,
            poll: Mutex::new(Some(poll)),
            io_thread: Mutex::new(None),
            running: AtomicBool::new(true),
            inbound: Arc::new(InboundQueue::new(metrics.clone())),
            metrics,
        })
    }

    pub fn inbound(&self) -> Arc<InboundQueue> {
        self.inbound.clone()
    }

    pub fn local_id(&self) -> Option<PeerId> {
        self.inner.lock().local_id
    }

    /// Record our identity; New agents take the matching role
    pub fn set_local_id(&self, id: PeerId) {
        let mut inner = self.inner.lock();
        inner.local_id = Some(id);
        for (peer, handle) in &inner.agents {
            handle.with_agent(|agent| agent.set_controlling(id > *peer));
        }
        drop(inner);
        log::info!("Local peer id {}", id);
    }

    pub fn agent_count(&self) -> usize {
        self.inner.lock().agents.len()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.lock().agents.keys().copied().collect()
    }

    pub fn get(&self, peer: &PeerId) -> Option<Arc<AgentHandle>> {
        self.inner.lock().agents.get(peer).cloned()
    }

    fn handles(&self) -> Vec<Arc<AgentHandle>> {
        self.inner.lock().agents.values().cloned().collect()
    }

    // ------------------------------------------------------------------------
    // Agent lifecycle
    // ------------------------------------------------------------------------

    /// Agent for `peer`, created on first use
    pub fn ensure_agent(&self, peer: PeerId) -> Result<Arc<AgentHandle>, PoolError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(PoolError::ShutDown);
        }

        let mut inner = self.inner.lock();
        if let Some(handle) = inner.agents.get(&peer) {
            return Ok(handle.clone());
        }
        if peer.is_server() || inner.local_id == Some(peer) {
            return Err(PoolError::InvalidPeer(peer));
        }

        let token = Token(inner.next_token);
        inner.next_token += 1;

        let std_socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        std_socket.set_nonblocking(true)?;
        let local_port = std_socket.local_addr()?.port();
        let mut socket = UdpSocket::from_std(std_socket);
        self.registry.register(&mut socket, token, Interest::READABLE)?;

        let controlling = inner.local_id.map(|id| id > peer).unwrap_or(false);
        let handle = Arc::new(AgentHandle {
            peer,
            token,
            local_port,
            slot: Mutex::new(AgentSlot {
                agent: Agent::new(peer, controlling, Instant::now()),
                socket,
            }),
        });

        inner.agents.insert(peer, handle.clone());
        inner.tokens.insert(token, peer);
        log::debug!("Created agent for {} on port {}", peer, local_port);
        Ok(handle)
    }

    /// Remove an agent from the map and its socket from the poll
    fn remove_locked(&self, inner: &mut PoolInner, peer: &PeerId) -> Option<Arc<AgentHandle>> {
        let handle = inner.agents.remove(peer)?;
        inner.tokens.remove(&handle.token);
        let mut slot = handle.slot.lock();
        if let Err(e) = self.registry.deregister(&mut slot.socket) {
            log::debug!("Deregister for {} failed: {}", peer, e);
        }
        drop(slot);
        Some(handle)
    }

    /// Drop agents idle past the threshold; checking agents are kept
    pub fn prune_idle(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock();
        let idle: Vec<PeerId> = inner
            .agents
            .values()
            .filter(|handle| {
                handle.with_agent(|agent| {
                    agent.state() != AgentState::Checking && agent.idle_for(now) > AGENT_IDLE_TIMEOUT
                })
            })
            .map(|handle| handle.peer)
            .collect();

        for peer in &idle {
            self.remove_locked(&mut inner, peer);
            log::info!("Removed idle agent {}", peer);
        }
        idle.len()
    }

    pub fn peer_status(&self, peer: &PeerId) -> Option<(AgentState, ConnectionKind)> {
        self.get(peer).map(|handle| handle.status())
    }

    /// Count peer activity that did not come through an agent
    pub fn touch(&self, peer: &PeerId, now: Instant) {
        if let Some(handle) = self.get(peer) {
            handle.with_agent(|agent| agent.touch(now));
        }
    }

    // ------------------------------------------------------------------------
    // Negotiation
    // ------------------------------------------------------------------------

    /// STUN server address when resolved; never waits on a lookup
    fn stun_address(&self) -> Option<SocketAddr> {
        self.stun.as_ref()?.address(Instant::now())
    }

    /// Drop a Failed or Disconnected agent so the next use starts afresh
    fn replace_finished(&self, peer: &PeerId) {
        let mut inner = self.inner.lock();
        let finished = inner
            .agents
            .get(peer)
            .map_or(false, |handle| handle.state().is_terminal());
        if finished {
            log::info!("Replacing finished agent for {}", peer);
            self.remove_locked(&mut inner, peer);
        }
    }

    fn start_agent(&self, slot: &mut AgentSlot, local_port: u16, stun: Option<SocketAddr>, now: Instant) {
        if slot.agent.state() != AgentState::New {
            return;
        }
        let addrs = enumerate_local_addresses(local_port, self.options.include_loopback);
        slot.agent
            .start(now, &addrs, self.options.include_loopback, stun);
    }

    /// Feed one inbound negotiation message to the agent for `peer`
    pub fn negotiation_step(&self, peer: PeerId, kind: MessageKind, data: &str) -> Result<(), PoolError> {
        let now = Instant::now();
        let ping = is_agent_ping(kind, data);

        if ping {
            self.replace_finished(&peer);
        } else if kind == MessageKind::AgentLocalDescription {
            if let Ok(description) = parse_description(data) {
                let mut inner = self.inner.lock();
                let replace = inner
                    .agents
                    .get(&peer)
                    .map(|handle| handle.with_agent(|agent| agent.should_replace(&description)))
                    .unwrap_or(false);
                if replace {
                    log::info!("Replacing agent for {} (remote session {:016x})", peer, description.session_id);
                    self.remove_locked(&mut inner, &peer);
                }
            }
        }

        let handle = self.ensure_agent(peer)?;
        let stun = self.stun_address();

        let signals = {
            let mut slot = handle.slot.lock();
            if let Err(e) = slot.agent.apply_signal(kind, data, now) {
                log::warn!("Negotiation message {} from {} ignored: {}", kind, peer, e);
            }
            if ping || kind == MessageKind::AgentLocalDescription {
                self.start_agent(&mut slot, handle.local_port, stun, now);
            }
            flush(&mut slot)
        };

        self.send_signals(signals);
        Ok(())
    }

    /// Ping `peer` through the signaling channel and start negotiating if
    /// the agent has not started yet. A Failed or Disconnected agent is
    /// replaced by a fresh one first.
    pub fn ping(&self, peer: PeerId) -> Result<(), PoolError> {
        self.replace_finished(&peer);
        let handle = self.ensure_agent(peer)?;
        let stun = self.stun_address();

        let signals = {
            let mut slot = handle.slot.lock();
            self.start_agent(&mut slot, handle.local_port, stun, Instant::now());
            flush(&mut slot)
        };

        self.send_signals(std::iter::once(SignalMessage::agent_ping(peer)).chain(signals));
        Ok(())
    }

    fn send_signals(&self, signals: impl IntoIterator<Item = SignalMessage>) {
        for message in signals {
            let kind = message.kind;
            let peer = message.peer;
            if let Err(e) = self.sink.send_signal(message) {
                log::warn!("Could not send {} to {}: {}", kind, peer, e);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Data
    // ------------------------------------------------------------------------

    /// Send one datagram to `peer` over its selected path
    pub fn send_to_peer(&self, peer: &PeerId, payload: &[u8]) -> Result<(), SendError> {
        let handle = self.get(peer).ok_or(SendError::NoRoute(*peer))?;
        let slot = handle.slot.lock();
        let (addr, datagram) = slot.agent.prepare_send(payload)?;
        slot.socket.send_to(&datagram, addr)?;
        Metrics::inc(&self.metrics.datagrams_sent);
        Ok(())
    }

    /// Send to every connected peer. Returns how many sends succeeded.
    pub fn broadcast(&self, payload: &[u8]) -> usize {
        let mut sent = 0;
        for handle in self.handles() {
            if !handle.state().is_usable() {
                continue;
            }
            match self.send_to_peer(&handle.peer, payload) {
                Ok(()) => sent += 1,
                Err(e) => log::warn!("Broadcast to {} failed: {}", handle.peer, e),
            }
        }
        sent
    }

    // ------------------------------------------------------------------------
    // I/O thread
    // ------------------------------------------------------------------------

    /// Start the thread that services agent sockets and timers
    pub fn spawn_io(self: &Arc<Self>) -> Result<(), PoolError> {
        let mut poll = self.poll.lock().take().ok_or(PoolError::ShutDown)?;
        let pool = Arc::clone(self);

        let handle = thread::Builder::new()
            .name("agent-io".to_string())
            .spawn(move || pool.run_io(&mut poll))?;
        *self.io_thread.lock() = Some(handle);
        Ok(())
    }

    fn run_io(&self, poll: &mut Poll) {
        log::info!("Agent I/O thread started");
        let mut events = Events::with_capacity(256);
        let mut buf = vec![0u8; RECV_BUF_LEN];
        let mut last_tick = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = poll.poll(&mut events, Some(TICK_INTERVAL)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    log::error!("Agent poll failed: {}", e);
                }
                continue;
            }

            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                let handle = {
                    let inner = self.inner.lock();
                    inner
                        .tokens
                        .get(&event.token())
                        .and_then(|peer| inner.agents.get(peer))
                        .cloned()
                };
                if let Some(handle) = handle {
                    self.drain_socket(&handle, &mut buf);
                }
            }

            let now = Instant::now();
            if now.saturating_duration_since(last_tick) >= TICK_INTERVAL {
                last_tick = now;
                self.tick_all(now);
            }
        }
        log::info!("Agent I/O thread stopped");
    }

    fn drain_socket(&self, handle: &AgentHandle, buf: &mut [u8]) {
        let signals = {
            let mut slot = handle.slot.lock();
            loop {
                let (len, from) = match slot.socket.recv_from(buf) {
                    Ok(received) => received,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // ICMP errors surface here on some platforms
                        log::debug!("Agent {} recv error: {}", handle.peer, e);
                        continue;
                    }
                };

                let now = Instant::now();
                if let Some(data) = slot.agent.on_datagram(from, &buf[..len], now) {
                    Metrics::inc(&self.metrics.datagrams_received);
                    self.inbound.push(GamePacket {
                        sender: handle.peer,
                        data,
                        received_at: now,
                    });
                }
            }
            flush(&mut slot)
        };
        self.send_signals(signals);
    }

    fn tick_all(&self, now: Instant) {
        for handle in self.handles() {
            let signals = {
                let mut slot = handle.slot.lock();
                slot.agent.tick(now);
                flush(&mut slot)
            };
            self.send_signals(signals);
        }
    }

    /// Stop the I/O thread and drop every agent. Safe to call more than once.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.waker.wake() {
            log::warn!("Failed to wake agent I/O thread: {}", e);
        }
        if let Some(handle) = self.io_thread.lock().take() {
            if handle.join().is_err() {
                log::error!("Agent I/O thread panicked");
            }
        }

        let mut inner = self.inner.lock();
        let peers: Vec<PeerId> = inner.agents.keys().copied().collect();
        for peer in &peers {
            self.remove_locked(&mut inner, peer);
        }
        log::info!("Agent pool shut down ({} agents dropped)", peers.len());
    }
}

// ============================================================================
// Tests
// ============================================================================
