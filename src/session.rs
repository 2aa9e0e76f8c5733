//! Session controller
//!
//! Top-level coordinator that owns the signaling transport, the agent pool
//! and the ad directory. A dedicated receive thread pulls batches from the
//! transport and routes each message:
//!
//! ```text
//!                        ┌─► ServerSetClientId ──► cache id, set roles
//!   receive_batch ──►────┼─► RequestAdvertisers ─► advertiser list + agents
//!   (blocking)           ├─► SolicitAds ─────────► reply with hosted ad
//!                        ├─► GameAd ─────────────► directory merge, liveness
//!                        └─► Agent* ─────────────► pool negotiation step
//! ```
//!
//! Caller verbs (discovery, advertising, send/receive) run on the caller's
//! thread.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

use crate::config::Config;
use crate::directory::{AdDirectory, AdError, ClientInfo, GameAd};
use crate::metrics::Metrics;
use crate::p2p::{AgentPool, GamePacket, PoolError, PoolOptions, SendError};
use crate::peer_id::{split_peer_list, PeerId, PeerIdError};
use crate::signaling::{
    MessageKind, SignalMessage, SignalTransport, SignalingChannel, SignalingError,
};

// ============================================================================
// Errors
// ============================================================================

/// Failure to bring a session up; the only fatal error
#[derive(Debug, Error)]
pub enum InitError {
    #[error("signaling: {0}")]
    Signaling(#[from] SignalingError),
    #[error("agent pool: {0}")]
    Pool(#[from] PoolError),
    #[error("failed to start worker: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvError {
    #[error("no data available")]
    NoData,
}

/// Why one inbound message could not be handled
#[derive(Debug, Error)]
enum DispatchError {
    #[error("bad ad payload: {0}")]
    Ad(#[from] AdError),
    #[error("bad peer id: {0}")]
    PeerId(#[from] PeerIdError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

// ============================================================================
// Shared State
// ============================================================================

/// State shared between the caller-facing controller and the receive thread
struct Shared {
    transport: Arc<dyn SignalTransport>,
    pool: Arc<AgentPool>,
    directory: AdDirectory,
    client: ClientInfo,
    advertisers: Mutex<Vec<PeerId>>,
    hosted: Mutex<Option<GameAd>>,
    local_id: Mutex<Option<PeerId>>,
    running: AtomicBool,
    generation: AtomicU64,
    discovery_round: AtomicUsize,
    metrics: Arc<Metrics>,
}

impl Shared {
    fn receive_loop(&self) {
        log::info!("Signaling receive loop started");

        while self.running.load(Ordering::SeqCst) {
            self.pool.prune_idle(Instant::now());

            let batch = self.transport.receive_batch();
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            self.check_generation();

            for message in batch {
                let kind = message.kind;
                let peer = message.peer;
                if let Err(e) = self.dispatch(message) {
                    log::warn!("Failed to handle {} from {}: {}", kind, peer, e);
                }
            }
        }

        log::info!("Signaling receive loop stopped");
    }

    /// Resume advertising on a fresh connection
    fn check_generation(&self) {
        let current = self.transport.generation();
        let previous = self.generation.swap(current, Ordering::SeqCst);
        if current == previous {
            return;
        }

        log::info!("Signaling connection renewed (generation {})", current);
        if self.hosted.lock().is_none() {
            return;
        }

        if let Some(id) = *self.local_id.lock() {
            let register =
                SignalMessage::new(PeerId::SERVER, MessageKind::ServerSetClientId, id.to_b64());
            if let Err(e) = self.transport.send_signal(register) {
                log::warn!("Could not re-register id {}: {}", id, e);
            }
        }
        if let Err(e) = self
            .transport
            .send_signal(SignalMessage::to_server(MessageKind::StartAdvertising))
        {
            log::warn!("Could not resume advertising: {}", e);
        }
    }

    fn dispatch(&self, message: SignalMessage) -> Result<(), DispatchError> {
        log::trace!("Dispatching {} from {}", message.kind, message.peer);

        match message.kind {
            MessageKind::StartAdvertising => log::info!("Server confirmed lobby open"),
            MessageKind::StopAdvertising => log::info!("Server confirmed lobby closed"),
            MessageKind::ServerSetClientId => {
                let id = match message.data.trim() {
                    "" => message.peer,
                    text => PeerId::from_b64(text)?,
                };
                *self.local_id.lock() = Some(id);
                self.pool.set_local_id(id);
            }
            MessageKind::RequestAdvertisers => self.update_advertisers(&message.data),
            MessageKind::SolicitAds => {
                let hosted = self.hosted.lock().clone();
                if let Some(ad) = hosted {
                    log::debug!("Solicitation from {}, replying with our lobby", message.peer);
                    let reply =
                        SignalMessage::new(message.peer, MessageKind::GameAd, ad.encode_payload()?);
                    self.transport.send_signal(reply)?;
                }
            }
            MessageKind::GameAd => self.merge_ad(message.peer, &message.data)?,
            MessageKind::AgentLocalDescription
            | MessageKind::AgentCandidate
            | MessageKind::AgentGatheringDone => {
                self.pool
                    .negotiation_step(message.peer, message.kind, &message.data)?;
            }
            MessageKind::ServerEcho => log::debug!("Server echo: {}", message.data),
        }
        Ok(())
    }

    /// Replace the known advertisers with the ids in `data`
    fn update_advertisers(&self, data: &str) {
        let local = *self.local_id.lock();
        let mut advertisers = Vec::new();

        for parsed in split_peer_list(data) {
            match parsed {
                Ok(peer) if Some(peer) == local => {}
                Ok(peer) => advertisers.push(peer),
                Err(e) => log::warn!("Skipping advertiser entry: {}", e),
            }
        }

        for peer in &advertisers {
            if let Err(e) = self.pool.ensure_agent(*peer) {
                log::warn!("No agent for advertiser {}: {}", peer, e);
            }
        }

        log::debug!("{} known advertisers", advertisers.len());
        *self.advertisers.lock() = advertisers;
    }

    fn merge_ad(&self, host: PeerId, data: &str) -> Result<(), DispatchError> {
        let ad = GameAd::decode_payload(data)?;
        let now = Instant::now();
        let in_progress = ad.is_in_progress();

        self.pool.ensure_agent(host)?;
        let status = self.pool.peer_status(&host);
        let index = self.directory.merge(host, ad, status, now);
        Metrics::inc(&self.metrics.ads_merged);
        log::debug!("Lobby info from {} stored as #{}", host, index);

        if !in_progress {
            self.pool.touch(&host, now);
        }
        Ok(())
    }
}

// ============================================================================
// Session Controller
// ============================================================================

pub struct SessionController {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl SessionController {
    /// Connect to the configured server and start the workers
    pub fn connect(config: &Config, client: ClientInfo) -> Result<Self, InitError> {
        let metrics = Arc::new(Metrics::new());
        let channel = Arc::new(SignalingChannel::new(config.server_address(), metrics.clone()));
        channel.connect()?;

        let session = Self::new(channel, config, client, metrics)?;
        session.start()?;
        Ok(session)
    }

    /// Build a controller over an already connected transport
    pub fn new<T: SignalTransport + 'static>(
        transport: Arc<T>,
        config: &Config,
        client: ClientInfo,
        metrics: Arc<Metrics>,
    ) -> Result<Self, InitError> {
        let options = PoolOptions {
            include_loopback: config.include_loopback,
            stun_server: config.stun_server.clone(),
        };
        let pool = AgentPool::new(options, transport.clone(), metrics.clone())?;
        let generation = transport.generation();

        Ok(Self {
            shared: Arc::new(Shared {
                transport,
                pool: Arc::new(pool),
                directory: AdDirectory::new(client),
                client,
                advertisers: Mutex::new(Vec::new()),
                hosted: Mutex::new(None),
                local_id: Mutex::new(None),
                running: AtomicBool::new(true),
                generation: AtomicU64::new(generation),
                discovery_round: AtomicUsize::new(0),
                metrics,
            }),
            worker: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    /// Spawn the agent I/O thread and the receive thread
    pub fn start(&self) -> Result<(), InitError> {
        self.shared.pool.spawn_io()?;

        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("signal-recv".to_string())
            .spawn(move || shared.receive_loop())?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Discovery & advertising
    // ------------------------------------------------------------------------

    /// Refresh the lobby list: ask for advertisers, then ping and solicit
    /// every known one
    pub fn request_discovery(&self) {
        let shared = &self.shared;

        if shared.transport.is_ready() {
            shared.directory.clear_status();
        } else {
            let round = shared.discovery_round.fetch_add(1, Ordering::Relaxed);
            let text = format!("Connecting{}", ".".repeat(round % 4));
            shared.directory.set_status(&text);
        }

        if let Err(e) = shared
            .transport
            .send_signal(SignalMessage::to_server(MessageKind::RequestAdvertisers))
        {
            log::debug!("Advertiser request not sent: {}", e);
        }

        let advertisers = shared.advertisers.lock().clone();
        for peer in advertisers {
            if let Err(e) = shared.pool.ping(peer) {
                log::warn!("Could not ping {}: {}", peer, e);
            }
            if let Err(e) = shared
                .transport
                .send_signal(SignalMessage::new(peer, MessageKind::SolicitAds, ""))
            {
                log::debug!("Solicitation to {} not sent: {}", peer, e);
            }
        }
    }

    /// Host `ad`; it is sent to every peer that solicits ads
    pub fn start_advertising(&self, mut ad: GameAd) -> Result<(), SignalingError> {
        self.shared.client.stamp(&mut ad);
        ad.bound();
        log::info!("Advertising lobby '{}'", ad.name);
        *self.shared.hosted.lock() = Some(ad);

        self.shared
            .transport
            .send_signal(SignalMessage::to_server(MessageKind::StartAdvertising))
    }

    pub fn stop_advertising(&self) -> Result<(), SignalingError> {
        if self.shared.hosted.lock().take().is_some() {
            log::info!("Stopped advertising");
        }
        self.shared
            .transport
            .send_signal(SignalMessage::to_server(MessageKind::StopAdvertising))
    }

    pub fn is_advertising(&self) -> bool {
        self.shared.hosted.lock().is_some()
    }

    pub fn known_advertisers(&self) -> Vec<PeerId> {
        self.shared.advertisers.lock().clone()
    }

    // ------------------------------------------------------------------------
    // Game data
    // ------------------------------------------------------------------------

    pub fn send(&self, peer: &PeerId, payload: &[u8]) -> Result<(), SendError> {
        self.shared.pool.send_to_peer(peer, payload)
    }

    /// Send to every connected peer; returns the number reached
    pub fn broadcast(&self, payload: &[u8]) -> usize {
        self.shared.pool.broadcast(payload)
    }

    /// Next fresh inbound packet
    pub fn receive(&self) -> Result<GamePacket, RecvError> {
        self.shared
            .pool
            .inbound()
            .pop(Instant::now())
            .ok_or(RecvError::NoData)
    }

    pub fn drain_inbound(&self) -> Vec<GamePacket> {
        self.shared.pool.inbound().drain(Instant::now())
    }

    /// Block until inbound data is queued or `timeout` passes
    pub fn wait_inbound(&self, timeout: Duration) -> bool {
        self.shared.pool.inbound().wait(timeout)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Live lobby list, expired entries removed
    pub fn advertisements(&self, now: Instant) -> Vec<GameAd> {
        self.shared.directory.snapshot(now)
    }

    pub fn game_info(&self, sequence_index: u32) -> Option<GameAd> {
        self.shared.directory.find(sequence_index)
    }

    pub fn local_id(&self) -> Option<PeerId> {
        *self.shared.local_id.lock()
    }

    pub fn signaling_ready(&self) -> bool {
        self.shared.transport.is_ready()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.shared.metrics.clone()
    }

    pub fn pool(&self) -> &Arc<AgentPool> {
        &self.shared.pool
    }

    /// Stop both workers and drop every agent. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Shutting down session");

        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.transport.close();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                log::error!("Receive thread panicked");
            }
        }
        self.shared.pool.shutdown();
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Tests
// ============================================================================
