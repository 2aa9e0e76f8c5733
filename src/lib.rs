//! Lobby Link
//!
//! Client-side core for peer-to-peer game lobbies:
//! - Framed signaling over a self-healing TCP connection to a rendezvous server
//! - ICE-style NAT traversal, one agent per remote peer
//! - A time-bounded directory of advertised games
//! - A session controller tying them together behind a few simple verbs

// ============================================================================
// Modules
// ============================================================================

pub mod config;
pub mod directory;
pub mod metrics;
pub mod p2p;
pub mod peer_id;
pub mod session;
pub mod signaling;

pub use config::{Config, ConfigError};
pub use directory::{AdDirectory, ClientInfo, GameAd};
pub use metrics::Metrics;
pub use p2p::{AgentState, ConnectionKind, GamePacket};
pub use peer_id::PeerId;
pub use session::{InitError, RecvError, SessionController};
pub use signaling::{MessageKind, SignalMessage, SignalingChannel};
