//! Peer-to-peer path negotiation
//!
//! Each remote peer gets one [`Agent`] that gathers candidates, exchanges
//! them over the signaling channel and runs connectivity checks until a
//! usable UDP path is found. The [`AgentPool`] owns the agents and the I/O
//! thread that services their sockets.

pub mod agent;
pub mod candidate;
pub mod connectivity;
pub mod keepalive;
pub mod pool;
pub mod stun;

pub use agent::{Agent, AgentState, ConnectionKind, NegotiationError, SendError};
pub use candidate::{Candidate, CandidateType};
pub use pool::{AgentHandle, AgentPool, GamePacket, InboundQueue, PoolError, PoolOptions};
