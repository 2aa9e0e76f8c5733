//! Minimal STUN client (RFC 5389) for server reflexive candidates
//!
//! Only Binding requests without authentication are sent. Responses are
//! read for XOR-MAPPED-ADDRESS, with MAPPED-ADDRESS as a fallback for old
//! servers.
//!
//! The server name is resolved on a background thread by [`StunResolver`],
//! so negotiation never waits on DNS.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

use super::connectivity::{generate_transaction_id, TRANSACTION_ID_LEN};

// ============================================================================
// Constants
// ============================================================================

pub const MAGIC_COOKIE: u32 = 0x2112_A442;

const HEADER_SIZE: usize = 20;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// A failed lookup is not retried before this has passed
pub const RESOLVE_RETRY_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StunError {
    #[error("message too short")]
    MessageTooShort,
    #[error("invalid magic cookie")]
    InvalidMagicCookie,
    #[error("unexpected message type 0x{0:04x}")]
    UnexpectedType(u16),
    #[error("transaction id mismatch")]
    TransactionMismatch,
    #[error("no mapped address in response")]
    NoMappedAddress,
}

// ============================================================================
// Encoding / Decoding
// ============================================================================

/// Whether a datagram looks like STUN: top two bits clear and the magic
/// cookie at byte 4
pub fn is_stun(data: &[u8]) -> bool {
    data.len() >= HEADER_SIZE
        && data[0] & 0xC0 == 0
        && u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == MAGIC_COOKIE
}

/// Binding request with a fresh transaction id
pub fn binding_request() -> ([u8; TRANSACTION_ID_LEN], Vec<u8>) {
    let transaction_id = generate_transaction_id();

    let mut bytes = Vec::with_capacity(HEADER_SIZE);
    bytes.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    bytes.extend_from_slice(&0u16.to_be_bytes());
    bytes.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    bytes.extend_from_slice(&transaction_id);

    (transaction_id, bytes)
}

/// Extract the mapped address from a Binding success response to
/// `transaction_id`
pub fn parse_binding_response(
    data: &[u8],
    transaction_id: &[u8; TRANSACTION_ID_LEN],
) -> Result<SocketAddr, StunError> {
    if data.len() < HEADER_SIZE {
        return Err(StunError::MessageTooShort);
    }
    if !is_stun(data) {
        return Err(StunError::InvalidMagicCookie);
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != BINDING_SUCCESS {
        return Err(StunError::UnexpectedType(msg_type));
    }
    if &data[8..HEADER_SIZE] != transaction_id {
        return Err(StunError::TransactionMismatch);
    }

    let msg_length = u16::from_be_bytes([data[2], data[3]]) as usize;
    let end = (HEADER_SIZE + msg_length).min(data.len());

    let mut mapped = None;
    let mut offset = HEADER_SIZE;
    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_length = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;
        if offset + attr_length > end {
            break;
        }
        let value = &data[offset..offset + attr_length];

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                if let Some(addr) = decode_address(value, Some(transaction_id)) {
                    return Ok(addr);
                }
            }
            ATTR_MAPPED_ADDRESS if mapped.is_none() => {
                mapped = decode_address(value, None);
            }
            _ => {}
        }

        offset += attr_length + (4 - attr_length % 4) % 4;
    }

    mapped.ok_or(StunError::NoMappedAddress)
}

/// Decode an address attribute; XOR-ed when `transaction_id` is given
fn decode_address(value: &[u8], xor_with: Option<&[u8; TRANSACTION_ID_LEN]>) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let cookie = MAGIC_COOKIE.to_be_bytes();

    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if xor_with.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match value[1] {
        FAMILY_IPV4 if value.len() >= 8 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&value[4..8]);
            if xor_with.is_some() {
                for (byte, key) in octets.iter_mut().zip(cookie.iter()) {
                    *byte ^= key;
                }
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_IPV6 if value.len() >= 20 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            if let Some(txn) = xor_with {
                let key = cookie.iter().chain(txn.iter());
                for (byte, key) in octets.iter_mut().zip(key) {
                    *byte ^= key;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };

    Some(SocketAddr::new(ip, port))
}

// ============================================================================
// Server Resolution
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Idle,
    Pending,
    Resolved(SocketAddr),
    Failed(Instant),
}

/// Cached, non-blocking lookup of the STUN server's IPv4 address
pub struct StunResolver {
    server: String,
    state: Arc<Mutex<Resolution>>,
}

impl StunResolver {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            state: Arc::new(Mutex::new(Resolution::Idle)),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Address if already resolved. Otherwise starts a lookup in the
    /// background (unless one is running or the last failure is recent)
    /// and returns None.
    pub fn address(&self, now: Instant) -> Option<SocketAddr> {
        let mut state = self.state.lock();
        match *state {
            Resolution::Resolved(addr) => return Some(addr),
            Resolution::Pending => return None,
            Resolution::Failed(at) if now.saturating_duration_since(at) < RESOLVE_RETRY_INTERVAL => {
                return None
            }
            Resolution::Idle | Resolution::Failed(_) => {}
        }
        *state = Resolution::Pending;
        drop(state);

        self.spawn_lookup();
        None
    }

    fn spawn_lookup(&self) {
        let server = self.server.clone();
        let state = Arc::clone(&self.state);
        let spawned = thread::Builder::new()
            .name("stun-resolve".to_string())
            .spawn(move || {
                let outcome = match resolve_ipv4(&server) {
                    Ok(addr) => {
                        log::debug!("STUN server {} resolved to {}", server, addr);
                        Resolution::Resolved(addr)
                    }
                    Err(reason) => {
                        log::warn!("Could not resolve STUN server {}: {}", server, reason);
                        Resolution::Failed(Instant::now())
                    }
                };
                *state.lock() = outcome;
            });

        if let Err(e) = spawned {
            log::warn!("Could not start STUN lookup for {}: {}", self.server, e);
            *self.state.lock() = Resolution::Failed(Instant::now());
        }
    }
}

fn resolve_ipv4(server: &str) -> Result<SocketAddr, String> {
    server
        .to_socket_addrs()
        .map_err(|e| e.to_string())?
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| "no IPv4 address".to_string())
}

// ============================================================================
// Tests
// ============================================================================
