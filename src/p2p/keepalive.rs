//! Keepalives on an established peer path
//!
//! Keepalive requests are sent every 15 seconds on the selected path. They
//! hold the NAT binding open and detect a dead peer: three consecutive
//! requests without a response within 5 seconds mark the path lost.
//!
//! ```text
//! ┌──────┬──────────────────┐
//! │ 0x10 │ sequence (u32 BE)│   request
//! ├──────┼──────────────────┤
//! │ 0x11 │ sequence (u32 BE)│   response
//! └──────┴──────────────────┘
//! ```

use std::net::SocketAddr;
use std::time::{Duration, Instant};

// ============================================================================
// Constants
// ============================================================================

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// How long a request may go unanswered before it counts as missed
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive misses before the path is considered lost
pub const MISSED_KEEPALIVES_THRESHOLD: u32 = 3;

pub const KEEPALIVE_REQUEST: u8 = 0x10;
pub const KEEPALIVE_RESPONSE: u8 = 0x11;

// ============================================================================
// Encoding
// ============================================================================

fn encode(tag: u8, sequence: u32) -> [u8; 5] {
    let mut buf = [0u8; 5];
    buf[0] = tag;
    buf[1..5].copy_from_slice(&sequence.to_be_bytes());
    buf
}

pub fn encode_keepalive_request(sequence: u32) -> [u8; 5] {
    encode(KEEPALIVE_REQUEST, sequence)
}

pub fn encode_keepalive_response(sequence: u32) -> [u8; 5] {
    encode(KEEPALIVE_RESPONSE, sequence)
}

/// Returns (is_response, sequence), or None if this is not a keepalive
pub fn decode_keepalive(data: &[u8]) -> Option<(bool, u32)> {
    if data.len() < 5 {
        return None;
    }
    let is_response = match data[0] {
        KEEPALIVE_REQUEST => false,
        KEEPALIVE_RESPONSE => true,
        _ => return None,
    };
    let sequence = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    Some((is_response, sequence))
}

// ============================================================================
// Keepalive State
// ============================================================================

/// Keepalive bookkeeping for one selected path
#[derive(Debug)]
pub struct Keepalive {
    remote_addr: SocketAddr,
    last_sent: Instant,
    /// Sequence and send time of the request awaiting a response
    outstanding: Option<(u32, Instant)>,
    next_sequence: u32,
    missed: u32,
    rtt: Option<Duration>,
    lost: bool,
}

impl Keepalive {
    /// Start tracking; the first request goes out one interval after `now`
    pub fn new(remote_addr: SocketAddr, now: Instant) -> Self {
        Self {
            remote_addr,
            last_sent: now,
            outstanding: None,
            next_sequence: 1,
            missed: 0,
            rtt: None,
            lost: false,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Follow the path to a newly selected remote address
    pub fn set_remote(&mut self, remote_addr: SocketAddr) {
        if self.remote_addr != remote_addr {
            self.remote_addr = remote_addr;
            self.outstanding = None;
            self.missed = 0;
        }
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    pub fn is_lost(&self) -> bool {
        self.lost
    }

    /// Count an expired request. Returns true when the path just became lost.
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        if self.lost {
            return false;
        }
        if let Some((sequence, sent)) = self.outstanding {
            if now.saturating_duration_since(sent) >= KEEPALIVE_TIMEOUT {
                self.outstanding = None;
                self.missed += 1;
                log::debug!(
                    "Keepalive {} to {} missed ({}/{})",
                    sequence,
                    self.remote_addr,
                    self.missed,
                    MISSED_KEEPALIVES_THRESHOLD
                );
                if self.missed >= MISSED_KEEPALIVES_THRESHOLD {
                    self.lost = true;
                    return true;
                }
            }
        }
        false
    }

    /// Next request to send, if one is due
    pub fn poll(&mut self, now: Instant) -> Option<(SocketAddr, [u8; 5])> {
        if self.lost || now.saturating_duration_since(self.last_sent) < KEEPALIVE_INTERVAL {
            return None;
        }
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.last_sent = now;
        self.outstanding = Some((sequence, now));
        Some((self.remote_addr, encode_keepalive_request(sequence)))
    }

    pub fn record_response(&mut self, sequence: u32, now: Instant) {
        if let Some((expected, sent)) = self.outstanding {
            if expected == sequence {
                self.rtt = Some(now.saturating_duration_since(sent));
                self.outstanding = None;
            }
        }
        self.missed = 0;
    }
}

// ============================================================================
// Tests
// ============================================================================
