//! Transport candidates for peer negotiation
//!
//! Candidate types and priorities follow RFC 8445. Candidates are exchanged
//! with the remote peer as JSON inside signaling payloads.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};

// ============================================================================
// Constants (RFC 8445 Section 5.1.2.1)
// ============================================================================

const HOST_TYPE_PREF: u32 = 126;
const SRFLX_TYPE_PREF: u32 = 100;
const PRFLX_TYPE_PREF: u32 = 110;
const RELAY_TYPE_PREF: u32 = 0;

/// Local preference for IPv4 addresses
const IPV4_LOCAL_PREF: u32 = 65535;

/// Local preference for IPv6 addresses
const IPV6_LOCAL_PREF: u32 = 65534;

/// Loopback is only offered for same-machine sessions, rank it last among hosts
const LOOPBACK_LOCAL_PREF: u32 = 1;

/// Each agent negotiates a single component
const COMPONENT_ID: u32 = 1;

// ============================================================================
// Candidate Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateType {
    /// Local interface address
    Host,
    /// Public mapping learned from a STUN server
    ServerReflexive,
    /// Mapping learned from a peer's binding request
    PeerReflexive,
    /// Address allocated on a relay
    Relay,
}

impl CandidateType {
    pub fn type_preference(&self) -> u32 {
        match self {
            CandidateType::Host => HOST_TYPE_PREF,
            CandidateType::ServerReflexive => SRFLX_TYPE_PREF,
            CandidateType::PeerReflexive => PRFLX_TYPE_PREF,
            CandidateType::Relay => RELAY_TYPE_PREF,
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateType::Host => write!(f, "host"),
            CandidateType::ServerReflexive => write!(f, "srflx"),
            CandidateType::PeerReflexive => write!(f, "prflx"),
            CandidateType::Relay => write!(f, "relay"),
        }
    }
}

// ============================================================================
// Candidate
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(rename = "type")]
    pub candidate_type: CandidateType,
    pub address: SocketAddr,
    /// Higher is preferred
    pub priority: u32,
    /// Candidates with the same foundation share a base and type
    pub foundation: String,
    /// Base address for reflexive and relay candidates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_address: Option<SocketAddr>,
}

impl Candidate {
    pub fn new(
        candidate_type: CandidateType,
        address: SocketAddr,
        related_address: Option<SocketAddr>,
    ) -> Self {
        let priority = calculate_priority(
            candidate_type.type_preference(),
            local_preference(&address),
            COMPONENT_ID,
        );

        Self {
            candidate_type,
            address,
            priority,
            foundation: format!("{}_{}", candidate_type, address.ip()),
            related_address,
        }
    }

    pub fn host(address: SocketAddr) -> Self {
        Self::new(CandidateType::Host, address, None)
    }

    pub fn server_reflexive(public_address: SocketAddr, base_address: SocketAddr) -> Self {
        Self::new(CandidateType::ServerReflexive, public_address, Some(base_address))
    }

    /// Remote address seen on a check that matched no known candidate
    pub fn peer_reflexive(address: SocketAddr) -> Self {
        Self::new(CandidateType::PeerReflexive, address, None)
    }

    pub fn is_loopback(&self) -> bool {
        self.address.ip().is_loopback()
    }

    pub fn is_relay(&self) -> bool {
        self.candidate_type == CandidateType::Relay
    }

    /// Whether the address lies in a private, shared or link-local range
    pub fn is_private_network(&self) -> bool {
        is_private_address(&self.address.ip())
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} priority {}",
            self.candidate_type, self.address, self.priority
        )
    }
}

// ============================================================================
// Priority Calculation (RFC 8445 Section 5.1.2.1)
// ============================================================================

/// priority = (2^24 * type_preference) + (2^8 * local_preference) + (256 - component_id)
pub fn calculate_priority(type_pref: u32, local_pref: u32, component_id: u32) -> u32 {
    let type_pref = type_pref.min(126);
    let local_pref = local_pref.min(65535);
    let component_id = component_id.clamp(1, 256);

    (type_pref << 24) | (local_pref << 8) | (256 - component_id)
}

fn local_preference(addr: &SocketAddr) -> u32 {
    match addr.ip() {
        ip if ip.is_loopback() => LOOPBACK_LOCAL_PREF,
        IpAddr::V4(_) => IPV4_LOCAL_PREF,
        IpAddr::V6(_) => IPV6_LOCAL_PREF,
    }
}

/// RFC 1918 private, RFC 6598 shared (CGNAT, also used by LAN overlays),
/// link-local, and IPv6 unique-local addresses
pub fn is_private_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            v4.is_private()
                || v4.is_link_local()
                || (octets[0] == 100 && (octets[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => is_ipv6_local(v6),
    }
}

fn is_ipv6_local(addr: &Ipv6Addr) -> bool {
    let first = addr.segments()[0];
    // fe80::/10 link-local, fc00::/7 unique-local
    (first & 0xffc0) == 0xfe80 || (first & 0xfe00) == 0xfc00
}

// ============================================================================
// Candidate Gathering
// ============================================================================

/// Host candidates for the given local addresses
pub fn gather_host_candidates(local_addrs: &[SocketAddr], include_loopback: bool) -> Vec<Candidate> {
    local_addrs
        .iter()
        .filter(|addr| include_loopback || !addr.ip().is_loopback())
        .filter(|addr| !addr.ip().is_unspecified())
        .map(|&addr| Candidate::host(addr))
        .collect()
}

/// Server reflexive candidate from a STUN mapping; `None` when no NAT is
/// present and the mapping equals the base
pub fn gather_reflexive_candidate(
    reflexive_addr: SocketAddr,
    base_addr: SocketAddr,
) -> Option<Candidate> {
    if reflexive_addr == base_addr {
        return None;
    }
    Some(Candidate::server_reflexive(reflexive_addr, base_addr))
}

pub fn sort_candidates_by_priority(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
}

// ============================================================================
// Interface Enumeration
// ============================================================================

/// IPv4 interface addresses paired with `port`
#[cfg(unix)]
pub fn enumerate_local_addresses(port: u16, include_loopback: bool) -> Vec<SocketAddr> {
    let mut addrs = Vec::new();

    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            log::warn!("getifaddrs failed, no host candidates from interfaces");
            return addrs;
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;

            if !ifa.ifa_addr.is_null() && (*ifa.ifa_addr).sa_family as i32 == libc::AF_INET {
                let sockaddr_in = ifa.ifa_addr as *const libc::sockaddr_in;
                let ip_bytes = (*sockaddr_in).sin_addr.s_addr.to_ne_bytes();
                let ip = Ipv4Addr::from(ip_bytes);

                let addr = SocketAddr::new(IpAddr::V4(ip), port);
                if (include_loopback || !ip.is_loopback()) && !addrs.contains(&addr) {
                    addrs.push(addr);
                }
            }

            current = ifa.ifa_next;
        }

        libc::freeifaddrs(ifaddrs);
    }

    if include_loopback {
        let loopback = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        if !addrs.contains(&loopback) {
            addrs.push(loopback);
        }
    }

    addrs
}

#[cfg(not(unix))]
pub fn enumerate_local_addresses(port: u16, include_loopback: bool) -> Vec<SocketAddr> {
    if include_loopback {
        vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)]
    } else {
        Vec::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_type_preference() {
        assert_eq!(CandidateType::Host.type_preference(), 126);
        assert_eq!(CandidateType::ServerReflexive.type_preference(), 100);
        assert_eq!(CandidateType::PeerReflexive.type_preference(), 110);
        assert_eq!(CandidateType::Relay.type_preference(), 0);
    }

    #[test]
    fn test_calculate_priority() {
        let host = calculate_priority(126, 65535, 1);
        assert_eq!(host, (126 << 24) | (65535 << 8) | 255);

        let prflx = calculate_priority(110, 65535, 1);
        let srflx = calculate_priority(100, 65535, 1);
        let relay = calculate_priority(0, 65535, 1);
        assert!(host > prflx && prflx > srflx && srflx > relay);
    }

    #[test]
    fn test_loopback_ranks_below_other_hosts() {
        let lan = Candidate::host("192.168.1.10:4000".parse().unwrap());
        let lo = Candidate::host("127.0.0.1:4000".parse().unwrap());
        assert!(lan.priority > lo.priority);
        // Still above any server reflexive candidate
        let srflx = Candidate::server_reflexive(
            "203.0.113.9:4000".parse().unwrap(),
            "192.168.1.10:4000".parse().unwrap(),
        );
        assert!(lo.priority > srflx.priority);
    }

    #[test]
    fn test_gather_host_candidates() {
        let addrs: Vec<SocketAddr> = vec![
            "192.168.1.100:50000".parse().unwrap(),
            "127.0.0.1:50000".parse().unwrap(),
            "0.0.0.0:50000".parse().unwrap(),
        ];

        let candidates = gather_host_candidates(&addrs, false);
        assert_eq!(candidates.len(), 1);

        let candidates = gather_host_candidates(&addrs, true);
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().any(|c| c.is_loopback()));
    }

    #[test]
    fn test_gather_reflexive_candidate() {
        let base: SocketAddr = "192.168.1.100:50000".parse().unwrap();
        let mapped: SocketAddr = "203.0.113.50:61000".parse().unwrap();

        let candidate = gather_reflexive_candidate(mapped, base).unwrap();
        assert_eq!(candidate.candidate_type, CandidateType::ServerReflexive);
        assert_eq!(candidate.related_address, Some(base));

        assert!(gather_reflexive_candidate(base, base).is_none());
    }

    #[test]
    fn test_private_address_classification() {
        let private = ["10.1.2.3", "172.16.0.1", "192.168.0.5", "100.64.0.1", "169.254.1.1", "fe80::1", "fd00::5"];
        for ip in private {
            assert!(is_private_address(&ip.parse().unwrap()), "{} should be private", ip);
        }
        let public = ["8.8.8.8", "203.0.113.1", "100.128.0.1", "2001:db8::1"];
        for ip in public {
            assert!(!is_private_address(&ip.parse().unwrap()), "{} should be public", ip);
        }
    }

    #[test]
    fn test_candidate_json() {
        let candidate = Candidate::server_reflexive(
            "203.0.113.50:50000".parse().unwrap(),
            "192.168.1.100:50000".parse().unwrap(),
        );
        let json = serde_json::to_string(&candidate).unwrap();
        assert!(json.contains("\"type\":\"ServerReflexive\""));
        let back: Candidate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, candidate);
    }

    #[test]
    fn test_sort_candidates_by_priority() {
        let mut candidates = vec![
            Candidate::server_reflexive(
                "203.0.113.50:50000".parse().unwrap(),
                "192.168.1.100:50000".parse().unwrap(),
            ),
            Candidate::host("192.168.1.100:50000".parse().unwrap()),
            Candidate::peer_reflexive("198.51.100.7:40000".parse().unwrap()),
        ];

        sort_candidates_by_priority(&mut candidates);

        assert_eq!(candidates[0].candidate_type, CandidateType::Host);
        assert_eq!(candidates[1].candidate_type, CandidateType::PeerReflexive);
        assert_eq!(candidates[2].candidate_type, CandidateType::ServerReflexive);
    }

    #[test]
    fn test_enumerate_local_addresses() {
        let addrs = enumerate_local_addresses(50000, false);
        for addr in &addrs {
            assert!(!addr.ip().is_loopback());
            assert_eq!(addr.port(), 50000);
        }

        let with_lo = enumerate_local_addresses(50001, true);
        assert!(with_lo.iter().any(|a| a.ip().is_loopback()));
    }
}
