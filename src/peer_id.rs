//! Peer identity
//!
//! Every client connected to the rendezvous server is known by a 16-byte
//! opaque identifier. The canonical text form is standard padded base64,
//! which is always 24 characters long.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Size of a peer identifier in bytes
pub const PEER_ID_LEN: usize = 16;

/// Length of the base64 text form of a peer identifier
pub const PEER_ID_TEXT_LEN: usize = 24;

/// Opaque 16-byte peer identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PeerId([u8; PEER_ID_LEN]);

/// Errors from parsing the text form of a peer identifier
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerIdError {
    #[error("invalid base64 peer id: {0}")]
    InvalidBase64(String),
    #[error("peer id must be {PEER_ID_LEN} bytes, got {0}")]
    WrongLength(usize),
}

impl PeerId {
    /// Identity used for messages addressed to the rendezvous server itself
    pub const SERVER: PeerId = PeerId([0xFF; PEER_ID_LEN]);

    pub const fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// Parse a peer id from a raw byte slice
    pub fn from_slice(bytes: &[u8]) -> Result<Self, PeerIdError> {
        let arr: [u8; PEER_ID_LEN] = bytes
            .try_into()
            .map_err(|_| PeerIdError::WrongLength(bytes.len()))?;
        Ok(PeerId(arr))
    }

    /// Parse the canonical base64 text form
    pub fn from_b64(text: &str) -> Result<Self, PeerIdError> {
        let bytes = STANDARD
            .decode(text.trim())
            .map_err(|e| PeerIdError::InvalidBase64(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Canonical base64 text form (24 characters)
    pub fn to_b64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn is_server(&self) -> bool {
        *self == Self::SERVER
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_b64())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_b64())
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_b64(s)
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_b64())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        PeerId::from_b64(&text).map_err(serde::de::Error::custom)
    }
}

/// Split a concatenated list of base64 peer ids into identities.
///
/// The rendezvous server answers an advertiser request with the ids joined
/// without separators. Chunks that fail to decode are returned as errors so
/// the caller can log and skip them.
pub fn split_peer_list(data: &str) -> Vec<Result<PeerId, PeerIdError>> {
    data.as_bytes()
        .chunks(PEER_ID_TEXT_LEN)
        .filter(|chunk| chunk.len() == PEER_ID_TEXT_LEN)
        .map(|chunk| match std::str::from_utf8(chunk) {
            Ok(text) => PeerId::from_b64(text),
            Err(e) => Err(PeerIdError::InvalidBase64(e.to_string())),
        })
        .collect()
}
