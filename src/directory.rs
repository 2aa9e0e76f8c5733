//! Advertisement directory
//!
//! The time-bounded set of hosted games discovered through the rendezvous
//! server. Each host owns at most one entry; re-merging refreshes the entry
//! in place and keeps its sequence index so the game's lobby list stays
//! stable while an ad keeps arriving.
//!
//! ```text
//!   GameAd (wire) ──► merge(host, ad, status) ──► [ad#1, ad#2, ad#3]
//!                                                      │
//!   snapshot(now) ◄── evict (now - last_seen > TTL) ◄──┘  + StatusAd
//! ```

use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::p2p::{AgentState, ConnectionKind};
use crate::peer_id::PeerId;

// ============================================================================
// Constants
// ============================================================================

/// Ads not refreshed within this window are dropped from the directory
pub const AD_TTL: Duration = Duration::from_millis(2000);

/// Maximum byte length of an ad's display name
pub const MAX_NAME_LEN: usize = 128;

/// Maximum byte length of an ad's stat string
pub const MAX_STAT_STRING_LEN: usize = 128;

/// Maximum size of an ad's opaque extra data
pub const MAX_EXTRA_LEN: usize = 128;

/// `game_state` value the game uses for a session that has already started.
/// Such ads are listed but do not count as proof the host is alive.
pub const GAME_STATE_IN_PROGRESS: u32 = 12;

/// Stat string carried by the synthetic status entry
const STATUS_STAT_STRING: &str = ",33,,3,,1e,,1,cb2edaab,5,,Server\rStatus\r";

/// Size of the status entry's extra data
const STATUS_EXTRA_LEN: usize = 32;

// ============================================================================
// Game Advertisement
// ============================================================================

/// Errors from encoding or decoding an ad payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdError {
    #[error("ad payload is not valid base64: {0}")]
    Base64(String),
    #[error("failed to decode ad: {0}")]
    Decode(String),
    #[error("failed to encode ad: {0}")]
    Encode(String),
}

/// Product and version of the embedding game
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientInfo {
    pub product: u32,
    pub version: u32,
}

impl ClientInfo {
    pub fn new(product: u32, version: u32) -> Self {
        Self { product, version }
    }

    /// Stamp this client's product and version onto a hosted ad
    pub fn stamp(&self, ad: &mut GameAd) {
        ad.product = self.product;
        ad.version = self.version;
    }
}

/// One advertised game lobby
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GameAd {
    /// Hosting peer; forced to the merge key on insert
    pub host: PeerId,
    /// Stable per-host index assigned by the directory
    pub sequence_index: u32,
    pub game_state: u32,
    pub name: String,
    pub stat_string: String,
    /// Opaque game-defined bytes
    pub extra: Vec<u8>,
    pub version: u32,
    pub product: u32,
    /// Time of the last merge; local only
    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

impl GameAd {
    pub fn new(
        name: impl Into<String>,
        stat_string: impl Into<String>,
        game_state: u32,
        extra: Vec<u8>,
    ) -> Self {
        let mut ad = Self {
            name: name.into(),
            stat_string: stat_string.into(),
            game_state,
            extra,
            ..Default::default()
        };
        ad.bound();
        ad
    }

    /// Clamp every variable-size field to its bound
    pub fn bound(&mut self) {
        truncate_utf8(&mut self.name, MAX_NAME_LEN);
        truncate_utf8(&mut self.stat_string, MAX_STAT_STRING_LEN);
        self.extra.truncate(MAX_EXTRA_LEN);
    }

    pub fn is_in_progress(&self) -> bool {
        self.game_state == GAME_STATE_IN_PROGRESS
    }

    /// Wire form carried in a `GameAd` signaling message
    pub fn encode_payload(&self) -> Result<String, AdError> {
        let bytes = bincode::serialize(self).map_err(|e| AdError::Encode(e.to_string()))?;
        Ok(STANDARD.encode(bytes))
    }

    pub fn decode_payload(data: &str) -> Result<Self, AdError> {
        let bytes = STANDARD
            .decode(data.trim())
            .map_err(|e| AdError::Base64(e.to_string()))?;
        let mut ad: GameAd =
            bincode::deserialize(&bytes).map_err(|e| AdError::Decode(e.to_string()))?;
        ad.bound();
        Ok(ad)
    }
}

/// Truncate to at most `max` bytes without splitting a character
fn truncate_utf8(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

/// Bracketed status prefix shown in front of a lobby name.
///
/// Empty when the ad has nothing to flag.
pub fn annotation_prefix(
    local_version: u32,
    ad_version: u32,
    status: Option<(AgentState, ConnectionKind)>,
) -> String {
    let mut prefix = String::new();

    if local_version != ad_version {
        log::info!(
            "Version mismatch. ours: {} theirs: {}",
            local_version,
            ad_version
        );
        prefix.push_str("[!Ver]");
    }

    if let Some((state, kind)) = status {
        match state {
            AgentState::New | AgentState::Checking => prefix.push_str("[P2P Connecting]"),
            AgentState::Failed => prefix.push_str("[P2P Failed]"),
            AgentState::Disconnected => prefix.push_str("[P2P Not Connected]"),
            AgentState::Connected | AgentState::Completed => {}
        }
        match kind {
            ConnectionKind::Relayed => prefix.push_str("[Relayed]"),
            ConnectionKind::OtherLocalNetwork => prefix.push_str("[LAN]"),
            ConnectionKind::Direct | ConnectionKind::Unknown => {}
        }
    }

    prefix
}

// ============================================================================
// Directory
// ============================================================================

struct DirectoryInner {
    ads: Vec<GameAd>,
    last_index: u32,
    status: Option<GameAd>,
}

/// Shared set of live advertisements
pub struct AdDirectory {
    client: ClientInfo,
    inner: Mutex<DirectoryInner>,
}

impl AdDirectory {
    pub fn new(client: ClientInfo) -> Self {
        Self {
            client,
            inner: Mutex::new(DirectoryInner {
                ads: Vec::new(),
                last_index: 0,
                status: None,
            }),
        }
    }

    /// Insert or refresh the ad for `host`. Returns the entry's sequence index.
    pub fn merge(
        &self,
        host: PeerId,
        mut ad: GameAd,
        status: Option<(AgentState, ConnectionKind)>,
        now: Instant,
    ) -> u32 {
        ad.bound();
        ad.host = host;
        ad.last_seen = Some(now);

        let prefix = annotation_prefix(self.client.version, ad.version, status);
        if !prefix.is_empty() {
            ad.name = format!("{} {}", prefix, ad.name);
            truncate_utf8(&mut ad.name, MAX_NAME_LEN);
        }

        let mut inner = self.inner.lock();
        match inner.ads.iter().position(|existing| existing.host == host) {
            Some(pos) => {
                ad.sequence_index = inner.ads[pos].sequence_index;
                log::trace!("Refreshed ad #{} from {}", ad.sequence_index, host);
                inner.ads[pos] = ad;
                inner.ads[pos].sequence_index
            }
            None => {
                inner.last_index += 1;
                ad.sequence_index = inner.last_index;
                log::debug!(
                    "New ad #{} from {}: {}",
                    ad.sequence_index,
                    host,
                    ad.name
                );
                inner.ads.push(ad);
                inner.last_index
            }
        }
    }

    /// Evict expired entries and return the live list, followed by the
    /// status entry when one is set.
    pub fn snapshot(&self, now: Instant) -> Vec<GameAd> {
        let mut inner = self.inner.lock();

        inner.ads.retain(|ad| match ad.last_seen {
            Some(seen) => now.saturating_duration_since(seen) <= AD_TTL,
            None => false,
        });

        let mut list = inner.ads.clone();
        if let Some(status) = &inner.status {
            let mut status = status.clone();
            status.sequence_index = list.last().map_or(1, |ad| ad.sequence_index + 1);
            list.push(status);
        }
        list
    }

    /// Look up a live ad by sequence index
    pub fn find(&self, sequence_index: u32) -> Option<GameAd> {
        self.inner
            .lock()
            .ads
            .iter()
            .find(|ad| ad.sequence_index == sequence_index)
            .cloned()
    }

    /// Show a synthetic entry describing local connection state
    pub fn set_status(&self, text: &str) {
        let mut extra = vec![0u8; STATUS_EXTRA_LEN];
        extra[0] = GAME_STATE_IN_PROGRESS as u8;

        let mut ad = GameAd::new(text, STATUS_STAT_STRING, 0, extra);
        self.client.stamp(&mut ad);
        self.inner.lock().status = Some(ad);
    }

    pub fn clear_status(&self) {
        self.inner.lock().status = None;
    }

    pub fn has_status(&self) -> bool {
        self.inner.lock().status.is_some()
    }

    /// Number of stored ads, expired or not
    pub fn len(&self) -> usize {
        self.inner.lock().ads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Tests
// ============================================================================
