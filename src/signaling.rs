//! Signaling channel to the rendezvous server
//!
//! One long-lived TCP connection carries every control-plane message:
//! lobby advertising, advertiser discovery, and the out-of-band exchange of
//! ICE descriptions between peers.
//!
//! # Message Framing
//!
//! Each message is a JSON record followed by a two byte delimiter:
//! ```text
//! ┌──────────────────────────────────────────────────────────┬────┐
//! │ {"peer_ID":"<24 char b64>","message_type":N,"data":"..."} │ -+ │
//! └──────────────────────────────────────────────────────────┴────┘
//! ```
//!
//! `peer_ID` is the destination when sending and the originating peer when
//! receiving; the server rewrites it while relaying.
//!
//! # Reconnection
//!
//! Any transport error on the receive path closes the socket and retries
//! `connect` once per second until it succeeds. The retry loop runs on the
//! receiving thread, so no signaling traffic flows while it is reconnecting.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::Metrics;
use crate::peer_id::PeerId;

// ============================================================================
// Constants
// ============================================================================

/// Frame delimiter appended to every serialized message
pub const DELIMITER: &[u8; 2] = b"-+";

/// Size of a single socket read
const RECV_BUF_LEN: usize = 4096;

/// Pending bytes allowed without seeing a delimiter before the buffer is dropped
const MAX_PENDING_BYTES: usize = 1024 * 1024;

/// Delay between reconnect attempts
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Timeout for a single TCP connect attempt
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// `AgentGatheringDone` payload that turns the message into an agent ping.
/// Rendezvous servers only relay the tags they know, so pings share 103.
pub const AGENT_PING_PAYLOAD: &str = "ping";

// ============================================================================
// Signaling Messages
// ============================================================================

/// Kind of a signaling message, with its numeric wire tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum MessageKind {
    /// Client opened a lobby (or server confirms it)
    StartAdvertising = 1,
    /// Client closed its lobby (or server confirms it)
    StopAdvertising = 2,
    /// Ask for (or receive) the list of advertising peers
    RequestAdvertisers = 3,
    /// Ask a peer for its lobby advertisement
    SolicitAds = 4,
    /// A peer's lobby advertisement
    GameAd = 5,
    /// ICE local description (session id + initial candidates)
    AgentLocalDescription = 101,
    /// Trickled ICE candidate
    AgentCandidate = 102,
    /// Remote finished gathering candidates, or an agent ping when the
    /// payload is [`AGENT_PING_PAYLOAD`]
    AgentGatheringDone = 103,
    /// Server assigns (or client re-registers) the client identity
    ServerSetClientId = 254,
    /// Server echo
    ServerEcho = 255,
}

impl MessageKind {
    /// Whether this message belongs to an agent negotiation
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            MessageKind::AgentLocalDescription
                | MessageKind::AgentCandidate
                | MessageKind::AgentGatheringDone
        )
    }
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => MessageKind::StartAdvertising,
            2 => MessageKind::StopAdvertising,
            3 => MessageKind::RequestAdvertisers,
            4 => MessageKind::SolicitAds,
            5 => MessageKind::GameAd,
            101 => MessageKind::AgentLocalDescription,
            102 => MessageKind::AgentCandidate,
            103 => MessageKind::AgentGatheringDone,
            254 => MessageKind::ServerSetClientId,
            255 => MessageKind::ServerEcho,
            other => return Err(format!("unknown message type {}", other)),
        })
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One signaling record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    /// Destination when sending, originating peer when received
    #[serde(rename = "peer_ID")]
    pub peer: PeerId,
    #[serde(rename = "message_type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub data: String,
}

impl SignalMessage {
    pub fn new(peer: PeerId, kind: MessageKind, data: impl Into<String>) -> Self {
        Self {
            peer,
            kind,
            data: data.into(),
        }
    }

    /// Message addressed to the rendezvous server with an empty payload
    pub fn to_server(kind: MessageKind) -> Self {
        Self::new(PeerId::SERVER, kind, String::new())
    }

    /// Agent keep-alive addressed to `peer`
    pub fn agent_ping(peer: PeerId) -> Self {
        Self::new(peer, MessageKind::AgentGatheringDone, AGENT_PING_PAYLOAD)
    }

    pub fn is_agent_ping(&self) -> bool {
        is_agent_ping(self.kind, &self.data)
    }
}

/// Whether a negotiation message is a ping rather than a gathering-done
pub fn is_agent_ping(kind: MessageKind, data: &str) -> bool {
    kind == MessageKind::AgentGatheringDone && data == AGENT_PING_PAYLOAD
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during message encoding
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("payload contains the frame delimiter")]
    DelimiterInPayload,
}

/// Errors that can occur while parsing one framed segment
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed signaling message: {0}")]
    Malformed(String),
}

/// Connection state of the signaling channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Uninitialized,
    Connecting,
    Ready,
    Closed,
}

/// Errors surfaced by the signaling channel
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("could not connect to {address}: {reason}")]
    ConnectFailure { address: String, reason: String },
    #[error("signaling channel not ready (state {0:?})")]
    NotReady(ChannelState),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("signaling i/o error: {0}")]
    Io(#[from] io::Error),
}

// ============================================================================
// Message Encoding/Decoding
// ============================================================================

/// Serialize a message and append the frame delimiter
pub fn encode_frame(msg: &SignalMessage) -> Result<Vec<u8>, EncodeError> {
    let mut buf =
        serde_json::to_vec(msg).map_err(|e| EncodeError::Serialization(e.to_string()))?;

    if find_delimiter(&buf).is_some() {
        return Err(EncodeError::DelimiterInPayload);
    }

    buf.extend_from_slice(DELIMITER);
    Ok(buf)
}

/// Parse a single segment (without delimiter)
pub fn decode_frame(segment: &[u8]) -> Result<SignalMessage, DecodeError> {
    serde_json::from_slice(segment).map_err(|e| DecodeError::Malformed(e.to_string()))
}

/// Decode every complete segment in `buf`, leaving a partial trailing
/// segment in place for the next read.
///
/// Segments that fail to parse are logged and skipped. Returns the parsed
/// messages and the number of skipped segments.
pub fn decode_frames(buf: &mut Vec<u8>) -> (Vec<SignalMessage>, usize) {
    let mut messages = Vec::new();
    let mut failures = 0;
    let mut start = 0;

    while let Some(offset) = find_delimiter(&buf[start..]) {
        let segment = &buf[start..start + offset];
        start += offset + DELIMITER.len();

        if segment.is_empty() {
            continue;
        }

        match decode_frame(segment) {
            Ok(msg) => messages.push(msg),
            Err(e) => {
                failures += 1;
                log::error!(
                    "Skipping signaling segment: {} (segment: {})",
                    e,
                    String::from_utf8_lossy(segment)
                );
            }
        }
    }

    buf.drain(..start);
    (messages, failures)
}

fn find_delimiter(buf: &[u8]) -> Option<usize> {
    buf.windows(DELIMITER.len()).position(|w| w == DELIMITER)
}

// ============================================================================
// Transport Seams
// ============================================================================

/// Outbound half of the signaling channel, handed to the agent pool as its
/// out-of-band courier.
pub trait SignalSink: Send + Sync {
    fn send_signal(&self, message: SignalMessage) -> Result<(), SignalingError>;
}

/// Full signaling transport driven by the session controller
pub trait SignalTransport: SignalSink {
    /// Block until at least one message arrives, or the transport is closed
    fn receive_batch(&self) -> Vec<SignalMessage>;
    fn is_ready(&self) -> bool;
    /// Incremented on every successful (re)connect
    fn generation(&self) -> u64;
    /// Close the transport and unblock `receive_batch`
    fn close(&self);
}

// ============================================================================
// Signaling Channel
// ============================================================================

struct ReaderState {
    stream: Option<TcpStream>,
    buffer: Vec<u8>,
}

/// Wakes the reconnect wait when the channel is closed
struct Wakeup {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Wakeup {
    fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn notify(&self) {
        *self.signaled.lock() = true;
        self.cond.notify_all();
    }

    /// Wait up to `timeout`; true if woken by `notify`
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.signaled.lock();
        while !*signaled {
            if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                break;
            }
        }
        *signaled
    }
}

/// TCP connection to the rendezvous server with transparent reconnection
pub struct SignalingChannel {
    address: String,
    state: Mutex<ChannelState>,
    writer: Mutex<Option<TcpStream>>,
    reader: Mutex<ReaderState>,
    closed: AtomicBool,
    wakeup: Wakeup,
    generation: AtomicU64,
    metrics: Arc<Metrics>,
}

impl SignalingChannel {
    /// Create an unconnected channel for `address` (`host:port`)
    pub fn new(address: impl Into<String>, metrics: Arc<Metrics>) -> Self {
        Self {
            address: address.into(),
            state: Mutex::new(ChannelState::Uninitialized),
            writer: Mutex::new(None),
            reader: Mutex::new(ReaderState {
                stream: None,
                buffer: Vec::new(),
            }),
            closed: AtomicBool::new(false),
            wakeup: Wakeup::new(),
            generation: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolve and connect to the server
    pub fn connect(&self) -> Result<(), SignalingError> {
        let mut rx = self.reader.lock();
        self.open(&mut rx)
    }

    fn open(&self, rx: &mut ReaderState) -> Result<(), SignalingError> {
        log::info!("Connecting to rendezvous server at {}", self.address);
        *self.state.lock() = ChannelState::Connecting;

        let connect_failure = |reason: String| SignalingError::ConnectFailure {
            address: self.address.clone(),
            reason,
        };

        let addrs = self
            .address
            .to_socket_addrs()
            .map_err(|e| connect_failure(e.to_string()))?;

        let mut last_error = None;
        let mut connected = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(e) => {
                    log::debug!("Connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        let stream = connected.ok_or_else(|| {
            connect_failure(
                last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no addresses resolved".to_string()),
            )
        })?;

        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("set_nodelay failed: {}", e);
        }
        let writer = stream
            .try_clone()
            .map_err(|e| connect_failure(e.to_string()))?;

        rx.stream = Some(stream);
        rx.buffer.clear();
        *self.writer.lock() = Some(writer);

        if self.is_closed() {
            self.drop_connection(rx);
            *self.state.lock() = ChannelState::Closed;
            return Err(SignalingError::NotReady(ChannelState::Closed));
        }

        *self.state.lock() = ChannelState::Ready;
        self.generation.fetch_add(1, Ordering::SeqCst);
        log::info!("Connected to rendezvous server at {}", self.address);
        Ok(())
    }

    fn drop_connection(&self, rx: &mut ReaderState) {
        if let Some(stream) = rx.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        rx.buffer.clear();
        self.writer.lock().take();
    }

    /// Close the socket and retry `open` every second until it succeeds or
    /// the channel is closed. Returns true once a new connection is up.
    fn reconnect(&self, rx: &mut ReaderState) -> bool {
        self.drop_connection(rx);
        *self.state.lock() = ChannelState::Connecting;

        loop {
            if self.wakeup.wait(RECONNECT_DELAY) || self.is_closed() {
                return false;
            }
            match self.open(rx) {
                Ok(()) => {
                    Metrics::inc(&self.metrics.reconnects);
                    log::info!("Reconnected to rendezvous server");
                    return true;
                }
                Err(e) => {
                    log::warn!("Reconnect attempt failed: {}", e);
                }
            }
        }
    }

    /// Serialize and write one message. Refused without blocking when the
    /// channel is not ready.
    pub fn send(&self, msg: &SignalMessage) -> Result<(), SignalingError> {
        let state = self.state();
        if state != ChannelState::Ready {
            Metrics::inc(&self.metrics.signal_send_failures);
            log::error!(
                "Signaling send of {} attempted while not ready (state {:?})",
                msg.kind,
                state
            );
            return Err(SignalingError::NotReady(state));
        }

        let frame = encode_frame(msg).map_err(|e| {
            Metrics::inc(&self.metrics.signal_send_failures);
            log::error!("Failed to encode {} for {}: {}", msg.kind, msg.peer, e);
            e
        })?;

        let mut writer = self.writer.lock();
        let stream = writer
            .as_mut()
            .ok_or(SignalingError::NotReady(ChannelState::Connecting))?;

        log::trace!(
            "Sending {} to {} ({} bytes)",
            msg.kind,
            msg.peer,
            frame.len()
        );

        if let Err(e) = stream.write_all(&frame) {
            Metrics::inc(&self.metrics.signal_send_failures);
            log::error!("Signaling send error: {}", e);
            return Err(e.into());
        }

        Metrics::inc(&self.metrics.signals_sent);
        Ok(())
    }

    /// Block until at least one complete message is available.
    ///
    /// Transport failures are handled internally by reconnecting. Returns an
    /// empty batch when the channel is closed, when every complete segment
    /// failed to parse, or right after a reconnect so the caller can restore
    /// server-side state before the server says anything.
    pub fn receive_batch(&self) -> Vec<SignalMessage> {
        let mut rx = self.reader.lock();
        let mut buf = [0u8; RECV_BUF_LEN];

        loop {
            if self.is_closed() {
                return Vec::new();
            }

            let result = match rx.stream.as_mut() {
                Some(stream) => stream.read(&mut buf),
                None => {
                    if self.reconnect(&mut rx) {
                        return Vec::new();
                    }
                    continue;
                }
            };

            match result {
                Ok(0) => {
                    if self.is_closed() {
                        return Vec::new();
                    }
                    log::warn!("Server connection closed, attempting reconnect");
                    if self.reconnect(&mut rx) {
                        return Vec::new();
                    }
                }
                Ok(n) => {
                    log::trace!("Received {} bytes from rendezvous server", n);
                    rx.buffer.extend_from_slice(&buf[..n]);

                    if find_delimiter(&rx.buffer).is_none() {
                        if rx.buffer.len() > MAX_PENDING_BYTES {
                            log::error!(
                                "Dropping {} buffered bytes without a frame delimiter",
                                rx.buffer.len()
                            );
                            Metrics::inc(&self.metrics.parse_failures);
                            rx.buffer.clear();
                        }
                        continue;
                    }

                    let (messages, failures) = decode_frames(&mut rx.buffer);
                    self.metrics
                        .parse_failures
                        .fetch_add(failures as u64, Ordering::Relaxed);
                    self.metrics
                        .signals_received
                        .fetch_add(messages.len() as u64, Ordering::Relaxed);
                    return messages;
                }
                Err(e) if is_routine(&e) => continue,
                Err(e) => {
                    if self.is_closed() {
                        return Vec::new();
                    }
                    log::error!("Signaling receive error: {}, attempting reconnect", e);
                    if self.reconnect(&mut rx) {
                        return Vec::new();
                    }
                }
            }
        }
    }

    /// Close the channel; unblocks a pending `receive_batch`
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.lock() = ChannelState::Closed;
        if let Some(stream) = self.writer.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.wakeup.notify();
        log::info!("Signaling channel closed");
    }
}

/// Receive errors that only mean "no data yet"
fn is_routine(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
    )
}

impl SignalSink for SignalingChannel {
    fn send_signal(&self, message: SignalMessage) -> Result<(), SignalingError> {
        self.send(&message)
    }
}

impl SignalTransport for SignalingChannel {
    fn receive_batch(&self) -> Vec<SignalMessage> {
        SignalingChannel::receive_batch(self)
    }

    fn is_ready(&self) -> bool {
        self.state() == ChannelState::Ready
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn close(&self) {
        SignalingChannel::close(self)
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn peer(n: u8) -> PeerId {
        PeerId::from_bytes([n; 16])
    }

    #[test]
    fn test_frame_roundtrip() {
        let msg = SignalMessage::new(peer(3), MessageKind::GameAd, "aGVsbG8=");

        let mut buf = encode_frame(&msg).unwrap();
        assert!(buf.ends_with(DELIMITER));

        let (messages, failures) = decode_frames(&mut buf);
        assert_eq!(messages, vec![msg]);
        assert_eq!(failures, 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_wire_field_names() {
        let msg = SignalMessage::new(PeerId::SERVER, MessageKind::RequestAdvertisers, "");
        let frame = encode_frame(&msg).unwrap();
        let text = String::from_utf8(frame).unwrap();

        assert!(text.contains("\"peer_ID\":\"/////////////////////w==\""));
        assert!(text.contains("\"message_type\":3"));
        assert!(text.contains("\"data\":\"\""));
    }

    #[test]
    fn test_partial_segment_is_retained() {
        let first = SignalMessage::new(peer(1), MessageKind::SolicitAds, "");
        let second = SignalMessage::agent_ping(peer(2));

        let mut wire = encode_frame(&first).unwrap();
        wire.extend(encode_frame(&second).unwrap());
        let split = wire.len() - 5;

        let mut buf = wire[..split].to_vec();
        let (messages, _) = decode_frames(&mut buf);
        assert_eq!(messages, vec![first]);
        assert!(!buf.is_empty());

        buf.extend_from_slice(&wire[split..]);
        let (messages, _) = decode_frames(&mut buf);
        assert_eq!(messages, vec![second]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_malformed_segment_skipped() {
        let good = SignalMessage::new(peer(4), MessageKind::GameAd, "e30=");

        let mut buf = b"{\"peer_ID\": 12, garbage".to_vec();
        buf.extend_from_slice(DELIMITER);
        buf.extend(encode_frame(&good).unwrap());

        let (messages, failures) = decode_frames(&mut buf);
        assert_eq!(messages, vec![good]);
        assert_eq!(failures, 1);
    }

    #[test]
    fn test_unknown_message_type_is_malformed() {
        let segment = format!(
            "{{\"peer_ID\":\"{}\",\"message_type\":42,\"data\":\"\"}}",
            peer(1)
        );
        assert!(decode_frame(segment.as_bytes()).is_err());
    }

    #[test]
    fn test_empty_segments_ignored() {
        let mut buf = b"-+-+".to_vec();
        let (messages, failures) = decode_frames(&mut buf);
        assert!(messages.is_empty());
        assert_eq!(failures, 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_agent_ping_rides_on_gathering_done() {
        let ping = SignalMessage::agent_ping(peer(3));
        assert_eq!(u8::from(ping.kind), 103);
        assert!(ping.is_agent_ping());
        assert!(!SignalMessage::new(peer(3), MessageKind::AgentGatheringDone, "").is_agent_ping());

        // 104 is not a tag rendezvous servers understand
        let segment = format!(
            "{{\"peer_ID\":\"{}\",\"message_type\":104,\"data\":\"\"}}",
            peer(1)
        );
        assert!(decode_frame(segment.as_bytes()).is_err());
    }

    #[test]
    fn test_delimiter_in_payload_rejected() {
        let msg = SignalMessage::new(peer(1), MessageKind::GameAd, "a-+b");
        assert_eq!(encode_frame(&msg), Err(EncodeError::DelimiterInPayload));
    }

    #[test]
    fn test_message_kind_tags() {
        assert_eq!(u8::from(MessageKind::StartAdvertising), 1);
        assert_eq!(u8::from(MessageKind::AgentLocalDescription), 101);
        assert_eq!(u8::from(MessageKind::ServerSetClientId), 254);
        assert_eq!(MessageKind::try_from(103), Ok(MessageKind::AgentGatheringDone));
        assert!(MessageKind::try_from(6).is_err());
        assert!(MessageKind::AgentGatheringDone.is_negotiation());
        assert!(!MessageKind::GameAd.is_negotiation());
    }

    #[test]
    fn test_send_when_not_ready() {
        let metrics = Arc::new(Metrics::new());
        let channel = SignalingChannel::new("127.0.0.1:1", metrics.clone());

        let result = channel.send(&SignalMessage::to_server(MessageKind::StartAdvertising));
        assert!(matches!(
            result,
            Err(SignalingError::NotReady(ChannelState::Uninitialized))
        ));
        assert_eq!(Metrics::get(&metrics.signal_send_failures), 1);
    }

    #[test]
    fn test_connect_failure() {
        // Bind then drop to get a port with nothing listening
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let channel = SignalingChannel::new(format!("127.0.0.1:{}", port), Arc::new(Metrics::new()));

        assert!(matches!(
            channel.connect(),
            Err(SignalingError::ConnectFailure { .. })
        ));
        assert_ne!(channel.state(), ChannelState::Ready);
    }

    #[test]
    fn test_send_and_receive_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let channel = SignalingChannel::new(addr.to_string(), Arc::new(Metrics::new()));
        channel.connect().unwrap();
        assert_eq!(channel.state(), ChannelState::Ready);

        let (mut server_side, _) = listener.accept().unwrap();

        // Client -> server
        let outgoing = SignalMessage::to_server(MessageKind::RequestAdvertisers);
        channel.send(&outgoing).unwrap();
        let mut received = vec![0u8; 256];
        let n = server_side.read(&mut received).unwrap();
        let mut raw = received[..n].to_vec();
        let (parsed, _) = decode_frames(&mut raw);
        assert_eq!(parsed, vec![outgoing]);

        // Server -> client, one good and one malformed segment
        let incoming = SignalMessage::new(peer(8), MessageKind::SolicitAds, "");
        let mut wire = encode_frame(&incoming).unwrap();
        wire.extend_from_slice(b"not json-+");
        server_side.write_all(&wire).unwrap();

        let batch = channel.receive_batch();
        assert_eq!(batch, vec![incoming]);
        assert_eq!(Metrics::get(&channel.metrics.parse_failures), 1);
    }

    #[test]
    fn test_reconnect_after_remote_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let metrics = Arc::new(Metrics::new());
        let channel = Arc::new(SignalingChannel::new(addr.to_string(), metrics.clone()));
        channel.connect().unwrap();
        assert_eq!(SignalTransport::generation(&*channel), 1);

        let receiver = {
            let channel = channel.clone();
            thread::spawn(move || channel.receive_batch())
        };

        // First connection is dropped by the server
        let (first, _) = listener.accept().unwrap();
        drop(first);

        // Client reconnects and hands back an empty batch before the server
        // has sent anything
        let (mut second, _) = listener.accept().unwrap();
        let batch = receiver.join().unwrap();
        assert!(batch.is_empty());
        assert_eq!(channel.state(), ChannelState::Ready);
        assert_eq!(SignalTransport::generation(&*channel), 2);
        assert_eq!(Metrics::get(&metrics.reconnects), 1);

        // The new connection delivers messages
        let msg = SignalMessage::new(peer(5), MessageKind::GameAd, "");
        second.write_all(&encode_frame(&msg).unwrap()).unwrap();
        assert_eq!(channel.receive_batch(), vec![msg]);
    }

    #[test]
    fn test_close_unblocks_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let channel = Arc::new(SignalingChannel::new(addr.to_string(), Arc::new(Metrics::new())));
        channel.connect().unwrap();
        let (_server_side, _) = listener.accept().unwrap();

        let receiver = {
            let channel = channel.clone();
            thread::spawn(move || channel.receive_batch())
        };

        thread::sleep(Duration::from_millis(100));
        channel.close();

        let batch = receiver.join().unwrap();
        assert!(batch.is_empty());
        assert_eq!(channel.state(), ChannelState::Closed);
    }
}
