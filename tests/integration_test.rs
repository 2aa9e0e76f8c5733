//! Integration tests for Lobby Link
//!
//! These run real sockets on loopback: a minimal in-process rendezvous relay
//! over TCP and agent negotiation over UDP.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use lobby_link::metrics::Metrics;
use lobby_link::p2p::{AgentPool, AgentState, PoolOptions};
use lobby_link::signaling::{
    decode_frames, encode_frame, SignalSink, SignalingError,
};
use lobby_link::{ClientInfo, Config, GameAd, MessageKind, PeerId, SessionController, SignalMessage, SignalingChannel};

// ============================================================================
// Test relay
// ============================================================================

/// Just enough of a rendezvous server: assigns ids, tracks advertisers,
/// relays everything else with the sender id rewritten. A new client gets
/// the lowest id not in use, so a client that reconnects after another
/// left takes over its identity.
struct Relay {
    addr: SocketAddr,
    state: Arc<Mutex<RelayState>>,
}

#[derive(Default)]
struct RelayState {
    clients: HashMap<PeerId, (TcpStream, bool)>,
}

impl Relay {
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(RelayState::default()));

        let accept_state = state.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let state = accept_state.clone();
                thread::spawn(move || serve_client(stream, state));
            }
        });

        Relay { addr, state }
    }

    fn client_count(&self) -> usize {
        self.state.lock().unwrap().clients.len()
    }
}

fn write_message(stream: &mut TcpStream, msg: &SignalMessage) {
    let frame = encode_frame(msg).unwrap();
    let _ = stream.write_all(&frame);
}

fn serve_client(mut stream: TcpStream, state: Arc<Mutex<RelayState>>) {
    let id = {
        let mut state = state.lock().unwrap();
        let id = (1..=u8::MAX)
            .map(|n| PeerId::from_bytes([n; 16]))
            .find(|id| !state.clients.contains_key(id))
            .unwrap();
        state.clients.insert(id, (stream.try_clone().unwrap(), false));
        id
    };
    write_message(
        &mut stream,
        &SignalMessage::new(PeerId::SERVER, MessageKind::ServerSetClientId, id.to_b64()),
    );

    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match stream.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        buffer.extend_from_slice(&chunk[..n]);
        let (messages, _) = decode_frames(&mut buffer);

        for msg in messages {
            let mut state = state.lock().unwrap();
            match msg.kind {
                MessageKind::StartAdvertising | MessageKind::StopAdvertising => {
                    if let Some(client) = state.clients.get_mut(&id) {
                        client.1 = msg.kind == MessageKind::StartAdvertising;
                    }
                }
                MessageKind::ServerSetClientId => {}
                MessageKind::RequestAdvertisers => {
                    let list: String = state
                        .clients
                        .iter()
                        .filter(|(peer, (_, advertising))| **peer != id && *advertising)
                        .map(|(peer, _)| peer.to_b64())
                        .collect();
                    if !list.is_empty() {
                        let reply =
                            SignalMessage::new(PeerId::SERVER, MessageKind::RequestAdvertisers, list);
                        write_message(&mut stream, &reply);
                    }
                }
                _ => {
                    if let Some((target, _)) = state.clients.get_mut(&msg.peer) {
                        let relayed = SignalMessage::new(id, msg.kind, msg.data.clone());
                        write_message(target, &relayed);
                    }
                }
            }
        }
    }

    state.lock().unwrap().clients.remove(&id);
}

fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

/// Read from a raw server-side stream until a message of `kind` arrives.
/// Returns everything decoded so far, in order.
fn read_until(stream: &mut TcpStream, kind: MessageKind, timeout: Duration) -> Vec<SignalMessage> {
    stream.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
    let deadline = Instant::now() + timeout;
    let mut buffer = Vec::new();
    let mut received = Vec::new();
    let mut chunk = [0u8; 4096];

    while Instant::now() < deadline {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(_) => continue,
        }
        let (messages, _) = decode_frames(&mut buffer);
        received.extend(messages);
        if received.iter().any(|m| m.kind == kind) {
            break;
        }
    }
    received
}

fn loopback_config(server: SocketAddr) -> Config {
    let mut config = Config {
        stun_server: None,
        include_loopback: true,
        ..Config::default()
    };
    config.set_server(&server.to_string()).unwrap();
    config
}

// ============================================================================
// Signaling over TCP
// ============================================================================

#[test]
fn test_frames_split_across_writes() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let msg = SignalMessage::new(PeerId::from_bytes([3; 16]), MessageKind::SolicitAds, "");
        let frame = encode_frame(&msg).unwrap();

        stream.write_all(&frame[..7]).unwrap();
        stream.flush().unwrap();
        thread::sleep(Duration::from_millis(50));
        stream.write_all(&frame[7..]).unwrap();
        stream.write_all(b"{\"broken\": -+").unwrap();
        stream.write_all(&frame).unwrap();
        thread::sleep(Duration::from_millis(200));
    });

    let metrics = Arc::new(Metrics::new());
    let channel = SignalingChannel::new(addr.to_string(), metrics.clone());
    channel.connect().unwrap();

    let mut received = Vec::new();
    while received.len() < 2 {
        received.extend(channel.receive_batch());
    }
    assert!(received.iter().all(|m| m.kind == MessageKind::SolicitAds));
    assert_eq!(Metrics::get(&metrics.parse_failures), 1);

    channel.close();
    server.join().unwrap();
}

#[test]
fn test_advertising_resumes_after_server_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let host = SessionController::connect(&loopback_config(addr), ClientInfo::new(7, 1)).unwrap();

    let (mut first, _) = listener.accept().unwrap();
    let host_id = PeerId::from_bytes([0x42; 16]);
    write_message(
        &mut first,
        &SignalMessage::new(PeerId::SERVER, MessageKind::ServerSetClientId, host_id.to_b64()),
    );
    assert!(wait_for(Duration::from_secs(5), || host.local_id() == Some(host_id)));

    host.start_advertising(GameAd::new("Lonely Host", "", 0, Vec::new()))
        .unwrap();
    let received = read_until(&mut first, MessageKind::StartAdvertising, Duration::from_secs(5));
    assert!(received.iter().any(|m| m.kind == MessageKind::StartAdvertising));

    // The server drops the client and stays silent on the new connection,
    // the way a real rendezvous server greets a reconnecting host
    drop(first);
    let (mut second, _) = listener.accept().unwrap();
    let received = read_until(&mut second, MessageKind::StartAdvertising, Duration::from_secs(5));
    let kinds: Vec<MessageKind> = received.iter().map(|m| m.kind).collect();
    assert_eq!(
        kinds,
        vec![MessageKind::ServerSetClientId, MessageKind::StartAdvertising]
    );
    assert_eq!(received[0].data, host_id.to_b64());
    assert!(host.signaling_ready());
    assert_eq!(Metrics::get(&host.metrics().reconnects), 1);

    // The receive worker is still serving the new connection
    let joiner = PeerId::from_bytes([0x17; 16]);
    write_message(&mut second, &SignalMessage::new(joiner, MessageKind::SolicitAds, ""));
    let received = read_until(&mut second, MessageKind::GameAd, Duration::from_secs(5));
    let reply = received
        .iter()
        .find(|m| m.kind == MessageKind::GameAd)
        .expect("hosted ad sent after reconnect");
    assert_eq!(reply.peer, joiner);
    assert_eq!(GameAd::decode_payload(&reply.data).unwrap().name, "Lonely Host");

    host.shutdown();
}

#[test]
fn test_controller_init_fails_without_server() {
    // Bind then drop to get a port nobody listens on
    let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
    let result = SessionController::connect(&loopback_config(addr), ClientInfo::default());
    assert!(result.is_err());
}

// ============================================================================
// Agent negotiation over loopback
// ============================================================================

/// Carries signals between two pools the way the relay would
struct Courier {
    from: PeerId,
    tx: Mutex<mpsc::Sender<(PeerId, SignalMessage)>>,
}

impl SignalSink for Courier {
    fn send_signal(&self, message: SignalMessage) -> Result<(), SignalingError> {
        let _ = self.tx.lock().unwrap().send((self.from, message));
        Ok(())
    }
}

#[test]
fn test_two_pools_negotiate_and_exchange_data() {
    let id_a = PeerId::from_bytes([0x10; 16]);
    let id_b = PeerId::from_bytes([0x20; 16]);
    let (tx, rx) = mpsc::channel();
    let options = PoolOptions {
        include_loopback: true,
        stun_server: None,
    };

    let make_pool = |id: PeerId| {
        let sink = Arc::new(Courier { from: id, tx: Mutex::new(tx.clone()) });
        let pool = Arc::new(AgentPool::new(options.clone(), sink, Arc::new(Metrics::new())).unwrap());
        pool.set_local_id(id);
        pool.spawn_io().unwrap();
        pool
    };
    let pool_a = make_pool(id_a);
    let pool_b = make_pool(id_b);

    let stop = Arc::new(AtomicBool::new(false));
    let forwarder = {
        let pools: HashMap<PeerId, Arc<AgentPool>> =
            [(id_a, pool_a.clone()), (id_b, pool_b.clone())].into_iter().collect();
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                let Ok((from, msg)) = rx.recv_timeout(Duration::from_millis(20)) else {
                    continue;
                };
                if let Some(pool) = pools.get(&msg.peer) {
                    pool.negotiation_step(from, msg.kind, &msg.data).unwrap();
                }
            }
        })
    };

    pool_a.ping(id_b).unwrap();

    assert!(wait_for(Duration::from_secs(10), || {
        pool_a.peer_status(&id_b).map(|s| s.0) == Some(AgentState::Completed)
            && pool_b.peer_status(&id_a).map(|s| s.0) == Some(AgentState::Completed)
    }));
    // Higher id controls
    assert!(!pool_a.get(&id_b).unwrap().with_agent(|a| a.is_controlling()));
    assert!(pool_b.get(&id_a).unwrap().with_agent(|a| a.is_controlling()));

    pool_a.send_to_peer(&id_b, b"hello from a").unwrap();
    let inbound = pool_b.inbound();
    assert!(inbound.wait(Duration::from_secs(5)));
    let packet = inbound.pop(Instant::now()).unwrap();
    assert_eq!(packet.sender, id_a);
    assert_eq!(packet.data, b"hello from a");

    assert_eq!(pool_b.broadcast(b"to everyone"), 1);
    assert!(pool_a.inbound().wait(Duration::from_secs(5)));

    stop.store(true, Ordering::SeqCst);
    forwarder.join().unwrap();
    pool_a.shutdown();
    pool_b.shutdown();
}

// ============================================================================
// Full sessions through the relay
// ============================================================================

#[test]
fn test_discover_connect_and_send_through_relay() {
    let relay = Relay::start();
    let config = loopback_config(relay.addr);

    let host = SessionController::connect(&config, ClientInfo::new(7, 1)).unwrap();
    assert!(wait_for(Duration::from_secs(5), || host.local_id().is_some()));
    host.start_advertising(GameAd::new("Host Lobby", "stats", 0, vec![9]))
        .unwrap();

    let joiner = SessionController::connect(&config, ClientInfo::new(7, 1)).unwrap();
    assert!(wait_for(Duration::from_secs(5), || joiner.local_id().is_some()));
    assert!(joiner.signaling_ready());

    let host_id = host.local_id().unwrap();
    let joiner_id = joiner.local_id().unwrap();

    // Discovery finds the lobby and negotiation completes on both ends
    assert!(wait_for(Duration::from_secs(15), || {
        joiner.request_discovery();
        thread::sleep(Duration::from_millis(100));
        let listed = joiner
            .advertisements(Instant::now())
            .iter()
            .any(|ad| ad.host == host_id && ad.name.ends_with("Host Lobby"));
        let usable = joiner
            .pool()
            .peer_status(&host_id)
            .map_or(false, |(state, _)| state.is_usable());
        listed && usable
    }));

    let ad = joiner
        .advertisements(Instant::now())
        .into_iter()
        .find(|ad| ad.host == host_id)
        .unwrap();
    assert_eq!(joiner.game_info(ad.sequence_index).map(|a| a.extra), Some(vec![9]));

    assert!(wait_for(Duration::from_secs(5), || {
        host.pool()
            .peer_status(&joiner_id)
            .map_or(false, |(state, _)| state.is_usable())
    }));

    joiner.send(&host_id, b"join request").unwrap();
    assert!(host.wait_inbound(Duration::from_secs(5)));
    let packet = host.receive().unwrap();
    assert_eq!(packet.sender, joiner_id);
    assert_eq!(packet.data, b"join request");

    host.stop_advertising().unwrap();
    joiner.shutdown();
    host.shutdown();
    assert!(!joiner.signaling_ready());
}

/// Join `host` from a fresh session and wait until both ends can send
fn join(config: &Config, host: &SessionController) -> SessionController {
    let host_id = host.local_id().unwrap();
    let joiner = SessionController::connect(config, ClientInfo::new(7, 1)).unwrap();
    assert!(wait_for(Duration::from_secs(5), || joiner.local_id().is_some()));
    let joiner_id = joiner.local_id().unwrap();

    assert!(wait_for(Duration::from_secs(15), || {
        joiner.request_discovery();
        thread::sleep(Duration::from_millis(100));
        // Both ends completed, and on the same negotiation
        match (joiner.pool().get(&host_id), host.pool().get(&joiner_id)) {
            (Some(ours), Some(theirs)) => {
                let session = ours.with_agent(|a| a.session_id());
                ours.state() == AgentState::Completed
                    && theirs.state() == AgentState::Completed
                    && theirs.with_agent(|a| a.remote_session()) == Some(session)
            }
            _ => false,
        }
    }));
    joiner
}

#[test]
fn test_restarted_peer_renegotiates_with_host() {
    let relay = Relay::start();
    let config = loopback_config(relay.addr);

    let host = SessionController::connect(&config, ClientInfo::new(7, 1)).unwrap();
    assert!(wait_for(Duration::from_secs(5), || host.local_id().is_some()));
    host.start_advertising(GameAd::new("Host Lobby", "", 0, Vec::new()))
        .unwrap();

    let joiner = join(&config, &host);
    let joiner_id = joiner.local_id().unwrap();
    let old_agent = host.pool().get(&joiner_id).unwrap();

    // The joiner restarts under the same identity; the host's agent for it
    // still points at the old socket
    joiner.shutdown();
    assert!(wait_for(Duration::from_secs(5), || relay.client_count() == 1));
    let restarted = join(&config, &host);
    assert_eq!(restarted.local_id(), Some(joiner_id));

    let new_agent = host.pool().get(&joiner_id).unwrap();
    assert!(!Arc::ptr_eq(&old_agent, &new_agent));

    // Data flows both ways over the new path
    host.send(&joiner_id, b"welcome back").unwrap();
    assert!(restarted.wait_inbound(Duration::from_secs(5)));
    assert_eq!(restarted.receive().unwrap().data, b"welcome back");

    restarted.send(&host.local_id().unwrap(), b"thanks").unwrap();
    assert!(host.wait_inbound(Duration::from_secs(5)));
    let packet = host.receive().unwrap();
    assert_eq!(packet.sender, joiner_id);
    assert_eq!(packet.data, b"thanks");

    restarted.shutdown();
    host.shutdown();
}
