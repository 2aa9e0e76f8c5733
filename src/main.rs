//! Lobby Link command line client
//!
//! Plays the part of the embedding game for manual testing:
//! - Connects to the rendezvous server
//! - Optionally hosts a lobby
//! - Refreshes discovery once a second and logs the lobby list
//! - Logs game data received from peers

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lobby_link::{ClientInfo, Config, GameAd, SessionController};

const DISCOVERY_INTERVAL: Duration = Duration::from_secs(1);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    let args: Vec<String> = std::env::args().collect();

    // --server <host:port>  Rendezvous server address
    // --stun <host:port>    STUN server for reflexive candidates
    // --no-stun             Skip STUN entirely
    // --loopback            Offer loopback candidates (same-machine testing)
    // --product <n>         Product code stamped on hosted ads
    // --version <n>         Version stamped on hosted ads
    // --advertise <name>    Host a lobby with this name

    let mut config = Config::from_env()?;
    if let Some(server) = parse_arg(&args, "--server") {
        config.set_server(&server)?;
    }
    if let Some(stun) = parse_arg(&args, "--stun") {
        config.stun_server = Some(stun);
    }
    if has_flag(&args, "--no-stun") {
        config.stun_server = None;
    }
    if has_flag(&args, "--loopback") {
        config.include_loopback = true;
    }

    let product = parse_arg(&args, "--product")
        .map(|p| p.parse::<u32>())
        .transpose()
        .map_err(|_| "Invalid product code")?
        .unwrap_or(0);
    let version = parse_arg(&args, "--version")
        .map(|v| v.parse::<u32>())
        .transpose()
        .map_err(|_| "Invalid version")?
        .unwrap_or(0);
    let advertise = parse_arg(&args, "--advertise");

    log::info!("Lobby Link starting...");
    log::info!("  Server:   {}", config.server_address());
    log::info!("  STUN:     {}", config.stun_server.as_deref().unwrap_or("disabled"));
    log::info!("  Loopback: {}", config.include_loopback);
    log::info!("  Client:   product {} version {}", product, version);

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    let session = SessionController::connect(&config, ClientInfo::new(product, version))?;

    if let Some(name) = advertise {
        let ad = GameAd::new(name, "", 0, Vec::new());
        if let Err(e) = session.start_advertising(ad) {
            log::warn!("Could not announce lobby yet: {}", e);
        }
    }

    let mut last_discovery: Option<Instant> = None;
    while !shutdown.load(Ordering::Relaxed) {
        if last_discovery.map_or(true, |t| t.elapsed() >= DISCOVERY_INTERVAL) {
            last_discovery = Some(Instant::now());
            session.request_discovery();

            for ad in session.advertisements(Instant::now()) {
                log::info!("  #{} {} (host {})", ad.sequence_index, ad.name, ad.host);
            }
        }

        if session.wait_inbound(Duration::from_millis(100)) {
            for packet in session.drain_inbound() {
                log::info!("{} bytes from {}", packet.data.len(), packet.sender);
            }
        }
    }

    log::info!("Shutdown requested");
    session.shutdown();
    log::info!("Final metrics:\n{}", session.metrics().render());
    Ok(())
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}
