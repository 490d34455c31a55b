pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod models;
pub mod network;
pub mod room;
pub mod state;
pub mod sync;

use std::path::PathBuf;
use std::sync::Arc;

use libp2p::identity::Keypair;
use libp2p::PeerId;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::events::create_event_bus;
use crate::media::{AudioBackend, RtcConnector};
use crate::network::{RoomTransport, SwarmTransport};
use crate::room::{RoomCommand, RoomIdentity, RoomSession, SessionParts, COMMAND_QUEUE};
use crate::state::ServiceContext;
use crate::sync::{SharedClock, SystemClock, VirtualPlayer};

/// Command-line choices for one headless run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub room: Option<String>,
    pub name: String,
    pub host: bool,
    pub port: Option<u16>,
    pub config: Option<PathBuf>,
    pub dial: Vec<String>,
}

/// Install the fmt subscriber; `RUST_LOG` overrides the default `info` level.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Short shareable room code without look-alike characters.
pub fn generate_room_code() -> String {
    let chars: Vec<char> = "ABCDEFGHJKMNPQRSTUVWXYZ23456789".chars().collect();
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| chars[rng.gen_range(0..chars.len())])
        .collect()
}

#[cfg(feature = "audio-io")]
fn audio_backend() -> Arc<dyn AudioBackend> {
    Arc::new(crate::media::audio::CpalAudio::new())
}

#[cfg(not(feature = "audio-io"))]
fn audio_backend() -> Arc<dyn AudioBackend> {
    info!("Built without audio-io; microphone and speakers are disabled");
    Arc::new(crate::media::NullAudio)
}

/// Spawn the libp2p swarm and hand back a transport bound to it.
fn spawn_network(config: &Config) -> Result<Arc<dyn RoomTransport>, Box<dyn std::error::Error>> {
    let keypair = Keypair::generate_ed25519();
    info!("Network peer id: {}", PeerId::from(keypair.public()));
    let swarm = network::swarm::build_swarm(&keypair, &config.network)?;

    let (network_tx, network_rx) = mpsc::channel(256);
    let network_config = config.network.clone();
    tokio::spawn(async move {
        network::swarm::run_event_loop(swarm, network_rx, network_config).await;
    });
    Ok(Arc::new(SwarmTransport::new(network_tx)))
}

/// Run one room session with the control API until the room is left.
pub async fn run_headless(opts: RunOptions) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::load(opts.config.as_deref())?;
    if let Some(port) = opts.port {
        config.api.port = port;
    }
    config.network.dial.extend(opts.dial);

    let room_code = match opts.room {
        Some(code) => code,
        None if opts.host => generate_room_code(),
        None => return Err("a room code is required unless hosting".into()),
    };
    let identity = RoomIdentity::new(room_code, opts.name, opts.host);
    info!(
        "Joining room {} as {}{}",
        identity.room_code,
        identity.display_name,
        if identity.is_host { " (host)" } else { "" }
    );

    let (event_tx, _event_rx) = create_event_bus();
    let clock: SharedClock = Arc::new(SystemClock);
    let transport = spawn_network(&config)?;
    let connector = Arc::new(RtcConnector::new(config.voice.ice_servers.clone())?);

    let parts = SessionParts {
        transport,
        connector,
        audio: audio_backend(),
        clock: clock.clone(),
        player: Box::new(VirtualPlayer::with_events(clock, event_tx.clone())),
        events: event_tx.clone(),
    };
    let (session, peer_rx) = RoomSession::new(identity.clone(), config.clone(), parts);

    let (room_tx, room_rx) = mpsc::channel(COMMAND_QUEUE);
    let ctx = ServiceContext {
        room_code: identity.room_code.clone(),
        client_id: identity.client_id.clone(),
        room_tx: room_tx.clone(),
        event_tx,
    };

    let port = config.api.port;
    let api = tokio::spawn(async move {
        if let Err(e) = api::server::start_api_server(ctx, port).await {
            warn!("API server stopped: {}", e);
        }
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted; leaving the room");
            let _ = room_tx.send(RoomCommand::Leave).await;
        }
    });

    info!("Running headless");
    let result = room::run_room_session(session, peer_rx, room_rx).await;
    api.abort();
    result?;
    Ok(())
}
