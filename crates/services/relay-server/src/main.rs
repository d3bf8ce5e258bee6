//! Relay server binary entry point
//!
//! Serves the WebSocket control channel, answers WebRTC offers and echoes
//! every data channel payload back to its sender.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: ws://0.0.0.0:8080, Google STUN, unordered zero-retransmit channel
//! cargo run -p gamelink-server --bin relay-server
//!
//! # Bound negotiation time and session count
//! cargo run -p gamelink-server --bin relay-server -- \
//!   --port 9000 \
//!   --negotiation-timeout-secs 20 \
//!   --max-sessions 64
//!
//! # Add a TURN relay
//! cargo run -p gamelink-server --bin relay-server -- \
//!   --turn-server alice:secret@turn:turn.example.com:3478
//!
//! # Whole configuration from a JSON file
//! cargo run -p gamelink-server --bin relay-server -- --config relay.json
//! ```

use anyhow::{anyhow, Context};
use clap::Parser;
use gamelink_webrtc::{
    DataChannelMode, EchoRelay, EngineRuntime, RelayConfig, SignalingCoordinator,
    TurnServerConfig, WebRtcEngine, WebSocketSignalingServer,
};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// gamelink relay server
///
/// Negotiates unreliable WebRTC data channels over a WebSocket control
/// channel and echoes game state updates.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Control channel bind address
    #[arg(long, default_value = "0.0.0.0", env = "GAMELINK_BIND_ADDRESS")]
    bind_address: IpAddr,

    /// Control channel port
    #[arg(short, long, default_value_t = 8080, env = "GAMELINK_PORT")]
    port: u16,

    /// STUN servers (comma-separated)
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "stun:stun.l.google.com:19302",
        env = "GAMELINK_STUN_SERVERS"
    )]
    stun_servers: Vec<String>,

    /// TURN server as `username:credential@turn:host:port` (repeatable)
    #[arg(long = "turn-server", value_parser = parse_turn_server)]
    turn_servers: Vec<TurnServerConfig>,

    /// Data channel reliability
    #[arg(long, value_enum, default_value = "unreliable", env = "GAMELINK_CHANNEL_MODE")]
    channel_mode: ChannelMode,

    /// Label of the data channel created while answering
    #[arg(long, default_value = "dc")]
    channel_label: String,

    /// Maximum concurrent sessions (0 = unlimited)
    #[arg(long, default_value_t = 0, env = "GAMELINK_MAX_SESSIONS")]
    max_sessions: usize,

    /// Tear down sessions whose data channel is not open after this many seconds
    #[arg(long, env = "GAMELINK_NEGOTIATION_TIMEOUT_SECS")]
    negotiation_timeout_secs: Option<u64>,

    /// Buffer candidates that arrive before the offer instead of rejecting them
    #[arg(long, default_value_t = false)]
    buffer_early_candidates: bool,

    /// Most candidates buffered per connection before its offer
    #[arg(long, default_value_t = 32, env = "GAMELINK_MAX_PENDING_CANDIDATES")]
    max_pending_candidates: usize,

    /// Worker threads of the WebRTC engine runtime
    #[arg(long, default_value_t = 2, env = "GAMELINK_ENGINE_THREADS")]
    engine_threads: usize,

    /// JSON configuration file; replaces every option above
    #[arg(long, env = "GAMELINK_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false, env = "GAMELINK_JSON_LOGS")]
    json_logs: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum ChannelMode {
    /// Unordered, zero retransmits
    Unreliable,
    /// Ordered, retransmitted until delivered
    Reliable,
}

impl From<ChannelMode> for DataChannelMode {
    fn from(mode: ChannelMode) -> Self {
        match mode {
            ChannelMode::Unreliable => DataChannelMode::Unreliable,
            ChannelMode::Reliable => DataChannelMode::Reliable,
        }
    }
}

fn parse_turn_server(value: &str) -> Result<TurnServerConfig, String> {
    let (credentials, url) = value
        .split_once('@')
        .ok_or_else(|| "expected username:credential@turn:host:port".to_string())?;
    let (username, credential) = credentials
        .split_once(':')
        .ok_or_else(|| "expected username:credential before '@'".to_string())?;

    Ok(TurnServerConfig {
        url: url.to_string(),
        username: username.to_string(),
        credential: credential.to_string(),
    })
}

impl Args {
    fn relay_config(&self) -> anyhow::Result<RelayConfig> {
        if let Some(path) = &self.config {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            return serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()));
        }

        Ok(RelayConfig {
            bind_address: self.bind_address,
            listen_port: self.port,
            stun_servers: self.stun_servers.clone(),
            turn_servers: self.turn_servers.clone(),
            data_channel_label: self.channel_label.clone(),
            data_channel_mode: self.channel_mode.into(),
            max_sessions: self.max_sessions,
            negotiation_timeout_secs: self.negotiation_timeout_secs,
            buffer_early_candidates: self.buffer_early_candidates,
            max_pending_candidates: self.max_pending_candidates,
            engine_worker_threads: self.engine_threads,
        })
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Second Ctrl+C forces exit
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        if shutdown_flag_handler.swap(true, Ordering::SeqCst) {
            eprintln!("Shutdown already in progress, forcing exit");
            std::process::exit(1);
        }
        eprintln!("\nCtrl+C received, shutting down...");
    })
    .map_err(|e| anyhow!("failed to set Ctrl+C handler: {}", e))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("gamelink-control")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(args: Args, shutdown_flag: Arc<AtomicBool>) -> anyhow::Result<()> {
    init_tracing(args.json_logs);

    let config = args.relay_config()?;
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen_addr(),
        stun_servers = config.stun_servers.len(),
        turn_servers = config.turn_servers.len(),
        channel_mode = ?config.data_channel_mode,
        max_sessions = config.max_sessions,
        negotiation_timeout_secs = ?config.negotiation_timeout_secs,
        "gamelink relay server starting"
    );

    // Transport-engine context: its own thread pool, separate from the
    // control channel runtime.
    let engine_runtime = EngineRuntime::start(config.engine_worker_threads)?;
    let engine = Arc::new(WebRtcEngine::new(engine_runtime.handle())?);

    let listen_addr = config.listen_addr();
    let (coordinator, events) = SignalingCoordinator::new(config, engine, Arc::new(EchoRelay));
    let (handle, coordinator_task) = coordinator.spawn(events);

    let server = WebSocketSignalingServer::new(listen_addr, handle.clone())
        .start()
        .await?;

    info!(
        "Relay server running on ws://{}. Press Ctrl+C to shutdown.",
        server.local_addr()
    );

    while !shutdown_flag.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }

    info!("Shutdown signal received, cleaning up...");

    server.shutdown().await;
    let _ = handle.shutdown();
    let _ = coordinator_task.await;
    tokio::task::spawn_blocking(move || engine_runtime.shutdown()).await?;

    info!("Relay server shut down gracefully");
    Ok(())
}

fn init_tracing(json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
