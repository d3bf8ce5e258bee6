//! Latency probe for the relay server
//!
//! Connects to the control channel, negotiates an unreliable data channel
//! and sends sequence-numbered pings at a fixed rate. Every echo is matched
//! to its ping and the round-trip distribution is printed at the end.
//!
//! ```bash
//! cargo run -p gamelink-server --bin relay-probe -- --url ws://127.0.0.1:8080
//!
//! # Same measurement over the WebSocket control channel, for comparison
//! cargo run -p gamelink-server --bin relay-probe -- --path control
//! ```

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use gamelink_webrtc::signaling::{ClientMessage, OutboundMessage};
use gamelink_webrtc::IceCandidate;
use hdrhistogram::Histogram;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Echo (sequence number, arrival time)
type Echo = (u64, Instant);

#[derive(Parser, Debug)]
#[command(author, version, about = "Measure round trips through a gamelink relay", long_about = None)]
struct Args {
    /// Control channel URL
    #[arg(long, default_value = "ws://127.0.0.1:8080")]
    url: String,

    /// Which path the pings travel
    #[arg(long, value_enum, default_value = "data-channel")]
    path: ProbePath,

    /// Pings per second
    #[arg(long, default_value_t = 20)]
    rate: u32,

    /// How long to keep pinging
    #[arg(long, default_value_t = 10)]
    duration_secs: u64,

    /// STUN servers (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "stun:stun.l.google.com:19302")]
    stun_servers: Vec<String>,

    /// Time to wait for late echoes after the last ping
    #[arg(long, default_value_t = 1000)]
    grace_ms: u64,

    /// Time allowed for the data channel to open
    #[arg(long, default_value_t = 10)]
    open_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum ProbePath {
    /// Unreliable WebRTC data channel
    DataChannel,
    /// WebSocket control channel `ping` messages
    Control,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.rate == 0 {
        bail!("--rate must be at least 1");
    }

    let (ws, _response) = connect_async(args.url.as_str())
        .await
        .with_context(|| format!("connecting to {}", args.url))?;
    info!(url = %args.url, path = ?args.path, "Connected to relay");

    let report = match args.path {
        ProbePath::Control => probe_control(ws, &args).await?,
        ProbePath::DataChannel => probe_data_channel(ws, &args).await?,
    };

    report.print();
    Ok(())
}

async fn probe_control(ws: WsStream, args: &Args) -> anyhow::Result<Report> {
    let (mut sink, mut stream) = ws.split();
    let (echo_tx, mut echo_rx) = mpsc::unbounded_channel::<Echo>();

    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = stream.next().await {
            let Message::Text(text) = msg else { continue };
            match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Ping(payload)) => {
                    if let Some(seq) = parse_seq(&payload) {
                        let _ = echo_tx.send((seq, Instant::now()));
                    }
                }
                _ => debug!(message = %text, "Ignoring control message"),
            }
        }
    });

    let mut sent = Vec::new();
    let mut ticker = tokio::time::interval(ping_interval(args.rate));
    let pings = total_pings(args);
    for seq in 0..pings {
        ticker.tick().await;
        let ping = ClientMessage::Ping(Value::String(seq.to_string())).to_json()?;
        sent.push(Instant::now());
        sink.send(Message::Text(ping)).await?;
    }

    tokio::time::sleep(Duration::from_millis(args.grace_ms)).await;
    let _ = sink.close().await;
    reader.abort();

    Report::collect(&sent, &mut echo_rx)
}

async fn probe_data_channel(ws: WsStream, args: &Args) -> anyhow::Result<Report> {
    let (sink, stream) = ws.split();

    let pc = new_peer_connection(&args.stun_servers).await?;
    let channel = pc
        .create_data_channel(
            "dc",
            Some(RTCDataChannelInit {
                ordered: Some(false),
                max_retransmits: Some(0),
                ..Default::default()
            }),
        )
        .await?;

    let opened = Arc::new(Notify::new());
    let (echo_tx, mut echo_rx) = mpsc::unbounded_channel::<Echo>();
    wire_channel(&channel, Arc::clone(&opened), echo_tx);

    // Single writer so the offer always precedes trickled candidates
    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(write_control(sink, out_rx));

    let candidate_tx = out_tx.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let candidate_tx = candidate_tx.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => {
                    let message = ClientMessage::Candidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    });
                    if let Ok(json) = message.to_json() {
                        let _ = candidate_tx.send(json);
                    }
                }
                Err(e) => warn!("Failed to serialize local candidate: {}", e),
            }
        })
    }));

    let offer = pc.create_offer(None).await?;
    out_tx.send(ClientMessage::offer(offer.sdp.clone()).to_json()?)?;
    pc.set_local_description(offer).await?;

    let reader = tokio::spawn(read_control(stream, Arc::clone(&pc)));

    tokio::time::timeout(Duration::from_secs(args.open_timeout_secs), opened.notified())
        .await
        .map_err(|_| anyhow!("data channel did not open within {}s", args.open_timeout_secs))?;
    info!("Data channel open, sending {} pings", total_pings(args));

    let mut sent = Vec::new();
    let mut ticker = tokio::time::interval(ping_interval(args.rate));
    for seq in 0..total_pings(args) {
        ticker.tick().await;
        sent.push(Instant::now());
        if let Err(e) = channel.send_text(seq.to_string()).await {
            warn!(seq, "Send failed: {}", e);
        }
    }

    tokio::time::sleep(Duration::from_millis(args.grace_ms)).await;

    reader.abort();
    drop(out_tx);
    writer.abort();
    if let Err(e) = pc.close().await {
        debug!("Peer connection close: {}", e);
    }

    Report::collect(&sent, &mut echo_rx)
}

async fn new_peer_connection(stun_servers: &[String]) -> anyhow::Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let registry = register_default_interceptors(Default::default(), &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: stun_servers.to_vec(),
            ..Default::default()
        }],
        ..Default::default()
    };

    Ok(Arc::new(api.new_peer_connection(config).await?))
}

fn wire_channel(
    channel: &Arc<RTCDataChannel>,
    opened: Arc<Notify>,
    echoes: mpsc::UnboundedSender<Echo>,
) {
    channel.on_open(Box::new(move || {
        Box::pin(async move {
            opened.notify_one();
        })
    }));

    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let echoes = echoes.clone();
        Box::pin(async move {
            let arrived = Instant::now();
            match std::str::from_utf8(&msg.data).ok().and_then(|s| s.parse().ok()) {
                Some(seq) => {
                    let _ = echoes.send((seq, arrived));
                }
                None => debug!(len = msg.data.len(), "Unrecognized echo"),
            }
        })
    }));
}

async fn write_control(
    mut sink: SplitSink<WsStream, Message>,
    mut outgoing: mpsc::UnboundedReceiver<String>,
) {
    while let Some(text) = outgoing.recv().await {
        if sink.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_control(mut stream: SplitStream<WsStream>, pc: Arc<RTCPeerConnection>) {
    while let Some(Ok(msg)) = stream.next().await {
        let Message::Text(text) = msg else { continue };
        let message = match serde_json::from_str::<OutboundMessage>(&text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Unparseable control message: {}", e);
                continue;
            }
        };

        match message {
            OutboundMessage::Answer(answer) => {
                let result = match RTCSessionDescription::answer(answer.sdp) {
                    Ok(description) => pc.set_remote_description(description).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => info!("Answer applied"),
                    Err(e) => warn!("Failed to apply answer: {}", e),
                }
            }
            OutboundMessage::Candidate(candidate) => {
                let init = RTCIceCandidateInit {
                    candidate: candidate.candidate,
                    sdp_mid: candidate.sdp_mid,
                    sdp_mline_index: candidate.sdp_mline_index,
                    username_fragment: candidate.username_fragment,
                };
                if let Err(e) = pc.add_ice_candidate(init).await {
                    warn!("Failed to add remote candidate: {}", e);
                }
            }
            OutboundMessage::Error(error) => {
                warn!(code = %error.code, "Relay reported: {}", error.message);
            }
        }
    }
}

fn parse_seq(payload: &Value) -> Option<u64> {
    match payload {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

fn ping_interval(rate: u32) -> Duration {
    Duration::from_secs(1) / rate
}

fn total_pings(args: &Args) -> u64 {
    args.duration_secs * u64::from(args.rate)
}

/// Round-trip summary
struct Report {
    sent: usize,
    received: usize,
    histogram: Histogram<u64>,
}

impl Report {
    fn collect(
        sent: &[Instant],
        echoes: &mut mpsc::UnboundedReceiver<Echo>,
    ) -> anyhow::Result<Report> {
        let mut histogram = Histogram::<u64>::new_with_max(60_000_000, 3)
            .map_err(|e| anyhow!("histogram: {:?}", e))?;
        let mut seen = vec![false; sent.len()];

        while let Ok((seq, arrived)) = echoes.try_recv() {
            let Some(sent_at) = usize::try_from(seq).ok().and_then(|i| sent.get(i)) else {
                continue;
            };
            let index = seq as usize;
            if seen[index] {
                continue;
            }
            seen[index] = true;

            let rtt_us = arrived.saturating_duration_since(*sent_at).as_micros() as u64;
            histogram
                .record(rtt_us.max(1))
                .map_err(|e| anyhow!("histogram: {:?}", e))?;
        }

        Ok(Report {
            sent: sent.len(),
            received: seen.iter().filter(|s| **s).count(),
            histogram,
        })
    }

    fn print(&self) {
        let lost = self.sent - self.received;
        println!("pings sent:     {}", self.sent);
        println!("echoes matched: {}", self.received);
        println!(
            "lost:           {} ({:.1}%)",
            lost,
            if self.sent == 0 {
                0.0
            } else {
                lost as f64 * 100.0 / self.sent as f64
            }
        );

        if self.histogram.is_empty() {
            println!("no round trips recorded");
            return;
        }

        let ms = |us: u64| us as f64 / 1000.0;
        println!("rtt min:  {:.2} ms", ms(self.histogram.min()));
        println!("rtt mean: {:.2} ms", self.histogram.mean() / 1000.0);
        println!("rtt p50:  {:.2} ms", ms(self.histogram.value_at_quantile(0.5)));
        println!("rtt p99:  {:.2} ms", ms(self.histogram.value_at_quantile(0.99)));
        println!("rtt max:  {:.2} ms", ms(self.histogram.max()));
    }
}
