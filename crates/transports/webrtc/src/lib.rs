//! gamelink: WebSocket-negotiated WebRTC data channels
//!
//! Game clients negotiate an unordered, zero-retransmit WebRTC data channel
//! over a WebSocket control channel, then move all real-time traffic onto
//! that channel. The server side answers offers, trickles ICE candidates
//! both ways and relays channel payloads according to a [`RelayPolicy`]
//! (echo by default).
//!
//! # Architecture
//!
//! - [`signaling::SignalingCoordinator`] is the protocol state machine. It is
//!   the single owner of the [`SessionRegistry`]; control-channel commands and
//!   transport engine events are both delivered to its task.
//! - [`engine`] is the boundary to the peer transport. [`WebRtcEngine`] runs
//!   webrtc-rs on its own runtime ([`EngineRuntime`]) and reports every
//!   completion as an [`EngineEvent`].
//! - [`signaling::websocket`] serves the control channel.
//!
//! # Example
//!
//! ```no_run
//! use gamelink_webrtc::{
//!     EchoRelay, EngineRuntime, RelayConfig, SignalingCoordinator, WebRtcEngine,
//!     WebSocketSignalingServer,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> gamelink_webrtc::Result<()> {
//! let config = RelayConfig::default();
//! config.validate()?;
//!
//! let runtime = EngineRuntime::start(config.engine_worker_threads)?;
//! let engine = Arc::new(WebRtcEngine::new(runtime.handle())?);
//! let listen_addr = config.listen_addr();
//!
//! let (coordinator, events) = SignalingCoordinator::new(config, engine, Arc::new(EchoRelay));
//! let (handle, _task) = coordinator.spawn(events);
//!
//! let server = WebSocketSignalingServer::new(listen_addr, handle).start().await?;
//! println!("listening on {}", server.local_addr());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod relay;
pub mod session;
pub mod signaling;

pub use config::{DataChannelMode, RelayConfig, TurnServerConfig};
pub use engine::{
    ChannelId, ChannelOrigin, ChannelPayload, DataChannel, EngineEvent, EngineRuntime, IceCandidate,
    PeerConnection, TransportEngine, WebRtcEngine,
};
pub use error::{Error, Result};
pub use relay::{EchoRelay, RelayPolicy};
pub use session::{ConnectionId, NegotiationPhase, SessionKey, SessionRegistry, SessionSnapshot};
pub use signaling::{
    CoordinatorHandle, SignalingCoordinator, WebSocketServerHandle, WebSocketSignalingServer,
};
