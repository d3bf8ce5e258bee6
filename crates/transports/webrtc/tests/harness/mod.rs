//! Signaling test harness
//!
//! Provides:
//! - [`MockEngine`]: a transport engine that records every call instead of
//!   touching the network, with optional automatic answers
//! - [`SignalingFixture`]: a coordinator driven synchronously, with helpers to
//!   connect clients and read what they were sent

#![allow(dead_code)]

pub mod mock_engine;

use gamelink_webrtc::engine::EngineEventReceiver;
use gamelink_webrtc::signaling::{Command, SignalingCoordinator};
use gamelink_webrtc::{
    ConnectionId, EchoRelay, EngineEvent, NegotiationPhase, RelayConfig, SessionKey,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub use mock_engine::{EngineCall, MockChannel, MockEngine};

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Error type for harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

/// Initialize test logging (safe to call from every test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,gamelink_webrtc=debug")
        .with_test_writer()
        .try_init();
}

/// Coordinator plus mock engine, driven without a runtime
pub struct SignalingFixture {
    pub engine: MockEngine,
    pub coordinator: SignalingCoordinator,
    _events: EngineEventReceiver,
}

impl SignalingFixture {
    pub fn new() -> Self {
        Self::with_config(RelayConfig::default())
    }

    pub fn with_config(config: RelayConfig) -> Self {
        let engine = MockEngine::new();
        let (coordinator, events) =
            SignalingCoordinator::new(config, Arc::new(engine.clone()), Arc::new(EchoRelay));
        Self {
            engine,
            coordinator,
            _events: events,
        }
    }

    /// Register a new control-channel connection
    pub fn connect(&mut self) -> (ConnectionId, mpsc::UnboundedReceiver<String>) {
        let connection = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.coordinator.handle_command(Command::Connected {
            connection,
            outbox: tx,
        });
        (connection, rx)
    }

    pub fn send_text(&mut self, connection: ConnectionId, text: &str) {
        self.coordinator.handle_command(Command::Inbound {
            connection,
            text: text.to_string(),
        });
    }

    pub fn send(&mut self, connection: ConnectionId, message: Value) {
        self.send_text(connection, &message.to_string());
    }

    pub fn offer(&mut self, connection: ConnectionId, sdp: &str) {
        self.send(
            connection,
            serde_json::json!({"type": "offer", "payload": {"type": "offer", "sdp": sdp}}),
        );
    }

    pub fn candidate(&mut self, connection: ConnectionId, n: u32) {
        self.send(
            connection,
            serde_json::json!({"type": "candidate", "payload": candidate_json(n)}),
        );
    }

    pub fn disconnect(&mut self, connection: ConnectionId) {
        self.coordinator
            .handle_command(Command::Disconnected { connection });
    }

    pub fn event(&mut self, event: EngineEvent) {
        self.coordinator.handle_event(event);
    }

    pub fn phase(&self, connection: ConnectionId) -> Option<NegotiationPhase> {
        self.coordinator
            .registry()
            .lookup(connection)
            .map(|session| session.phase())
    }

    pub fn key(&self, connection: ConnectionId) -> SessionKey {
        self.coordinator
            .registry()
            .lookup(connection)
            .map(|session| session.key())
            .expect("no session for connection")
    }

    /// Offer, answer, and open the local channel
    pub fn open_session(
        &mut self,
        connection: ConnectionId,
        sdp: &str,
    ) -> (SessionKey, Arc<MockChannel>) {
        self.offer(connection, sdp);
        let key = self.key(connection);
        self.event(EngineEvent::AnswerReady {
            key,
            sdp: format!("{}-answer", sdp),
        });
        let channel = self.engine.local_channel(key).expect("no local channel");
        self.event(EngineEvent::ChannelOpened {
            key,
            channel: channel.clone(),
            origin: gamelink_webrtc::ChannelOrigin::Local,
        });
        (key, channel)
    }
}

/// Candidate payload number `n` in browser shape
pub fn candidate_json(n: u32) -> Value {
    serde_json::json!({
        "candidate": candidate_line(n),
        "sdpMid": "0",
        "sdpMLineIndex": 0
    })
}

pub fn candidate_line(n: u32) -> String {
    format!("candidate:{} 1 udp 2122260223 192.168.1.{} 5000{} typ host", n, n, n)
}

/// Every message currently queued in an outbox, parsed as JSON
pub fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
    drain_text(rx)
        .iter()
        .map(|text| serde_json::from_str(text).expect("outbound message is not JSON"))
        .collect()
}

/// Every message currently queued in an outbox, verbatim
pub fn drain_text(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
    let mut messages = Vec::new();
    while let Ok(text) = rx.try_recv() {
        messages.push(text);
    }
    messages
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_for<F>(timeout: Duration, what: &str, mut condition: F) -> HarnessResult<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return Err(HarnessError::Timeout(what.to_string()));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}
