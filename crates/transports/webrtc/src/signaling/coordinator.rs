//! Signaling coordinator
//!
//! The protocol state machine. One task owns the [`SessionRegistry`]; control
//! channel commands and transport engine events are both routed to it, so no
//! session state is ever touched from two contexts.
//!
//! ```text
//! WebSocket handlers ──Command──┐
//!                               ├──▶ SignalingCoordinator ──▶ outbox per connection
//! Transport engine ──EngineEvent┘          │
//!                                          └──▶ PeerConnection / DataChannel calls
//! ```
//!
//! Engine events are resolved by [`SessionKey`] at delivery time. An event for
//! a session that was torn down finds nothing and is dropped.

use crate::config::RelayConfig;
use crate::engine::{
    event_channel, ChannelId, ChannelOrigin, ChannelPayload, DataChannel, EngineEvent,
    EngineEventReceiver, EngineEventSender, IceCandidate, IceServer, SessionDescription,
    TransportEngine,
};
use crate::relay::RelayPolicy;
use crate::session::{
    ConnectionId, NegotiationPhase, Session, SessionKey, SessionRegistry, SessionSnapshot,
};
use crate::signaling::protocol::{InboundMessage, OutboundMessage};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Queue of serialized messages for one control-channel connection
pub type Outbox = mpsc::UnboundedSender<String>;

/// Error code sent when a candidate arrives before any offer
pub const CANDIDATE_BEFORE_OFFER: &str = "candidate_before_offer";

/// Input from the control channel
pub enum Command {
    /// A control-channel connection was accepted
    Connected {
        connection: ConnectionId,
        outbox: Outbox,
    },
    /// Text frame received on a connection
    Inbound {
        connection: ConnectionId,
        text: String,
    },
    /// The connection closed
    Disconnected { connection: ConnectionId },
    /// Report all sessions
    Snapshot {
        reply: oneshot::Sender<Vec<SessionSnapshot>>,
    },
    /// Tear down every session and stop
    Shutdown,
}

/// Cloneable front of a running coordinator
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl CoordinatorHandle {
    fn submit(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| Error::Other(anyhow::anyhow!("signaling coordinator stopped")))
    }

    pub fn connect(&self, connection: ConnectionId, outbox: Outbox) -> Result<()> {
        self.submit(Command::Connected { connection, outbox })
    }

    pub fn inbound(&self, connection: ConnectionId, text: String) -> Result<()> {
        self.submit(Command::Inbound { connection, text })
    }

    pub fn disconnect(&self, connection: ConnectionId) -> Result<()> {
        self.submit(Command::Disconnected { connection })
    }

    pub async fn snapshot(&self) -> Result<Vec<SessionSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Snapshot { reply })?;
        rx.await
            .map_err(|_| Error::Other(anyhow::anyhow!("signaling coordinator stopped")))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.submit(Command::Shutdown)
    }
}

/// Protocol state machine and single owner of all sessions
pub struct SignalingCoordinator {
    config: Arc<RelayConfig>,
    ice_servers: Vec<IceServer>,
    engine: Arc<dyn TransportEngine>,
    relay: Arc<dyn RelayPolicy>,
    registry: SessionRegistry,
    outboxes: HashMap<ConnectionId, Outbox>,
    events_tx: EngineEventSender,
}

impl SignalingCoordinator {
    /// Create a coordinator and the engine event queue it consumes
    pub fn new(
        config: RelayConfig,
        engine: Arc<dyn TransportEngine>,
        relay: Arc<dyn RelayPolicy>,
    ) -> (Self, EngineEventReceiver) {
        let (events_tx, events_rx) = event_channel();
        let ice_servers = config.ice_servers();

        info!(
            "Signaling coordinator ready: relay={}, channel='{}' ({:?}), max_sessions={}",
            relay.name(),
            config.data_channel_label,
            config.data_channel_mode,
            config.max_sessions
        );

        let coordinator = Self {
            config: Arc::new(config),
            ice_servers,
            engine,
            relay,
            registry: SessionRegistry::new(),
            outboxes: HashMap::new(),
            events_tx,
        };
        (coordinator, events_rx)
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.outboxes.len()
    }

    /// Run on the current runtime, returning a handle to feed it
    pub fn spawn(self, events: EngineEventReceiver) -> (CoordinatorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(rx, events));
        (CoordinatorHandle { tx }, task)
    }

    /// Process commands, engine events and negotiation deadlines until
    /// shutdown or until every command sender is gone
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: EngineEventReceiver,
    ) {
        loop {
            let deadline = self.registry.next_deadline();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
                _ = wait_until(deadline) => self.expire_negotiations(Instant::now()),
            }
        }

        self.shutdown();
        info!("Signaling coordinator stopped");
    }

    /// Apply one control-channel command
    ///
    /// Returns `false` once `Command::Shutdown` has been handled.
    pub fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Connected { connection, outbox } => {
                debug!(connection = %connection, "Control channel connected");
                if self.outboxes.insert(connection, outbox).is_some() {
                    warn!(connection = %connection, "Replaced outbox of known connection");
                }
            }
            Command::Inbound { connection, text } => self.handle_inbound(connection, &text),
            Command::Disconnected { connection } => {
                debug!(connection = %connection, "Control channel disconnected");
                self.outboxes.remove(&connection);
                self.registry.remove(connection);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.registry.snapshot());
            }
            Command::Shutdown => {
                self.shutdown();
                return false;
            }
        }
        true
    }

    /// Tear down every session and drop every outbox
    pub fn shutdown(&mut self) {
        if !self.registry.is_empty() || !self.outboxes.is_empty() {
            info!(
                "Shutting down {} sessions on {} connections",
                self.registry.len(),
                self.outboxes.len()
            );
        }
        self.registry.clear();
        self.outboxes.clear();
    }

    #[instrument(skip_all, fields(connection = %connection))]
    fn handle_inbound(&mut self, connection: ConnectionId, text: &str) {
        if !self.outboxes.contains_key(&connection) {
            warn!("Ignoring message from unregistered connection");
            return;
        }

        let message = match InboundMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring malformed control message: {}", e);
                return;
            }
        };

        debug!(kind = message.kind(), "Control message received");

        match message {
            InboundMessage::Offer { sdp } => self.handle_offer(connection, sdp),
            InboundMessage::Candidate(candidate) => {
                self.handle_remote_candidate(connection, candidate)
            }
            InboundMessage::Ping { raw } => self.send_raw(connection, raw),
            InboundMessage::Unknown { kind } => {
                warn!("Ignoring control message with unknown type '{}'", kind)
            }
        }
    }

    fn handle_offer(&mut self, connection: ConnectionId, sdp: String) {
        match self.registry.lookup(connection) {
            Some(session) if session.phase().is_active() => {
                let err = Error::ProtocolViolation(format!(
                    "offer received while session {} is {}",
                    session.key(),
                    session.phase()
                ));
                warn!("Rejecting duplicate offer: {}", err);
                self.send_error(connection, &err);
                return;
            }
            Some(_) => {}
            None => {
                let limit = self.config.max_sessions;
                if limit > 0 && self.registry.len() >= limit {
                    let err = Error::SessionLimitExceeded(limit);
                    warn!("Rejecting offer: {}", err);
                    self.send_error(connection, &err);
                    return;
                }
            }
        }

        let session = self.registry.get_or_create(connection);
        let key = session.key();
        let started = begin_negotiation(
            session,
            sdp,
            self.engine.as_ref(),
            &self.config,
            &self.ice_servers,
            &self.events_tx,
        );

        match started {
            Ok(()) => info!(session = %key, "Offer accepted, answer requested"),
            Err(e) => self.fail_session(key, e),
        }
    }

    fn handle_remote_candidate(&mut self, connection: ConnectionId, candidate: IceCandidate) {
        if candidate.sdp_mid.is_none() && candidate.sdp_mline_index.is_none() {
            let err = Error::IceCandidateError(
                "candidate names neither sdpMid nor sdpMLineIndex".to_string(),
            );
            info!("Rejecting remote candidate: {}", err);
            self.send_error(connection, &err);
            return;
        }

        let has_connection = self
            .registry
            .lookup(connection)
            .map(|session| session.connection().is_some());

        match has_connection {
            Some(true) => {
                if let Some(session) = self.registry.lookup_mut(connection) {
                    if let Some(pc) = session.connection() {
                        pc.add_ice_candidate(candidate);
                    }
                    session.record_remote_candidate();
                    debug!(session = %session.key(), phase = %session.phase(), "Forwarded remote candidate");
                }
            }
            Some(false) | None if self.config.buffer_early_candidates => {
                let limit = self.config.max_sessions;
                if has_connection.is_none() && limit > 0 && self.registry.len() >= limit {
                    self.send_error(connection, &Error::SessionLimitExceeded(limit));
                    return;
                }
                let cap = self.config.max_pending_candidates;
                let timeout = self.config.negotiation_timeout();
                let session = self.registry.get_or_create(connection);
                if session.pending_candidate_count() >= cap {
                    let err = Error::CandidateBufferFull(cap);
                    info!(session = %session.key(), "Rejecting early candidate: {}", err);
                    self.send_error(connection, &err);
                    return;
                }
                if session.deadline().is_none() {
                    session.set_deadline(timeout.and_then(deadline_after));
                }
                session.buffer_remote_candidate(candidate);
                debug!(
                    session = %session.key(),
                    pending = session.pending_candidate_count(),
                    "Buffered candidate received before offer"
                );
            }
            _ => {
                warn!("Rejecting candidate received before offer");
                self.send(
                    connection,
                    &OutboundMessage::error(
                        CANDIDATE_BEFORE_OFFER,
                        "candidate received before offer; no peer connection exists",
                    ),
                );
            }
        }
    }

    /// Apply one transport engine event
    pub fn handle_event(&mut self, event: EngineEvent) {
        let key = event.key();
        if self.registry.lookup_key(key).is_none() {
            debug!(session = %key, event = event.name(), "Discarding event for stale session");
            if let EngineEvent::ChannelOpened { channel, .. } = event {
                channel.close();
            }
            return;
        }

        match event {
            EngineEvent::AnswerReady { sdp, .. } => self.on_answer_ready(key, sdp),
            EngineEvent::CandidateDiscovered { candidate, .. } => {
                self.on_candidate_discovered(key, candidate)
            }
            EngineEvent::ChannelOpened {
                channel, origin, ..
            } => self.on_channel_opened(key, channel, origin),
            EngineEvent::MessageReceived {
                channel, payload, ..
            } => self.on_message_received(key, channel, payload),
            EngineEvent::NegotiationFailed { reason, .. } => {
                self.fail_session(key, Error::SdpError(reason))
            }
            EngineEvent::TransportFailed { reason, .. } => {
                self.fail_session(key, Error::PeerConnectionError(reason))
            }
        }
    }

    fn on_answer_ready(&mut self, key: SessionKey, sdp: String) {
        let Some(session) = self.registry.lookup_key(key) else {
            return;
        };
        if session.phase() != NegotiationPhase::AnswerPending {
            debug!(session = %key, phase = %session.phase(), "Ignoring answer outside AnswerPending");
            return;
        }

        if let Some(pc) = session.connection() {
            pc.set_local_description(SessionDescription::answer(sdp.clone()));
        }
        if let Err(e) = session.advance(NegotiationPhase::Negotiating) {
            warn!(session = %key, "{}", e);
            return;
        }
        let held = session.take_local_candidates();
        let opened = session.take_opened_before_answer();

        info!(session = %key, "Sending answer");
        self.send(key.connection, &OutboundMessage::answer(sdp));
        for candidate in held {
            self.send(key.connection, &OutboundMessage::candidate(candidate));
        }

        if opened {
            if let Some(session) = self.registry.lookup_key(key) {
                mark_channel_open(session);
            }
        }
    }

    fn on_candidate_discovered(&mut self, key: SessionKey, candidate: IceCandidate) {
        let Some(session) = self.registry.lookup_key(key) else {
            return;
        };

        match session.phase() {
            NegotiationPhase::AnswerPending => {
                session.record_local_candidate();
                session.hold_local_candidate(candidate);
                debug!(session = %key, "Holding local candidate until answer is sent");
            }
            NegotiationPhase::Negotiating | NegotiationPhase::ChannelOpen => {
                session.record_local_candidate();
                self.send(key.connection, &OutboundMessage::candidate(candidate));
            }
            phase => debug!(session = %key, %phase, "Ignoring local candidate"),
        }
    }

    fn on_channel_opened(
        &mut self,
        key: SessionKey,
        channel: Arc<dyn DataChannel>,
        origin: ChannelOrigin,
    ) {
        let Some(session) = self.registry.lookup_key(key) else {
            channel.close();
            return;
        };

        let current = session.channel().map(|c| c.id());
        if current != Some(channel.id()) {
            if origin == ChannelOrigin::Local {
                debug!(session = %key, channel = %channel.id(), "Closing superseded local channel");
                channel.close();
                return;
            }
            info!(session = %key, label = channel.label(), "Adopting remote data channel");
            if let Some(previous) = session.install_channel(channel, origin) {
                previous.close();
            }
        }

        match session.phase() {
            NegotiationPhase::Negotiating => mark_channel_open(session),
            NegotiationPhase::ChannelOpen => {}
            NegotiationPhase::AnswerPending => {
                debug!(session = %key, "Data channel opened before answer was sent");
                session.mark_opened_before_answer();
            }
            phase => warn!(session = %key, %phase, "Ignoring data channel open"),
        }
    }

    fn on_message_received(&mut self, key: SessionKey, from: ChannelId, payload: ChannelPayload) {
        let relay = Arc::clone(&self.relay);
        let Some(session) = self.registry.lookup_key(key) else {
            return;
        };
        let Some(channel) = session.open_channel().cloned() else {
            debug!(session = %key, phase = %session.phase(), "Dropping payload, channel not open");
            return;
        };
        if channel.id() != from {
            debug!(session = %key, channel = %from, "Dropping payload from superseded channel");
            return;
        }

        let bytes = relay.relay(key, payload, channel.as_ref());
        session.record_relayed(bytes);
    }

    /// Tear down any session whose negotiation deadline has passed
    pub fn expire_negotiations(&mut self, now: Instant) {
        for key in self.registry.expired(now) {
            let bound = self.config.negotiation_timeout_secs.unwrap_or_default();
            self.fail_session(
                key,
                Error::NegotiationTimeout(format!("data channel not open after {}s", bound)),
            );
        }
    }

    fn fail_session(&mut self, key: SessionKey, err: Error) {
        if err.is_client_error() {
            info!(session = %key, code = err.code(), "Tearing down session: {}", err);
        } else if err.is_transport_error() {
            warn!(session = %key, code = err.code(), "Tearing down session: {}", err);
        } else {
            error!(session = %key, code = err.code(), "Tearing down session: {}", err);
        }
        self.send_error(key.connection, &err);
        self.registry.remove_key(key);
    }

    fn send_error(&self, connection: ConnectionId, err: &Error) {
        self.send(connection, &OutboundMessage::from_error(err));
    }

    fn send(&self, connection: ConnectionId, message: &OutboundMessage) {
        match message.to_json() {
            Ok(text) => self.send_raw(connection, text),
            Err(e) => error!(connection = %connection, "Failed to serialize control message: {}", e),
        }
    }

    fn send_raw(&self, connection: ConnectionId, text: String) {
        match self.outboxes.get(&connection) {
            Some(outbox) => {
                if outbox.send(text).is_err() {
                    debug!(connection = %connection, "Outbox closed, dropping message");
                }
            }
            None => debug!(connection = %connection, "No control channel, dropping message"),
        }
    }
}

/// Create the peer connection and local channel for an offer and queue the
/// remote description, any buffered candidates, and the answer request
fn begin_negotiation(
    session: &mut Session,
    sdp: String,
    engine: &dyn TransportEngine,
    config: &RelayConfig,
    ice_servers: &[IceServer],
    events: &EngineEventSender,
) -> Result<()> {
    let pc = engine.create_peer_connection(session.key(), ice_servers, events.clone())?;

    let channel = pc.create_data_channel(&config.data_channel_label, config.data_channel_mode);
    pc.set_remote_description(SessionDescription::offer(sdp));

    let buffered = session.take_pending_candidates();
    if !buffered.is_empty() {
        debug!(session = %session.key(), count = buffered.len(), "Flushing buffered candidates");
    }
    for candidate in buffered {
        pc.add_ice_candidate(candidate);
        session.record_remote_candidate();
    }

    pc.create_answer();

    session.attach_connection(pc)?;
    session.install_channel(channel, ChannelOrigin::Local);
    session.advance(NegotiationPhase::AnswerPending)?;
    session.set_deadline(config.negotiation_timeout().and_then(deadline_after));
    Ok(())
}

/// Advance a negotiating session whose channel is open and clear its deadline
fn mark_channel_open(session: &mut Session) {
    if let Err(e) = session.advance(NegotiationPhase::ChannelOpen) {
        warn!(session = %session.key(), "{}", e);
        return;
    }
    session.set_deadline(None);
    info!(
        session = %session.key(),
        "Data channel open after {:?}",
        session.created_at().elapsed()
    );
}

/// `None` when the bound does not fit in an `Instant`; the session then has
/// no deadline
fn deadline_after(bound: Duration) -> Option<Instant> {
    let deadline = Instant::now().checked_add(bound);
    if deadline.is_none() {
        warn!("Negotiation timeout of {:?} overflows, no deadline set", bound);
    }
    deadline
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}
