//! Recording transport engine

use gamelink_webrtc::engine::{
    ChannelId, EngineEventSender, IceServer, SessionDescription, TransportEngine,
};
use gamelink_webrtc::{
    ChannelOrigin, ChannelPayload, DataChannel, DataChannelMode, EngineEvent, Error,
    IceCandidate, PeerConnection, Result, SessionKey,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One call made into the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    CreatePeer { key: SessionKey },
    CreateDataChannel { key: SessionKey, label: String, mode: DataChannelMode },
    SetRemoteDescription { key: SessionKey, sdp: String },
    CreateAnswer { key: SessionKey },
    SetLocalDescription { key: SessionKey, sdp: String },
    AddIceCandidate { key: SessionKey, candidate: String },
    ClosePeer { key: SessionKey },
}

impl EngineCall {
    pub fn key(&self) -> SessionKey {
        match self {
            EngineCall::CreatePeer { key }
            | EngineCall::CreateDataChannel { key, .. }
            | EngineCall::SetRemoteDescription { key, .. }
            | EngineCall::CreateAnswer { key }
            | EngineCall::SetLocalDescription { key, .. }
            | EngineCall::AddIceCandidate { key, .. }
            | EngineCall::ClosePeer { key } => *key,
        }
    }
}

#[derive(Default)]
struct MockState {
    calls: Mutex<Vec<EngineCall>>,
    peers: Mutex<HashMap<SessionKey, PeerRecord>>,
    fail_create: AtomicBool,
    auto_answer: AtomicBool,
}

struct PeerRecord {
    events: EngineEventSender,
    remote_sdp: Option<String>,
    channels: Vec<Arc<MockChannel>>,
}

/// Transport engine that records calls instead of negotiating
#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<MockState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every `create_answer` with `"<offer sdp>-answer"`
    pub fn with_auto_answer() -> Self {
        let engine = Self::new();
        engine.state.auto_answer.store(true, Ordering::SeqCst);
        engine
    }

    /// Make every following `create_peer_connection` fail
    pub fn fail_create(&self, fail: bool) {
        self.state.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.calls.lock().clone()
    }

    pub fn calls_for(&self, key: SessionKey) -> Vec<EngineCall> {
        self.calls().into_iter().filter(|c| c.key() == key).collect()
    }

    pub fn count(&self, matches: impl Fn(&EngineCall) -> bool) -> usize {
        self.state.calls.lock().iter().filter(|c| matches(c)).count()
    }

    /// Candidate lines added to the peer of `key`, in order
    pub fn added_candidates(&self, key: SessionKey) -> Vec<String> {
        self.calls_for(key)
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::AddIceCandidate { candidate, .. } => Some(candidate),
                _ => None,
            })
            .collect()
    }

    /// First channel the coordinator created on the peer of `key`
    pub fn local_channel(&self, key: SessionKey) -> Option<Arc<MockChannel>> {
        self.state
            .peers
            .lock()
            .get(&key)
            .and_then(|peer| peer.channels.first().cloned())
    }

    /// Channel the remote peer would announce
    pub fn remote_channel(&self, label: &str) -> Arc<MockChannel> {
        Arc::new(MockChannel::new(label, ChannelOrigin::Remote))
    }

    /// Emit an event as the engine would, from the peer's own sender
    pub fn emit(&self, event: EngineEvent) -> bool {
        let peers = self.state.peers.lock();
        match peers.get(&event.key()) {
            Some(peer) => peer.events.send(event).is_ok(),
            None => false,
        }
    }

    fn record(&self, call: EngineCall) {
        self.state.calls.lock().push(call);
    }
}

impl TransportEngine for MockEngine {
    fn create_peer_connection(
        &self,
        key: SessionKey,
        _ice_servers: &[IceServer],
        events: EngineEventSender,
    ) -> Result<Box<dyn PeerConnection>> {
        if self.state.fail_create.load(Ordering::SeqCst) {
            return Err(Error::PeerConnectionError(
                "mock engine refused to create a peer".to_string(),
            ));
        }

        self.record(EngineCall::CreatePeer { key });
        self.state.peers.lock().insert(
            key,
            PeerRecord {
                events,
                remote_sdp: None,
                channels: Vec::new(),
            },
        );

        Ok(Box::new(MockPeer {
            key,
            engine: self.clone(),
        }))
    }
}

struct MockPeer {
    key: SessionKey,
    engine: MockEngine,
}

impl PeerConnection for MockPeer {
    fn create_data_channel(&self, label: &str, mode: DataChannelMode) -> Arc<dyn DataChannel> {
        self.engine.record(EngineCall::CreateDataChannel {
            key: self.key,
            label: label.to_string(),
            mode,
        });
        let channel = Arc::new(MockChannel::new(label, ChannelOrigin::Local));
        if let Some(peer) = self.engine.state.peers.lock().get_mut(&self.key) {
            peer.channels.push(Arc::clone(&channel));
        }
        channel
    }

    fn set_remote_description(&self, description: SessionDescription) {
        self.engine.record(EngineCall::SetRemoteDescription {
            key: self.key,
            sdp: description.sdp.clone(),
        });
        if let Some(peer) = self.engine.state.peers.lock().get_mut(&self.key) {
            peer.remote_sdp = Some(description.sdp);
        }
    }

    fn create_answer(&self) {
        self.engine.record(EngineCall::CreateAnswer { key: self.key });

        if self.engine.state.auto_answer.load(Ordering::SeqCst) {
            let peers = self.engine.state.peers.lock();
            if let Some(peer) = peers.get(&self.key) {
                let sdp = format!("{}-answer", peer.remote_sdp.as_deref().unwrap_or_default());
                let _ = peer.events.send(EngineEvent::AnswerReady { key: self.key, sdp });
            }
        }
    }

    fn set_local_description(&self, description: SessionDescription) {
        self.engine.record(EngineCall::SetLocalDescription {
            key: self.key,
            sdp: description.sdp,
        });
    }

    fn add_ice_candidate(&self, candidate: IceCandidate) {
        self.engine.record(EngineCall::AddIceCandidate {
            key: self.key,
            candidate: candidate.candidate,
        });
    }

    fn close(&self) {
        self.engine.record(EngineCall::ClosePeer { key: self.key });
    }
}

/// Data channel that captures what is sent on it
pub struct MockChannel {
    id: ChannelId,
    label: String,
    pub origin: ChannelOrigin,
    sent: Mutex<Vec<ChannelPayload>>,
    closed: AtomicBool,
}

impl MockChannel {
    pub fn new(label: &str, origin: ChannelOrigin) -> Self {
        Self {
            id: ChannelId::next(),
            label: label.to_string(),
            origin,
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn sent(&self) -> Vec<ChannelPayload> {
        self.sent.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl DataChannel for MockChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn send(&self, payload: ChannelPayload) {
        self.sent.lock().push(payload);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
