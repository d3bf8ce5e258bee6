//! Transport engine backed by webrtc-rs
//!
//! Each peer connection gets a worker task on the engine runtime. The worker
//! owns the `RTCPeerConnection` and applies queued operations strictly in
//! order, so a candidate issued after an offer is never added before the
//! remote description is installed. webrtc-rs callbacks only forward
//! `EngineEvent`s and never touch signaling state.

use super::events::{ChannelOrigin, EngineEvent, EngineEventSender};
use super::{
    ChannelId, ChannelPayload, DataChannel, IceCandidate, IceServer, PeerConnection, SdpType,
    SessionDescription, TransportEngine,
};
use crate::config::DataChannelMode;
use crate::session::SessionKey;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// webrtc-rs transport engine
pub struct WebRtcEngine {
    api: Arc<API>,
    runtime: Handle,
}

impl WebRtcEngine {
    /// Build the webrtc-rs API; peer workers are spawned on `runtime`
    pub fn new(runtime: Handle) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::PeerConnectionError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::PeerConnectionError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        Ok(Self {
            api: Arc::new(api),
            runtime,
        })
    }
}

impl TransportEngine for WebRtcEngine {
    fn create_peer_connection(
        &self,
        key: SessionKey,
        ice_servers: &[IceServer],
        events: EngineEventSender,
    ) -> Result<Box<dyn PeerConnection>> {
        let ice_servers: Vec<RTCIceServer> = ice_servers
            .iter()
            .map(|server| {
                #[allow(clippy::needless_update)]
                RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                }
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let worker = PeerWorker {
            key,
            events,
            runtime: self.runtime.clone(),
            ops: ops_tx.downgrade(),
            channels: Vec::new(),
        };
        self.runtime
            .spawn(worker.run(Arc::clone(&self.api), rtc_config, ops_rx));

        debug!(session = %key, "Spawned peer worker");

        Ok(Box::new(WebRtcPeer {
            key,
            ops: ops_tx,
            runtime: self.runtime.clone(),
        }))
    }
}

/// Operation queued for a peer worker
enum PeerOp {
    CreateDataChannel {
        channel: Arc<WebRtcDataChannel>,
        mode: DataChannelMode,
    },
    AdoptRemoteChannel(Arc<WebRtcDataChannel>),
    SetRemoteDescription(SessionDescription),
    CreateAnswer,
    SetLocalDescription(SessionDescription),
    AddIceCandidate(IceCandidate),
    Close,
}

impl PeerOp {
    fn name(&self) -> &'static str {
        match self {
            PeerOp::CreateDataChannel { .. } => "create_data_channel",
            PeerOp::AdoptRemoteChannel(_) => "adopt_remote_channel",
            PeerOp::SetRemoteDescription(_) => "set_remote_description",
            PeerOp::CreateAnswer => "create_answer",
            PeerOp::SetLocalDescription(_) => "set_local_description",
            PeerOp::AddIceCandidate(_) => "add_ice_candidate",
            PeerOp::Close => "close",
        }
    }
}

/// Handle owned by the session; dropping it stops the worker
struct WebRtcPeer {
    key: SessionKey,
    ops: mpsc::UnboundedSender<PeerOp>,
    runtime: Handle,
}

impl WebRtcPeer {
    fn enqueue(&self, op: PeerOp) {
        let name = op.name();
        if self.ops.send(op).is_err() {
            debug!(session = %self.key, op = name, "Peer worker gone, dropping operation");
        }
    }
}

impl PeerConnection for WebRtcPeer {
    fn create_data_channel(&self, label: &str, mode: DataChannelMode) -> Arc<dyn DataChannel> {
        let channel = Arc::new(WebRtcDataChannel::new(label, self.runtime.clone()));
        self.enqueue(PeerOp::CreateDataChannel {
            channel: Arc::clone(&channel),
            mode,
        });
        channel
    }

    fn set_remote_description(&self, description: SessionDescription) {
        self.enqueue(PeerOp::SetRemoteDescription(description));
    }

    fn create_answer(&self) {
        self.enqueue(PeerOp::CreateAnswer);
    }

    fn set_local_description(&self, description: SessionDescription) {
        self.enqueue(PeerOp::SetLocalDescription(description));
    }

    fn add_ice_candidate(&self, candidate: IceCandidate) {
        self.enqueue(PeerOp::AddIceCandidate(candidate));
    }

    fn close(&self) {
        self.enqueue(PeerOp::Close);
    }
}

/// Per-connection task owning the `RTCPeerConnection`
struct PeerWorker {
    key: SessionKey,
    events: EngineEventSender,
    runtime: Handle,
    /// Lets the remote-channel callback hand over channels without keeping the worker alive
    ops: mpsc::WeakUnboundedSender<PeerOp>,
    /// Strong references for channel callbacks, which only hold `Weak`s
    channels: Vec<Arc<WebRtcDataChannel>>,
}

impl PeerWorker {
    async fn run(
        mut self,
        api: Arc<API>,
        rtc_config: RTCConfiguration,
        mut ops: mpsc::UnboundedReceiver<PeerOp>,
    ) {
        let pc = match api.new_peer_connection(rtc_config).await {
            Ok(pc) => Arc::new(pc),
            Err(e) => {
                self.negotiation_failed(format!("Failed to create peer connection: {}", e));
                return;
            }
        };

        self.register_handlers(&pc);

        while let Some(op) = ops.recv().await {
            if matches!(op, PeerOp::Close) {
                break;
            }
            self.apply(&pc, op).await;
        }

        if let Err(e) = pc.close().await {
            warn!(session = %self.key, "Failed to close peer connection: {}", e);
        }
        debug!(session = %self.key, "Peer worker exited");
    }

    async fn apply(&mut self, pc: &Arc<RTCPeerConnection>, op: PeerOp) {
        let key = self.key;
        match op {
            PeerOp::CreateDataChannel { channel, mode } => {
                let init = RTCDataChannelInit {
                    ordered: Some(mode.ordered()),
                    max_retransmits: mode.max_retransmits(),
                    ..Default::default()
                };

                match pc.create_data_channel(channel.label(), Some(init)).await {
                    Ok(rtc) => {
                        channel.attach(Arc::clone(&rtc));
                        wire_channel(&rtc, &channel, ChannelOrigin::Local, key, &self.events);
                        self.channels.push(channel);
                    }
                    Err(e) => {
                        self.negotiation_failed(format!("Failed to create data channel: {}", e))
                    }
                }
            }

            PeerOp::AdoptRemoteChannel(channel) => {
                debug!(session = %key, channel = %channel.id(), "Holding remote data channel");
                self.channels.push(channel);
            }

            PeerOp::SetRemoteDescription(description) => {
                let result = match description.sdp_type {
                    SdpType::Offer => RTCSessionDescription::offer(description.sdp),
                    SdpType::Answer => RTCSessionDescription::answer(description.sdp),
                };
                let result = match result {
                    Ok(desc) => pc.set_remote_description(desc).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    self.negotiation_failed(format!("Failed to set remote description: {}", e));
                }
            }

            PeerOp::CreateAnswer => match pc.create_answer(None).await {
                Ok(answer) => {
                    let _ = self.events.send(EngineEvent::AnswerReady {
                        key,
                        sdp: answer.sdp,
                    });
                }
                Err(e) => self.negotiation_failed(format!("Failed to create answer: {}", e)),
            },

            PeerOp::SetLocalDescription(description) => {
                let result = match description.sdp_type {
                    SdpType::Answer => RTCSessionDescription::answer(description.sdp),
                    SdpType::Offer => RTCSessionDescription::offer(description.sdp),
                };
                let result = match result {
                    Ok(desc) => pc.set_local_description(desc).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    self.negotiation_failed(format!("Failed to set local description: {}", e));
                }
            }

            PeerOp::AddIceCandidate(candidate) => {
                let init = RTCIceCandidateInit {
                    candidate: candidate.candidate,
                    sdp_mid: candidate.sdp_mid,
                    sdp_mline_index: candidate.sdp_mline_index,
                    username_fragment: candidate.username_fragment,
                };
                if let Err(e) = pc.add_ice_candidate(init).await {
                    // A single unusable candidate does not doom the connection.
                    warn!(session = %key, "Failed to add remote ICE candidate: {}", e);
                }
            }

            PeerOp::Close => {}
        }
    }

    fn register_handlers(&self, pc: &Arc<RTCPeerConnection>) {
        let key = self.key;

        let events = self.events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        debug!(session = %key, "Local ICE candidate: {}", init.candidate);
                        let _ = events.send(EngineEvent::CandidateDiscovered {
                            key,
                            candidate: IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            },
                        });
                    }
                    Err(e) => warn!(session = %key, "Failed to serialize ICE candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        // Handlers go on before the callback returns so no message from the
        // remote channel is missed; the worker only keeps the strong ref.
        let ops = self.ops.clone();
        let events = self.events.clone();
        let runtime = self.runtime.clone();
        pc.on_data_channel(Box::new(move |rtc: Arc<RTCDataChannel>| {
            info!(session = %key, label = rtc.label(), "Remote peer announced data channel");
            let channel = Arc::new(WebRtcDataChannel::new(rtc.label(), runtime.clone()));
            channel.attach(Arc::clone(&rtc));
            wire_channel(&rtc, &channel, ChannelOrigin::Remote, key, &events);

            if rtc.ready_state() == RTCDataChannelState::Open {
                let _ = events.send(EngineEvent::ChannelOpened {
                    key,
                    channel: Arc::clone(&channel) as Arc<dyn DataChannel>,
                    origin: ChannelOrigin::Remote,
                });
            }
            if let Some(ops) = ops.upgrade() {
                let _ = ops.send(PeerOp::AdoptRemoteChannel(channel));
            }
            Box::pin(async {})
        }));

        let events = self.events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(session = %key, "Peer connection state changed: {}", state);
            if matches!(
                state,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
            ) {
                let _ = events.send(EngineEvent::TransportFailed {
                    key,
                    reason: format!("peer connection {}", state),
                });
            }
            Box::pin(async {})
        }));
    }

    fn negotiation_failed(&self, reason: String) {
        warn!(session = %self.key, "{}", reason);
        let _ = self.events.send(EngineEvent::NegotiationFailed {
            key: self.key,
            reason,
        });
    }
}

/// Install open/message/close handlers that report to the coordinator
fn wire_channel(
    rtc: &Arc<RTCDataChannel>,
    channel: &Arc<WebRtcDataChannel>,
    origin: ChannelOrigin,
    key: SessionKey,
    events: &EngineEventSender,
) {
    let weak: Weak<WebRtcDataChannel> = Arc::downgrade(channel);
    let open_events = events.clone();
    rtc.on_open(Box::new(move || {
        if let Some(channel) = weak.upgrade() {
            debug!(session = %key, label = channel.label(), "Data channel open");
            let _ = open_events.send(EngineEvent::ChannelOpened {
                key,
                channel: channel as Arc<dyn DataChannel>,
                origin,
            });
        }
        Box::pin(async {})
    }));

    let message_events = events.clone();
    let channel_id = channel.id();
    rtc.on_message(Box::new(move |msg: DataChannelMessage| {
        let _ = message_events.send(EngineEvent::MessageReceived {
            key,
            channel: channel_id,
            payload: ChannelPayload {
                data: msg.data,
                is_text: msg.is_string,
            },
        });
        Box::pin(async {})
    }));

    let label = channel.label().to_string();
    rtc.on_close(Box::new(move || {
        debug!(session = %key, label = %label, "Data channel closed");
        Box::pin(async {})
    }));
}

/// Data channel handle given to the session
///
/// Returned before webrtc-rs has created the underlying channel; the slot
/// is filled by the peer worker.
pub struct WebRtcDataChannel {
    id: ChannelId,
    label: String,
    inner: Mutex<Option<Arc<RTCDataChannel>>>,
    runtime: Handle,
}

impl WebRtcDataChannel {
    fn new(label: &str, runtime: Handle) -> Self {
        Self {
            id: ChannelId::next(),
            label: label.to_string(),
            inner: Mutex::new(None),
            runtime,
        }
    }

    fn attach(&self, rtc: Arc<RTCDataChannel>) {
        *self.inner.lock() = Some(rtc);
    }

    fn rtc(&self) -> Option<Arc<RTCDataChannel>> {
        self.inner.lock().clone()
    }
}

impl DataChannel for WebRtcDataChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn send(&self, payload: ChannelPayload) {
        let Some(rtc) = self.rtc() else {
            debug!(channel = %self.id, "Data channel not created yet, dropping payload");
            return;
        };

        self.runtime.spawn(async move {
            let result = if payload.is_text {
                match String::from_utf8(payload.data.to_vec()) {
                    Ok(text) => rtc.send_text(text).await,
                    Err(_) => rtc.send(&payload.data).await,
                }
            } else {
                rtc.send(&payload.data).await
            };

            if let Err(e) = result {
                debug!("Failed to send on data channel '{}': {}", rtc.label(), e);
            }
        });
    }

    fn close(&self) {
        if let Some(rtc) = self.inner.lock().take() {
            self.runtime.spawn(async move {
                if let Err(e) = rtc.close().await {
                    debug!("Failed to close data channel '{}': {}", rtc.label(), e);
                }
            });
        }
    }
}
