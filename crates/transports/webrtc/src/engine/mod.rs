//! Transport engine adapter
//!
//! Boundary between the signaling core and the peer-transport library. The
//! core only sees the traits below: every call is fire-and-forget and every
//! completion comes back later as an [`EngineEvent`] tagged with the
//! [`SessionKey`] it belongs to. The adapter never holds a `Session`.
//!
//! ```text
//! SignalingCoordinator ──calls──▶ dyn PeerConnection / dyn DataChannel
//!          ▲                                  │
//!          └────────── EngineEvent ◀──────────┘  (transport-engine context)
//! ```

pub mod events;
pub mod runtime;
pub mod webrtc_rs;

use crate::config::DataChannelMode;
use crate::session::SessionKey;
use crate::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use events::{event_channel, ChannelOrigin, EngineEvent, EngineEventReceiver, EngineEventSender};
pub use runtime::EngineRuntime;
pub use webrtc_rs::WebRtcEngine;

/// Reachability-discovery server handed to a new peer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    /// Server URLs (stun:, stuns:, turn:, turns:)
    pub urls: Vec<String>,
    /// TURN username (empty for STUN)
    pub username: String,
    /// TURN credential (empty for STUN)
    pub credential: String,
}

/// Session description kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    /// Remote offer
    Offer,
    /// Local answer
    Answer,
}

/// Session description installed on a peer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    /// Offer or answer
    pub sdp_type: SdpType,
    /// Raw SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Wrap a remote offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Wrap a local answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate as exchanged on the control channel
///
/// Field names follow the browser's `RTCIceCandidateInit`, so the object a
/// browser puts in `event.candidate` deserializes as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute line (empty string = end of candidates)
    pub candidate: String,

    /// Media stream identification tag
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,

    /// Index of the m-line the candidate belongs to
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,

    /// ICE username fragment
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

/// Opaque data channel payload
///
/// `is_text` keeps the frame type of the received message so a relay can
/// hand back an identical frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPayload {
    /// Payload bytes
    pub data: Bytes,
    /// Whether the frame was sent as a string
    pub is_text: bool,
}

impl ChannelPayload {
    /// Binary frame
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            is_text: false,
        }
    }

    /// Text frame
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            data: Bytes::from(text.into()),
            is_text: true,
        }
    }

    /// Payload size in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Process-unique data channel identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Allocate the next identifier
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Factory for peer connections
pub trait TransportEngine: Send + Sync {
    /// Construct a peer connection for `key`
    ///
    /// Every asynchronous outcome of the returned connection is reported on
    /// `events` tagged with `key`.
    fn create_peer_connection(
        &self,
        key: SessionKey,
        ice_servers: &[IceServer],
        events: EngineEventSender,
    ) -> Result<Box<dyn PeerConnection>>;
}

/// One peer connection, exclusively owned by its session
///
/// Operations are applied in the order they are issued.
pub trait PeerConnection: Send + Sync {
    /// Create a data channel; usable once an `EngineEvent::ChannelOpened` names it
    fn create_data_channel(&self, label: &str, mode: DataChannelMode) -> Arc<dyn DataChannel>;

    /// Install the remote offer
    fn set_remote_description(&self, description: SessionDescription);

    /// Produce an answer; completes with `EngineEvent::AnswerReady`
    fn create_answer(&self);

    /// Install the local answer
    fn set_local_description(&self, description: SessionDescription);

    /// Feed a remote candidate
    fn add_ice_candidate(&self, candidate: IceCandidate);

    /// Release the connection and everything it owns
    fn close(&self);
}

/// One data channel
pub trait DataChannel: Send + Sync {
    /// Process-unique identifier
    fn id(&self) -> ChannelId;

    /// Channel label
    fn label(&self) -> &str;

    /// Queue a payload for delivery; never blocks
    fn send(&self, payload: ChannelPayload);

    /// Close the channel
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_accepts_browser_shape() {
        let candidate: IceCandidate = serde_json::from_str(
            r#"{"candidate":"candidate:1 1 udp 2122260223 192.168.1.2 54321 typ host","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"abcd"}"#,
        )
        .unwrap();

        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert_eq!(candidate.username_fragment.as_deref(), Some("abcd"));
    }

    #[test]
    fn test_candidate_serializes_wire_names() {
        let candidate = IceCandidate {
            candidate: "candidate:2 1 udp 1 10.0.0.1 9 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };

        let value = serde_json::to_value(&candidate).unwrap();
        assert_eq!(value["sdpMid"], "0");
        assert_eq!(value["sdpMLineIndex"], 0);
        assert!(value.get("usernameFragment").is_none());
    }

    #[test]
    fn test_channel_ids_are_unique() {
        let a = ChannelId::next();
        let b = ChannelId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_channel_payload_constructors() {
        let text = ChannelPayload::text("ping-123");
        assert!(text.is_text);
        assert_eq!(text.len(), 8);

        let binary = ChannelPayload::binary(vec![1u8, 2, 3]);
        assert!(!binary.is_text);
        assert_eq!(&binary.data[..], &[1, 2, 3]);
    }
}
