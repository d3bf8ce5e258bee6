//! Events delivered from the transport engine to the signaling coordinator

use super::{ChannelId, ChannelPayload, DataChannel, IceCandidate};
use crate::session::SessionKey;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Sender half handed to every peer connection
pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;

/// Receiver half drained by the coordinator
pub type EngineEventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// Create the engine event queue
///
/// Unbounded so engine callbacks never block on a busy coordinator.
pub fn event_channel() -> (EngineEventSender, EngineEventReceiver) {
    mpsc::unbounded_channel()
}

/// Which side created a data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrigin {
    /// Created by this server while answering
    Local,
    /// Announced by the remote peer
    Remote,
}

/// Asynchronous outcome reported by the transport engine
pub enum EngineEvent {
    /// Local answer produced
    AnswerReady {
        key: SessionKey,
        sdp: String,
    },

    /// Local ICE candidate gathered
    CandidateDiscovered {
        key: SessionKey,
        candidate: IceCandidate,
    },

    /// A data channel reached the open state
    ChannelOpened {
        key: SessionKey,
        channel: Arc<dyn DataChannel>,
        origin: ChannelOrigin,
    },

    /// Payload received on the data channel `channel`
    MessageReceived {
        key: SessionKey,
        channel: ChannelId,
        payload: ChannelPayload,
    },

    /// An engine operation failed during negotiation
    NegotiationFailed {
        key: SessionKey,
        reason: String,
    },

    /// The peer transport failed or closed after negotiation
    TransportFailed {
        key: SessionKey,
        reason: String,
    },
}

impl EngineEvent {
    /// Session the event belongs to
    pub fn key(&self) -> SessionKey {
        match self {
            EngineEvent::AnswerReady { key, .. }
            | EngineEvent::CandidateDiscovered { key, .. }
            | EngineEvent::ChannelOpened { key, .. }
            | EngineEvent::MessageReceived { key, .. }
            | EngineEvent::NegotiationFailed { key, .. }
            | EngineEvent::TransportFailed { key, .. } => *key,
        }
    }

    /// Event name for logging
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::AnswerReady { .. } => "answer_ready",
            EngineEvent::CandidateDiscovered { .. } => "candidate_discovered",
            EngineEvent::ChannelOpened { .. } => "channel_opened",
            EngineEvent::MessageReceived { .. } => "message_received",
            EngineEvent::NegotiationFailed { .. } => "negotiation_failed",
            EngineEvent::TransportFailed { .. } => "transport_failed",
        }
    }
}

impl fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineEvent::AnswerReady { key, sdp } => f
                .debug_struct("AnswerReady")
                .field("key", key)
                .field("sdp_len", &sdp.len())
                .finish(),
            EngineEvent::CandidateDiscovered { key, candidate } => f
                .debug_struct("CandidateDiscovered")
                .field("key", key)
                .field("candidate", &candidate.candidate)
                .finish(),
            EngineEvent::ChannelOpened {
                key,
                channel,
                origin,
            } => f
                .debug_struct("ChannelOpened")
                .field("key", key)
                .field("channel", &channel.id())
                .field("label", &channel.label())
                .field("origin", origin)
                .finish(),
            EngineEvent::MessageReceived {
                key,
                channel,
                payload,
            } => f
                .debug_struct("MessageReceived")
                .field("key", key)
                .field("channel", channel)
                .field("len", &payload.len())
                .field("is_text", &payload.is_text)
                .finish(),
            EngineEvent::NegotiationFailed { key, reason } => f
                .debug_struct("NegotiationFailed")
                .field("key", key)
                .field("reason", reason)
                .finish(),
            EngineEvent::TransportFailed { key, reason } => f
                .debug_struct("TransportFailed")
                .field("key", key)
                .field("reason", reason)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ConnectionId;

    #[test]
    fn test_event_key_and_name() {
        let key = SessionKey::new(ConnectionId::new(), 3);

        let event = EngineEvent::AnswerReady {
            key,
            sdp: "v=0".to_string(),
        };
        assert_eq!(event.key(), key);
        assert_eq!(event.name(), "answer_ready");

        let event = EngineEvent::TransportFailed {
            key,
            reason: "ice failed".to_string(),
        };
        assert_eq!(event.key(), key);
        assert_eq!(event.name(), "transport_failed");
    }

    #[test]
    fn test_debug_omits_sdp_body() {
        let key = SessionKey::new(ConnectionId::new(), 1);
        let event = EngineEvent::AnswerReady {
            key,
            sdp: "v=0\r\no=- 1 1 IN IP4 0.0.0.0".to_string(),
        };
        let rendered = format!("{:?}", event);
        assert!(rendered.contains("sdp_len"));
        assert!(!rendered.contains("IN IP4"));
    }

    #[tokio::test]
    async fn test_event_channel_delivers_in_order() {
        let (tx, mut rx) = event_channel();
        let key = SessionKey::new(ConnectionId::new(), 1);

        tx.send(EngineEvent::AnswerReady {
            key,
            sdp: "a".to_string(),
        })
        .unwrap();
        tx.send(EngineEvent::NegotiationFailed {
            key,
            reason: "b".to_string(),
        })
        .unwrap();

        assert_eq!(rx.recv().await.unwrap().name(), "answer_ready");
        assert_eq!(rx.recv().await.unwrap().name(), "negotiation_failed");
    }
}
