//! Control channel message models
//!
//! Every message is a JSON object `{"type": ..., "payload": ...}`:
//!
//! | type | direction | payload |
//! |---|---|---|
//! | `offer` | client → server | `{"sdp": string}` (a full `RTCSessionDescription` is accepted) |
//! | `answer` | server → client | `{"type": "answer", "sdp": string}` |
//! | `candidate` | both | `{"candidate": string, "sdpMid": string, "sdpMLineIndex": integer}` |
//! | `ping` | both | opaque, echoed verbatim |
//! | `error` | server → client | `{"code": string, "message": string}` |

use crate::engine::IceCandidate;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parsed client message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// Remote offer
    Offer { sdp: String },
    /// Trickled remote candidate
    Candidate(IceCandidate),
    /// Liveness probe; `raw` is the original text, returned verbatim
    Ping { raw: String },
    /// Any other `type`; logged and ignored
    Unknown { kind: String },
}

impl InboundMessage {
    /// Parse one text frame
    ///
    /// # Errors
    ///
    /// `Error::MalformedMessage` when the frame is not a JSON object with a
    /// string `type`, or a known type lacks its required payload fields.
    pub fn parse(text: &str) -> Result<Self> {
        let mut value: Value = serde_json::from_str(text)
            .map_err(|e| Error::MalformedMessage(format!("invalid JSON: {}", e)))?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedMessage("missing string field 'type'".to_string()))?
            .to_string();

        match kind.as_str() {
            "offer" => {
                let sdp = value
                    .get("payload")
                    .and_then(|payload| payload.get("sdp"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        Error::MalformedMessage("offer payload lacks string 'sdp'".to_string())
                    })?;
                Ok(InboundMessage::Offer {
                    sdp: sdp.to_string(),
                })
            }
            "candidate" => {
                let payload = value.get_mut("payload").map(Value::take).ok_or_else(|| {
                    Error::MalformedMessage("candidate message lacks 'payload'".to_string())
                })?;
                let candidate: IceCandidate = serde_json::from_value(payload)
                    .map_err(|e| Error::MalformedMessage(format!("invalid candidate: {}", e)))?;
                Ok(InboundMessage::Candidate(candidate))
            }
            "ping" => Ok(InboundMessage::Ping {
                raw: text.to_string(),
            }),
            _ => Ok(InboundMessage::Unknown { kind }),
        }
    }

    /// Message type for logging
    pub fn kind(&self) -> &str {
        match self {
            InboundMessage::Offer { .. } => "offer",
            InboundMessage::Candidate(_) => "candidate",
            InboundMessage::Ping { .. } => "ping",
            InboundMessage::Unknown { kind } => kind,
        }
    }
}

/// Payload of an outbound `answer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerPayload {
    /// Always `"answer"`
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

/// Payload of an outbound `error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Message sent by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum OutboundMessage {
    Answer(AnswerPayload),
    Candidate(IceCandidate),
    Error(ErrorPayload),
}

impl OutboundMessage {
    pub fn answer(sdp: impl Into<String>) -> Self {
        OutboundMessage::Answer(AnswerPayload {
            sdp_type: "answer".to_string(),
            sdp: sdp.into(),
        })
    }

    pub fn candidate(candidate: IceCandidate) -> Self {
        OutboundMessage::Candidate(candidate)
    }

    /// Error message for a condition reported with `code`
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        OutboundMessage::Error(ErrorPayload {
            code: code.into(),
            message: message.into(),
        })
    }

    pub fn from_error(err: &Error) -> Self {
        Self::error(err.code(), err.to_string())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Payload of a client `offer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferPayload {
    /// Always `"offer"`
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

/// Message sent by a client
///
/// Used by the probe client and tests; the server side parses with
/// [`InboundMessage::parse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum ClientMessage {
    Offer(OfferPayload),
    Candidate(IceCandidate),
    Ping(Value),
}

impl ClientMessage {
    pub fn offer(sdp: impl Into<String>) -> Self {
        ClientMessage::Offer(OfferPayload {
            sdp_type: "offer".to_string(),
            sdp: sdp.into(),
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
