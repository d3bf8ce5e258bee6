//! Error types for the gamelink signaling and relay core

/// Result type alias using gamelink Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while negotiating or relaying
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Control message with missing or invalid fields
    #[error("Malformed control message: {0}")]
    MalformedMessage(String),

    /// Message not allowed in the session's current phase
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Concurrent session cap reached
    #[error("Session limit exceeded: at most {0} concurrent sessions")]
    SessionLimitExceeded(usize),

    /// Too many candidates buffered ahead of the offer
    #[error("Candidate buffer full: at most {0} candidates before an offer")]
    CandidateBufferFull(usize),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// Negotiation did not reach an open channel in time
    #[error("Negotiation timeout: {0}")]
    NegotiationTimeout(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Stable snake_case code carried by outbound `error` messages
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidConfig(_) => "invalid_config",
            Error::MalformedMessage(_) => "malformed_message",
            Error::ProtocolViolation(_) => "protocol_violation",
            Error::SessionLimitExceeded(_) => "session_limit_exceeded",
            Error::CandidateBufferFull(_) => "candidate_buffer_full",
            Error::SdpError(_) => "sdp_error",
            Error::IceCandidateError(_) => "ice_candidate_error",
            Error::PeerConnectionError(_) => "peer_connection_error",
            Error::NegotiationTimeout(_) => "negotiation_timeout",
            Error::SerializationError(_) => "serialization_error",
            Error::IoError(_) => "io_error",
            Error::Other(_) => "internal_error",
        }
    }

    /// Check if this error was caused by what the client sent
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::MalformedMessage(_)
                | Error::ProtocolViolation(_)
                | Error::SessionLimitExceeded(_)
                | Error::CandidateBufferFull(_)
                | Error::IceCandidateError(_)
        )
    }

    /// Check if this error came out of the peer transport
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Error::SdpError(_)
                | Error::PeerConnectionError(_)
                | Error::NegotiationTimeout(_)
        )
    }
}
