//! Configuration types for the relay server

use crate::engine::IceServer;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Largest accepted `negotiation_timeout_secs` (one hour)
pub const MAX_NEGOTIATION_TIMEOUT_SECS: u64 = 3600;

/// Main configuration consumed by the signaling core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Control channel bind interface (default: 0.0.0.0)
    pub bind_address: IpAddr,

    /// Control channel listening port (default: 8080, 0 = ephemeral)
    pub listen_port: u16,

    /// STUN server URLs
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Label of the data channel created while answering (default: "dc")
    pub data_channel_label: String,

    /// Data channel mode (default: Unreliable)
    pub data_channel_mode: DataChannelMode,

    /// Maximum concurrent sessions (default: 0 = unlimited)
    pub max_sessions: usize,

    /// Upper bound from offer to open channel, in seconds (default: none)
    pub negotiation_timeout_secs: Option<u64>,

    /// Buffer candidates that arrive before the offer instead of rejecting them
    pub buffer_early_candidates: bool,

    /// Early candidates buffered per session before further ones are refused (default: 32)
    pub max_pending_candidates: usize,

    /// Worker threads of the transport engine runtime (default: 2)
    pub engine_worker_threads: usize,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Data channel mode
///
/// Determines the reliability of message delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataChannelMode {
    /// Reliable, ordered delivery
    Reliable,
    /// Unreliable, unordered delivery with zero retransmits (default)
    ///
    /// Messages may arrive out of order or be lost. State updates in action
    /// games are superseded by the next one anyway.
    Unreliable,
}

impl DataChannelMode {
    /// Get the ordered setting for webrtc-rs
    pub fn ordered(&self) -> bool {
        match self {
            DataChannelMode::Reliable => true,
            DataChannelMode::Unreliable => false,
        }
    }

    /// Get the max retransmits setting for webrtc-rs
    pub fn max_retransmits(&self) -> Option<u16> {
        match self {
            DataChannelMode::Reliable => None,      // Unlimited retransmits
            DataChannelMode::Unreliable => Some(0), // No retransmits
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 8080,
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            data_channel_label: "dc".to_string(),
            data_channel_mode: DataChannelMode::Unreliable,
            max_sessions: 0,
            negotiation_timeout_secs: None,
            buffer_early_candidates: false,
            max_pending_candidates: 32,
            engine_worker_threads: 2,
        }
    }
}

impl RelayConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - neither STUN nor TURN servers are configured
    /// - a STUN URL does not start with `stun:`/`stuns:`
    /// - a TURN URL does not start with `turn:`/`turns:`
    /// - `data_channel_label` is empty
    /// - `negotiation_timeout_secs` is `Some(0)` or above
    ///   [`MAX_NEGOTIATION_TIMEOUT_SECS`]
    /// - `buffer_early_candidates` is set with `max_pending_candidates` 0
    /// - `engine_worker_threads` is 0
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.stun_servers.is_empty() && self.turn_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN or TURN server is required".to_string(),
            ));
        }

        if let Some(url) = self
            .stun_servers
            .iter()
            .find(|url| !url.starts_with("stun:") && !url.starts_with("stuns:"))
        {
            return Err(Error::InvalidConfig(format!(
                "STUN server must start with stun: or stuns:, got {}",
                url
            )));
        }

        if let Some(turn) = self
            .turn_servers
            .iter()
            .find(|turn| !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:"))
        {
            return Err(Error::InvalidConfig(format!(
                "TURN server must start with turn: or turns:, got {}",
                turn.url
            )));
        }

        if self.data_channel_label.is_empty() {
            return Err(Error::InvalidConfig(
                "data_channel_label must not be empty".to_string(),
            ));
        }

        if self.negotiation_timeout_secs == Some(0) {
            return Err(Error::InvalidConfig(
                "negotiation_timeout_secs must be positive when set".to_string(),
            ));
        }

        if let Some(secs) = self
            .negotiation_timeout_secs
            .filter(|secs| *secs > MAX_NEGOTIATION_TIMEOUT_SECS)
        {
            return Err(Error::InvalidConfig(format!(
                "negotiation_timeout_secs must be at most {}, got {}",
                MAX_NEGOTIATION_TIMEOUT_SECS, secs
            )));
        }

        if self.buffer_early_candidates && self.max_pending_candidates == 0 {
            return Err(Error::InvalidConfig(
                "max_pending_candidates must be at least 1 when buffering early candidates"
                    .to_string(),
            ));
        }

        if self.engine_worker_threads == 0 {
            return Err(Error::InvalidConfig(
                "engine_worker_threads must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Control channel socket address
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.listen_port)
    }

    /// Negotiation bound as a duration, if configured
    pub fn negotiation_timeout(&self) -> Option<Duration> {
        self.negotiation_timeout_secs.map(Duration::from_secs)
    }

    /// STUN and TURN servers in the shape handed to the transport engine
    pub fn ice_servers(&self) -> Vec<IceServer> {
        self.stun_servers
            .iter()
            .map(|url| IceServer {
                urls: vec![url.clone()],
                username: String::new(),
                credential: String::new(),
            })
            .chain(self.turn_servers.iter().map(|turn| IceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
            }))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_port, 8080);
        assert_eq!(config.data_channel_label, "dc");
        assert_eq!(config.data_channel_mode, DataChannelMode::Unreliable);
        assert!(config.negotiation_timeout().is_none());
    }

    #[test]
    fn test_data_channel_mode_unreliable() {
        let mode = DataChannelMode::Unreliable;
        assert!(!mode.ordered());
        assert_eq!(mode.max_retransmits(), Some(0));
    }

    #[test]
    fn test_data_channel_mode_reliable() {
        let mode = DataChannelMode::Reliable;
        assert!(mode.ordered());
        assert_eq!(mode.max_retransmits(), None);
    }

    #[test]
    fn test_validate_requires_ice_server() {
        let config = RelayConfig {
            stun_servers: Vec::new(),
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("STUN or TURN"));

        let config = RelayConfig {
            stun_servers: Vec::new(),
            turn_servers: vec![TurnServerConfig {
                url: "turn:turn.example.com:3478".to_string(),
                username: "user".to_string(),
                credential: "secret".to_string(),
            }],
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_urls() {
        let config = RelayConfig {
            stun_servers: vec!["http://stun.example.com".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RelayConfig {
            turn_servers: vec![TurnServerConfig {
                url: "stun:wrong.example.com".to_string(),
                username: String::new(),
                credential: String::new(),
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = RelayConfig {
            negotiation_timeout_secs: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RelayConfig {
            engine_worker_threads: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RelayConfig {
            data_channel_label: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_negotiation_timeout() {
        let config = RelayConfig {
            negotiation_timeout_secs: Some(MAX_NEGOTIATION_TIMEOUT_SECS),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let config = RelayConfig {
            negotiation_timeout_secs: Some(u64::MAX),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("at most 3600"));
    }

    #[test]
    fn test_validate_requires_candidate_buffer_room() {
        let config = RelayConfig {
            buffer_early_candidates: true,
            max_pending_candidates: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RelayConfig {
            buffer_early_candidates: false,
            max_pending_candidates: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ice_servers_include_turn_credentials() {
        let config = RelayConfig {
            turn_servers: vec![TurnServerConfig {
                url: "turns:turn.example.com:5349".to_string(),
                username: "alice".to_string(),
                credential: "hunter2".to_string(),
            }],
            ..Default::default()
        };

        let servers = config.ice_servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.l.google.com:19302".to_string()]);
        assert!(servers[0].username.is_empty());
        assert_eq!(servers[1].username, "alice");
        assert_eq!(servers[1].credential, "hunter2");
    }

    #[test]
    fn test_config_roundtrips_through_json() {
        let config = RelayConfig {
            negotiation_timeout_secs: Some(20),
            max_sessions: 64,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: RelayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.negotiation_timeout(), Some(Duration::from_secs(20)));
        assert_eq!(parsed.max_sessions, 64);
    }
}
