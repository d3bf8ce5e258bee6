//! Session management
//!
//! A [`Session`] is one client's negotiation and relay state. The
//! [`SessionRegistry`] owns every session, keyed by the control-channel
//! connection that created it.

#[allow(clippy::module_inception)]
mod session;
mod registry;

pub use registry::{SessionRegistry, SessionSnapshot};
pub use session::{NegotiationPhase, Session, SessionStats};

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of one control-channel connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Fresh random identity
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identity of one session
///
/// The generation is issued by the registry; a connection that negotiates
/// again after teardown gets a new one, so engine events addressed to the
/// old session never match the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub connection: ConnectionId,
    pub generation: u64,
}

impl SessionKey {
    pub fn new(connection: ConnectionId, generation: u64) -> Self {
        Self {
            connection,
            generation,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.connection, self.generation)
    }
}
