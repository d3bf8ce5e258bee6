//! Per-client negotiation and relay state

use super::SessionKey;
use crate::engine::{ChannelOrigin, DataChannel, IceCandidate, PeerConnection};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Negotiation phase
///
/// Phases only move forward; any phase may jump to `Closed`, which is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationPhase {
    /// Session exists, no offer processed yet
    AwaitingOffer,
    /// Offer installed, answer requested from the engine
    AnswerPending,
    /// Answer sent, waiting for the data channel to open
    Negotiating,
    /// Data channel usable
    ChannelOpen,
    /// Torn down
    Closed,
}

impl NegotiationPhase {
    fn rank(self) -> u8 {
        match self {
            NegotiationPhase::AwaitingOffer => 0,
            NegotiationPhase::AnswerPending => 1,
            NegotiationPhase::Negotiating => 2,
            NegotiationPhase::ChannelOpen => 3,
            NegotiationPhase::Closed => 4,
        }
    }

    /// Whether a negotiation is in progress or complete
    pub fn is_active(self) -> bool {
        matches!(
            self,
            NegotiationPhase::AnswerPending
                | NegotiationPhase::Negotiating
                | NegotiationPhase::ChannelOpen
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationPhase::AwaitingOffer => "awaiting_offer",
            NegotiationPhase::AnswerPending => "answer_pending",
            NegotiationPhase::Negotiating => "negotiating",
            NegotiationPhase::ChannelOpen => "channel_open",
            NegotiationPhase::Closed => "closed",
        }
    }
}

impl std::fmt::Display for NegotiationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub remote_candidates: u64,
    pub local_candidates: u64,
    pub messages_relayed: u64,
    pub bytes_relayed: u64,
}

struct ActiveChannel {
    handle: Arc<dyn DataChannel>,
    origin: ChannelOrigin,
}

/// One client's negotiation and relay state
///
/// Holds at most one peer connection and one data channel. Both are released
/// by [`Session::teardown`], channel first, which also runs on drop.
pub struct Session {
    key: SessionKey,
    phase: NegotiationPhase,
    connection: Option<Box<dyn PeerConnection>>,
    channel: Option<ActiveChannel>,
    /// Remote candidates received before the connection existed
    pending_candidates: Vec<IceCandidate>,
    /// Local candidates discovered before the answer was sent
    pending_local_candidates: Vec<IceCandidate>,
    /// The channel reported open before the answer was sent
    opened_before_answer: bool,
    created_at: Instant,
    deadline: Option<Instant>,
    stats: SessionStats,
}

impl Session {
    /// Create a session in `AwaitingOffer`
    pub fn new(key: SessionKey) -> Self {
        debug!(session = %key, "Creating session");

        Self {
            key,
            phase: NegotiationPhase::AwaitingOffer,
            connection: None,
            channel: None,
            pending_candidates: Vec::new(),
            pending_local_candidates: Vec::new(),
            opened_before_answer: false,
            created_at: Instant::now(),
            deadline: None,
            stats: SessionStats::default(),
        }
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Move to `next`
    ///
    /// # Errors
    ///
    /// `Error::ProtocolViolation` if `next` is not ahead of the current phase
    /// or the session is already closed.
    pub fn advance(&mut self, next: NegotiationPhase) -> Result<()> {
        if self.phase == NegotiationPhase::Closed {
            return Err(Error::ProtocolViolation(format!(
                "session {} is closed",
                self.key
            )));
        }
        if next != NegotiationPhase::Closed && next.rank() <= self.phase.rank() {
            return Err(Error::ProtocolViolation(format!(
                "session {} cannot move from {} to {}",
                self.key, self.phase, next
            )));
        }

        debug!(session = %self.key, "Phase {} -> {}", self.phase, next);
        self.phase = next;
        Ok(())
    }

    /// Install the peer connection
    ///
    /// # Errors
    ///
    /// `Error::ProtocolViolation` if a connection is already installed; the
    /// existing one is left untouched and `connection` is closed.
    pub fn attach_connection(&mut self, connection: Box<dyn PeerConnection>) -> Result<()> {
        if self.connection.is_some() {
            connection.close();
            return Err(Error::ProtocolViolation(format!(
                "session {} already has a peer connection",
                self.key
            )));
        }
        self.connection = Some(connection);
        Ok(())
    }

    pub fn connection(&self) -> Option<&dyn PeerConnection> {
        self.connection.as_deref()
    }

    /// Install a data channel, returning the one it replaces
    ///
    /// The caller decides whether a replacement is allowed and closes the
    /// returned channel.
    pub fn install_channel(
        &mut self,
        handle: Arc<dyn DataChannel>,
        origin: ChannelOrigin,
    ) -> Option<Arc<dyn DataChannel>> {
        self.channel
            .replace(ActiveChannel { handle, origin })
            .map(|previous| previous.handle)
    }

    pub fn channel(&self) -> Option<&Arc<dyn DataChannel>> {
        self.channel.as_ref().map(|c| &c.handle)
    }

    pub fn channel_origin(&self) -> Option<ChannelOrigin> {
        self.channel.as_ref().map(|c| c.origin)
    }

    /// Channel usable for sending, only while `ChannelOpen`
    pub fn open_channel(&self) -> Option<&Arc<dyn DataChannel>> {
        if self.phase == NegotiationPhase::ChannelOpen {
            self.channel()
        } else {
            None
        }
    }

    pub fn buffer_remote_candidate(&mut self, candidate: IceCandidate) {
        self.pending_candidates.push(candidate);
    }

    pub fn take_pending_candidates(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.pending_candidates)
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn hold_local_candidate(&mut self, candidate: IceCandidate) {
        self.pending_local_candidates.push(candidate);
    }

    pub fn take_local_candidates(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.pending_local_candidates)
    }

    /// Remember that the channel opened while the answer was still pending
    pub fn mark_opened_before_answer(&mut self) {
        self.opened_before_answer = true;
    }

    /// Whether the channel opened before the answer, clearing the flag
    pub fn take_opened_before_answer(&mut self) -> bool {
        std::mem::take(&mut self.opened_before_answer)
    }

    pub fn record_remote_candidate(&mut self) {
        self.stats.remote_candidates += 1;
    }

    pub fn record_local_candidate(&mut self) {
        self.stats.local_candidates += 1;
    }

    pub fn record_relayed(&mut self, bytes: usize) {
        self.stats.messages_relayed += 1;
        self.stats.bytes_relayed += bytes as u64;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Release the channel, then the connection, and mark the session closed
    ///
    /// Idempotent.
    pub fn teardown(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.handle.close();
        }
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        self.pending_candidates.clear();
        self.pending_local_candidates.clear();
        self.deadline = None;

        if self.phase != NegotiationPhase::Closed {
            debug!(
                session = %self.key,
                messages_relayed = self.stats.messages_relayed,
                bytes_relayed = self.stats.bytes_relayed,
                "Session closed after {:?}",
                self.created_at.elapsed()
            );
            self.phase = NegotiationPhase::Closed;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}
