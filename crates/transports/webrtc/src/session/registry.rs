//! Registry of live sessions keyed by control-channel connection

use super::{ConnectionId, NegotiationPhase, Session, SessionKey, SessionStats};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Point-in-time view of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub key: SessionKey,
    pub phase: NegotiationPhase,
    pub has_channel: bool,
    pub age: Duration,
    pub stats: SessionStats,
}

/// Exclusive owner of every [`Session`]
///
/// One connection maps to at most one session. Not synchronized: it is
/// owned by the signaling coordinator task.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<ConnectionId, Session>,
    next_generation: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing session of `connection`, or a new one in `AwaitingOffer`
    pub fn get_or_create(&mut self, connection: ConnectionId) -> &mut Session {
        let next_generation = &mut self.next_generation;
        self.sessions.entry(connection).or_insert_with(|| {
            *next_generation += 1;
            Session::new(SessionKey::new(connection, *next_generation))
        })
    }

    pub fn lookup(&self, connection: ConnectionId) -> Option<&Session> {
        self.sessions.get(&connection)
    }

    pub fn lookup_mut(&mut self, connection: ConnectionId) -> Option<&mut Session> {
        self.sessions.get_mut(&connection)
    }

    /// Session matching `key` exactly, generation included
    ///
    /// Engine events are resolved through this so that an event from a torn
    /// down session never reaches a newer session of the same connection.
    pub fn lookup_key(&mut self, key: SessionKey) -> Option<&mut Session> {
        self.sessions
            .get_mut(&key.connection)
            .filter(|session| session.key() == key)
    }

    /// Tear down and forget the session of `connection`
    ///
    /// Returns whether a session was removed; removing an unknown connection
    /// is a no-op.
    pub fn remove(&mut self, connection: ConnectionId) -> bool {
        match self.sessions.remove(&connection) {
            Some(mut session) => {
                session.teardown();
                let stats = session.stats();
                info!(
                    session = %session.key(),
                    messages_relayed = stats.messages_relayed,
                    bytes_relayed = stats.bytes_relayed,
                    "Session removed"
                );
                true
            }
            None => {
                debug!(connection = %connection, "No session to remove");
                false
            }
        }
    }

    /// Remove only if the registered session still has `key`
    pub fn remove_key(&mut self, key: SessionKey) -> bool {
        if self.lookup_key(key).is_some() {
            self.remove(key.connection)
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Earliest negotiation deadline of any session
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sessions.values().filter_map(Session::deadline).min()
    }

    /// Sessions whose negotiation deadline is at or before `now`
    pub fn expired(&self, now: Instant) -> Vec<SessionKey> {
        self.sessions
            .values()
            .filter(|session| session.deadline().is_some_and(|deadline| deadline <= now))
            .map(Session::key)
            .collect()
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut snapshot: Vec<SessionSnapshot> = self
            .sessions
            .values()
            .map(|session| SessionSnapshot {
                key: session.key(),
                phase: session.phase(),
                has_channel: session.channel().is_some(),
                age: session.created_at().elapsed(),
                stats: session.stats(),
            })
            .collect();
        snapshot.sort_by_key(|s| s.key.generation);
        snapshot
    }

    /// Tear down every session
    pub fn clear(&mut self) {
        let connections: Vec<ConnectionId> = self.sessions.keys().copied().collect();
        for connection in connections {
            self.remove(connection);
        }
    }
}
