//! Data channel relay policies
//!
//! A policy sees every payload received on an open channel. It runs on the
//! coordinator task, so it must not block; `DataChannel::send` only queues.

use crate::engine::{ChannelPayload, DataChannel};
use crate::session::SessionKey;

/// Application relay behaviour
pub trait RelayPolicy: Send + Sync {
    /// Handle one inbound payload from `channel`
    ///
    /// Returns the number of bytes sent back out, for relay statistics.
    fn relay(&self, key: SessionKey, payload: ChannelPayload, channel: &dyn DataChannel) -> usize;

    /// Policy name for logging
    fn name(&self) -> &'static str;
}

/// Sends every payload back unchanged on the channel it arrived on
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoRelay;

impl RelayPolicy for EchoRelay {
    fn relay(&self, _key: SessionKey, payload: ChannelPayload, channel: &dyn DataChannel) -> usize {
        let len = payload.len();
        channel.send(payload);
        len
    }

    fn name(&self) -> &'static str {
        "echo"
    }
}
