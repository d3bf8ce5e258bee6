//! Signaling: control channel protocol, coordinator and WebSocket server

pub mod coordinator;
pub mod protocol;
pub mod websocket;

pub use coordinator::{Command, CoordinatorHandle, Outbox, SignalingCoordinator};
pub use protocol::{ClientMessage, InboundMessage, OutboundMessage};
pub use websocket::{WebSocketServerHandle, WebSocketSignalingServer};
