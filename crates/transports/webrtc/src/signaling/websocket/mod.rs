//! WebSocket control channel
//!
//! Carries `offer`/`answer`/`candidate`/`ping` JSON text frames between
//! clients and the signaling coordinator.

mod handler;
mod server;

pub use handler::handle_connection;
pub use server::{WebSocketServerHandle, WebSocketSignalingServer};
