//! WebSocket control channel server
//!
//! Accepts connections on the control-channel context (the runtime that calls
//! [`WebSocketSignalingServer::start`]) and serves each on its own task.

use super::handler::handle_connection;
use crate::signaling::coordinator::CoordinatorHandle;
use crate::Result;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// WebSocket signaling server
pub struct WebSocketSignalingServer {
    addr: SocketAddr,
    coordinator: CoordinatorHandle,
}

impl WebSocketSignalingServer {
    /// Server bound to `addr` once started; port 0 picks an ephemeral port
    pub fn new(addr: SocketAddr, coordinator: CoordinatorHandle) -> Self {
        Self { addr, coordinator }
    }

    /// Bind and start the accept loop
    ///
    /// Returns once the listener is bound, so the handle's address is
    /// immediately connectable.
    pub async fn start(self) -> Result<WebSocketServerHandle> {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;

        info!("Control channel listening on ws://{}", local_addr);

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();
        let connection_shutdown = shutdown_tx.clone();
        let coordinator = self.coordinator;

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                debug!("Accepted TCP connection from {}", peer_addr);
                                let coordinator = coordinator.clone();
                                let shutdown_rx = connection_shutdown.subscribe();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, coordinator, shutdown_rx).await {
                                        debug!("WebSocket connection from {} ended with error: {}", peer_addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept WebSocket connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Control channel server received shutdown signal");
                        break;
                    }
                }
            }

            info!("Control channel accept loop exited");
        });

        Ok(WebSocketServerHandle {
            local_addr,
            shutdown_tx,
            task: Some(task),
        })
    }
}

/// Handle for controlling a running server
pub struct WebSocketServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    task: Option<JoinHandle<()>>,
}

impl WebSocketServerHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and close every open control channel
    pub async fn shutdown(mut self) {
        info!("Sending shutdown signal to control channel server");
        let _ = self.shutdown_tx.send(());

        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for WebSocketServerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}
