//! Per-connection WebSocket handling
//!
//! Reads text frames and hands them to the coordinator; a writer task drains
//! the connection's outbox onto the socket. The outbox is the only path by
//! which the coordinator (or an engine event it handles) writes to a client.

use crate::session::ConnectionId;
use crate::signaling::coordinator::CoordinatorHandle;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Message, Result as WsResult},
};
use tracing::{debug, info, instrument, warn};

/// Serve one control-channel connection until it closes or the server stops
#[instrument(skip_all, name = "control_connection")]
pub async fn handle_connection(
    stream: TcpStream,
    coordinator: CoordinatorHandle,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> WsResult<()> {
    let addr = stream.peer_addr()?;
    let ws_stream = accept_async(stream).await?;

    let connection = ConnectionId::new();
    info!(connection = %connection, "Control channel connected from {}", addr);

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    if coordinator.connect(connection, tx).is_err() {
        warn!(connection = %connection, "Signaling coordinator stopped, refusing connection");
        let _ = ws_tx.close().await;
        return Ok(());
    }

    // Ends when the coordinator drops the outbox (after Disconnected or at shutdown).
    let forward_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(text) => {
                        if let Err(e) = ws_tx.send(Message::Text(text)).await {
                            debug!(connection = %connection, "Failed to send WebSocket message: {}", e);
                            break;
                        }
                    }
                    None => break,
                },
                Some(data) = pong_rx.recv() => {
                    if ws_tx.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    let result = loop {
        tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if coordinator.inbound(connection, text).is_err() {
                        break Ok(());
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    warn!(connection = %connection, "Ignoring {}-byte binary frame", data.len());
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = pong_tx.send(data);
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!(connection = %connection, "Control channel closed by client");
                    break Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(connection = %connection, "Control channel error: {}", e);
                    break Err(e);
                }
            },
            _ = shutdown_rx.recv() => {
                debug!(connection = %connection, "Server shutting down, closing control channel");
                break Ok(());
            }
        }
    };

    let _ = coordinator.disconnect(connection);
    drop(pong_tx);
    let _ = forward_task.await;

    result
}
