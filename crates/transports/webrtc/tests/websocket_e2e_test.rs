//! WebSocket control channel end-to-end tests
//!
//! Start a real `WebSocketSignalingServer` on an ephemeral port, backed by
//! the mock engine, and talk to it with a tungstenite client.

mod harness;

use futures_util::{SinkExt, StreamExt};
use gamelink_webrtc::signaling::SignalingCoordinator;
use gamelink_webrtc::{CoordinatorHandle, EchoRelay, RelayConfig, WebSocketSignalingServer};
use harness::{init_logging, wait_for, EngineCall, HarnessError, HarnessResult, MockEngine};
use serde_json::{json, Value};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    engine: MockEngine,
    coordinator: CoordinatorHandle,
    server: gamelink_webrtc::WebSocketServerHandle,
}

impl TestServer {
    async fn start() -> Self {
        let engine = MockEngine::with_auto_answer();
        let (coordinator, events) = SignalingCoordinator::new(
            RelayConfig::default(),
            Arc::new(engine.clone()),
            Arc::new(EchoRelay),
        );
        let (handle, _task) = coordinator.spawn(events);

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        let server = WebSocketSignalingServer::new(addr, handle.clone())
            .start()
            .await
            .unwrap();

        Self {
            engine,
            coordinator: handle,
            server,
        }
    }

    async fn client(&self) -> HarnessResult<Client> {
        let url = format!("ws://{}", self.server.local_addr());
        let (client, _response) = connect_async(url)
            .await
            .map_err(|e| HarnessError::ConnectionError(e.to_string()))?;
        Ok(client)
    }

    async fn shutdown(self) {
        self.server.shutdown().await;
        let _ = self.coordinator.shutdown();
    }
}

async fn next_text(client: &mut Client) -> HarnessResult<String> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .map_err(|_| HarnessError::Timeout("control message".to_string()))?;
        match msg {
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Close(_))) | None => {
                return Err(HarnessError::ConnectionError("closed".to_string()))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(HarnessError::ProtocolError(e.to_string())),
        }
    }
}

#[tokio::test]
async fn test_ping_round_trip() {
    init_logging();
    let server = TestServer::start().await;
    let mut client = server.client().await.unwrap();

    let ping = r#"{"type":"ping","payload":{"seq":1,"sent":1700000000123}}"#;
    client.send(Message::Text(ping.to_string())).await.unwrap();

    assert_eq!(next_text(&mut client).await.unwrap(), ping);

    server.shutdown().await;
}

#[tokio::test]
async fn test_offer_answer_over_websocket() {
    init_logging();
    let server = TestServer::start().await;
    let mut client = server.client().await.unwrap();

    let offer = json!({"type": "offer", "payload": {"type": "offer", "sdp": "S1"}});
    client
        .send(Message::Text(offer.to_string()))
        .await
        .unwrap();

    let answer: Value = serde_json::from_str(&next_text(&mut client).await.unwrap()).unwrap();
    assert_eq!(
        answer,
        json!({"type": "answer", "payload": {"type": "answer", "sdp": "S1-answer"}})
    );

    // A second offer on the same connection is refused.
    client
        .send(Message::Text(offer.to_string()))
        .await
        .unwrap();
    let error: Value = serde_json::from_str(&next_text(&mut client).await.unwrap()).unwrap();
    assert_eq!(error["type"], "error");
    assert_eq!(error["payload"]["code"], "protocol_violation");

    let snapshot = server.coordinator.snapshot().await.unwrap();
    assert_eq!(snapshot.len(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_client_disconnect_tears_down_session() {
    init_logging();
    let server = TestServer::start().await;
    let mut client = server.client().await.unwrap();

    client
        .send(Message::Text(
            json!({"type": "offer", "payload": {"sdp": "S1"}}).to_string(),
        ))
        .await
        .unwrap();
    next_text(&mut client).await.unwrap();

    client.close(None).await.unwrap();
    drop(client);

    let engine = server.engine.clone();
    wait_for(Duration::from_secs(5), "peer close", || {
        engine.count(|c| matches!(c, EngineCall::ClosePeer { .. })) == 1
    })
    .await
    .unwrap();
    assert!(server.coordinator.snapshot().await.unwrap().is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_sessions_are_isolated_per_connection() {
    init_logging();
    let server = TestServer::start().await;
    let mut alice = server.client().await.unwrap();
    let mut bob = server.client().await.unwrap();

    for (client, sdp) in [(&mut alice, "A"), (&mut bob, "B")] {
        client
            .send(Message::Text(
                json!({"type": "offer", "payload": {"sdp": sdp}}).to_string(),
            ))
            .await
            .unwrap();
    }

    let a: Value = serde_json::from_str(&next_text(&mut alice).await.unwrap()).unwrap();
    let b: Value = serde_json::from_str(&next_text(&mut bob).await.unwrap()).unwrap();
    assert_eq!(a["payload"]["sdp"], "A-answer");
    assert_eq!(b["payload"]["sdp"], "B-answer");
    assert_eq!(server.coordinator.snapshot().await.unwrap().len(), 2);

    server.shutdown().await;
}

#[tokio::test]
async fn test_server_shutdown_closes_clients() {
    init_logging();
    let server = TestServer::start().await;
    let mut client = server.client().await.unwrap();

    // Make sure the connection is registered before shutting down.
    client
        .send(Message::Text(r#"{"type":"ping","payload":1}"#.to_string()))
        .await
        .unwrap();
    next_text(&mut client).await.unwrap();

    server.shutdown().await;

    let closed = matches!(
        next_text(&mut client).await,
        Err(HarnessError::ConnectionError(_)) | Err(HarnessError::ProtocolError(_))
    );
    assert!(closed);
}
