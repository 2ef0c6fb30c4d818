//! WebSocket transport tests against a local tungstenite server

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use safesignal::auth::Credentials;
use safesignal::channel::{ChannelEndpoint, ChannelError, ChannelManager, ChannelState, ReconnectConfig};
use safesignal::protocol::{InboundMessage, OutboundMessage, UserId};

const WAIT: Duration = Duration::from_secs(5);

/// Accepts one client, records the request URI, pushes `greeting`, then
/// forwards every text frame it receives.
async fn spawn_server(
    greeting: &'static str,
) -> (String, oneshot::Receiver<String>, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (uri_tx, uri_rx) = oneshot::channel();
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let _ = uri_tx.send(request.uri().to_string());
            Ok(response)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback).await.unwrap();

        ws.send(Message::Text(greeting.to_string().into())).await.unwrap();
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Text(text) = message {
                let _ = frames_tx.send(text.to_string());
            }
        }
    });

    (format!("ws://{addr}"), uri_rx, frames_rx)
}

#[tokio::test]
async fn websocket_link_carries_frames_both_ways() {
    let (base, uri_rx, mut frames_rx) = spawn_server(r#"{"type":"contact_started","user_id":42}"#).await;
    let channel = ChannelManager::websocket(ChannelEndpoint::parse(&base).unwrap(), ReconnectConfig::disabled());

    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
    let _sub = channel.subscribe(move |message| {
        let _ = inbound_tx.send(message.clone());
        Ok(())
    });

    channel.connect(&Credentials::new("t1", UserId(7))).await.unwrap();
    assert_eq!(channel.state(), ChannelState::Open);
    assert_eq!(uri_rx.await.unwrap(), "/ws/7?token=t1");

    let inbound = tokio::time::timeout(WAIT, inbound_rx.recv()).await.unwrap().unwrap();
    assert_eq!(inbound, InboundMessage::ContactStarted { user_id: UserId(42) });

    assert!(channel.send(&OutboundMessage::StartSession));
    assert!(channel.send(&OutboundMessage::EmergencyAlert { lat: 34.6794, lng: -82.8351 }));

    let first = tokio::time::timeout(WAIT, frames_rx.recv()).await.unwrap().unwrap();
    let second = tokio::time::timeout(WAIT, frames_rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, r#"{"type":"start_session"}"#);
    let alert: serde_json::Value = serde_json::from_str(&second).unwrap();
    assert_eq!(alert["type"], "emergency_alert");
    assert_eq!(alert["lat"], 34.6794);

    channel.teardown();
    // The server sees the socket close once the writer shuts down
    let closed = tokio::time::timeout(WAIT, frames_rx.recv()).await.unwrap();
    assert!(closed.is_none());
}

#[tokio::test]
async fn refused_connection_is_an_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let endpoint = ChannelEndpoint::parse(&format!("ws://{addr}")).unwrap();
    let channel = ChannelManager::websocket(endpoint, ReconnectConfig::disabled());

    let result = channel.connect(&Credentials::new("t1", UserId(7))).await;
    assert!(matches!(result, Err(ChannelError::Connect(_))));
    assert_eq!(channel.state(), ChannelState::Closed);
}
