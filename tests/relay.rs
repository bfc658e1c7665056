//! End-to-end relay tests over a real WebSocket, backed by the in-memory
//! store.

#![allow(clippy::panic)]

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use nostr_relay::app_state::AppState;
use nostr_relay::config::RelayConfig;
use nostr_relay::domain::Event;
use nostr_relay::error::RelayError;
use nostr_relay::server;
use nostr_relay::store::MemoryEventStore;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Relay {
    addr: SocketAddr,
    state: AppState<MemoryEventStore>,
    server: JoinHandle<Result<(), RelayError>>,
}

async fn start() -> Relay {
    let config = RelayConfig {
        shutdown_grace_secs: 2,
        ..RelayConfig::default()
    };
    let state = AppState::new(MemoryEventStore::new(), config);
    let Ok(listener) = TcpListener::bind("127.0.0.1:0").await else {
        panic!("bind");
    };
    let Ok(addr) = listener.local_addr() else {
        panic!("local addr");
    };
    let server = tokio::spawn(server::serve(state.clone(), listener));
    Relay {
        addr,
        state,
        server,
    }
}

async fn connect(relay: &Relay) -> Socket {
    let Ok((socket, _)) = connect_async(format!("ws://{}/", relay.addr)).await else {
        panic!("websocket connect");
    };
    socket
}

/// Waits until the registry holds `count` subscriptions.
async fn registered(relay: &Relay, count: usize) {
    for _ in 0..200 {
        if relay.state.registry.len().await == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("registry never reached {count} entries");
}

fn signed(content: &str, kind: u16, created_at: u64, tags: Vec<Vec<String>>) -> Event {
    let mut event = Event {
        id: String::new(),
        pubkey: "a".repeat(64),
        created_at,
        kind,
        tags,
        content: content.to_string(),
        sig: "0".repeat(128),
    };
    let Ok(id) = event.compute_id() else {
        panic!("digest");
    };
    event.id = id;
    event
}

async fn send(socket: &mut Socket, frame: String) {
    if socket.send(Message::text(frame)).await.is_err() {
        panic!("send failed");
    }
}

async fn publish(socket: &mut Socket, event: &Event) {
    let Ok(json) = serde_json::to_string(event) else {
        panic!("encode");
    };
    send(socket, format!(r#"["EVENT",{json}]"#)).await;
}

/// Next text frame as JSON, or `None` once the connection closes.
async fn recv(socket: &mut Socket) -> Option<Value> {
    loop {
        let frame = match tokio::time::timeout(Duration::from_secs(3), socket.next()).await {
            Ok(frame) => frame,
            Err(_) => panic!("timed out waiting for a frame"),
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                let Ok(value) = serde_json::from_str(text.as_str()) else {
                    panic!("relay sent invalid JSON: {text}");
                };
                return Some(value);
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            _ => return None,
        }
    }
}

async fn next_frame(socket: &mut Socket) -> Value {
    let Some(value) = recv(socket).await else {
        panic!("connection closed unexpectedly");
    };
    value
}

fn label(frame: &Value) -> &str {
    frame.get(0).and_then(Value::as_str).unwrap_or_default()
}

fn event_id(frame: &Value) -> &str {
    frame
        .get(2)
        .and_then(|e| e.get("id"))
        .and_then(Value::as_str)
        .unwrap_or_default()
}

#[tokio::test]
async fn publish_replay_then_live() {
    let relay = start().await;
    let mut publisher = connect(&relay).await;
    let mut reader = connect(&relay).await;

    let first = signed("first", 1, 100, vec![vec!["e".to_string(), "b2".to_string()]]);
    publish(&mut publisher, &first).await;
    assert_eq!(
        next_frame(&mut publisher).await,
        serde_json::json!(["OK", first.id, true, ""])
    );

    send(&mut reader, r#"["REQ","feed",{"kinds":[1],"since":50,"until":150}]"#.to_string()).await;
    let replayed = next_frame(&mut reader).await;
    assert_eq!(label(&replayed), "EVENT");
    assert_eq!(replayed.get(1).and_then(Value::as_str), Some("feed"));
    assert_eq!(event_id(&replayed), first.id);
    assert_eq!(next_frame(&mut reader).await, serde_json::json!(["EOSE", "feed"]));
    registered(&relay, 1).await;

    let second = signed("second", 1, 120, Vec::new());
    publish(&mut publisher, &second).await;
    assert_eq!(label(&next_frame(&mut publisher).await), "OK");

    let live = next_frame(&mut reader).await;
    assert_eq!(label(&live), "EVENT");
    assert_eq!(event_id(&live), second.id);
}

#[tokio::test]
async fn unmatched_filter_yields_only_eose() {
    let relay = start().await;
    let mut socket = connect(&relay).await;

    publish(&mut socket, &signed("note", 1, 100, Vec::new())).await;
    assert_eq!(label(&next_frame(&mut socket).await), "OK");

    send(&mut socket, r#"["REQ","none",{"kinds":[2]}]"#.to_string()).await;
    assert_eq!(next_frame(&mut socket).await, serde_json::json!(["EOSE", "none"]));
}

#[tokio::test]
async fn duplicate_submission_is_not_an_error() {
    let relay = start().await;
    let mut socket = connect(&relay).await;
    let event = signed("once", 1, 100, Vec::new());

    publish(&mut socket, &event).await;
    assert_eq!(next_frame(&mut socket).await, serde_json::json!(["OK", event.id, true, ""]));
    publish(&mut socket, &event).await;
    assert_eq!(
        next_frame(&mut socket).await,
        serde_json::json!(["OK", event.id, true, "duplicate: already have this event"])
    );
    assert_eq!(relay.state.store.len().await, 1);
}

#[tokio::test]
async fn invalid_event_is_rejected_and_session_survives() {
    let relay = start().await;
    let mut socket = connect(&relay).await;

    let mut forged = signed("forged", 1, 100, Vec::new());
    forged.content = "tampered".to_string();
    publish(&mut socket, &forged).await;

    let reply = next_frame(&mut socket).await;
    assert_eq!(label(&reply), "OK");
    assert_eq!(reply.get(2), Some(&Value::Bool(false)));
    let message = reply.get(3).and_then(Value::as_str).unwrap_or_default();
    assert!(message.starts_with("invalid: "), "got {message}");
    assert!(relay.state.store.is_empty().await);

    send(&mut socket, r#"["REQ","after",{}]"#.to_string()).await;
    assert_eq!(next_frame(&mut socket).await, serde_json::json!(["EOSE", "after"]));
}

#[tokio::test]
async fn malformed_frame_closes_the_connection() {
    let relay = start().await;
    let mut socket = connect(&relay).await;

    send(&mut socket, r#"{"not":"an array"}"#.to_string()).await;
    let notice = next_frame(&mut socket).await;
    assert_eq!(label(&notice), "NOTICE");
    assert!(recv(&mut socket).await.is_none());
}

#[tokio::test]
async fn close_stops_live_delivery() {
    let relay = start().await;
    let mut publisher = connect(&relay).await;
    let mut reader = connect(&relay).await;

    send(&mut reader, r#"["REQ","s",{}]"#.to_string()).await;
    assert_eq!(next_frame(&mut reader).await, serde_json::json!(["EOSE", "s"]));
    registered(&relay, 1).await;

    send(&mut reader, r#"["CLOSE","s"]"#.to_string()).await;
    registered(&relay, 0).await;

    publish(&mut publisher, &signed("unseen", 1, 100, Vec::new())).await;
    assert_eq!(label(&next_frame(&mut publisher).await), "OK");

    let quiet = tokio::time::timeout(Duration::from_millis(200), reader.next()).await;
    assert!(quiet.is_err(), "closed subscription still received {quiet:?}");
}

#[tokio::test]
async fn health_and_relay_info_endpoints() {
    let relay = start().await;
    let client = reqwest::Client::new();

    let Ok(response) = client.get(format!("http://{}/health", relay.addr)).send().await else {
        panic!("health request");
    };
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let Ok(health) = response.json::<Value>().await else {
        panic!("health body");
    };
    assert_eq!(health.get("status").and_then(Value::as_str), Some("healthy"));
    assert_eq!(health.get("live_delivery").and_then(Value::as_str), Some("active"));
    assert_eq!(health.get("subscriptions").and_then(Value::as_u64), Some(0));

    let Ok(response) = client
        .get(format!("http://{}/", relay.addr))
        .header("Accept", "application/nostr+json")
        .send()
        .await
    else {
        panic!("info request");
    };
    let Ok(info) = response.json::<Value>().await else {
        panic!("info body");
    };
    assert_eq!(info.get("name").and_then(Value::as_str), Some("nostr-relay"));
    assert_eq!(
        info.get("supported_nips"),
        Some(&serde_json::json!([1, 11]))
    );
}

#[tokio::test]
async fn shutdown_closes_sessions_and_stops_the_server() {
    let relay = start().await;
    let mut socket = connect(&relay).await;
    send(&mut socket, r#"["REQ","s",{}]"#.to_string()).await;
    assert_eq!(next_frame(&mut socket).await, serde_json::json!(["EOSE", "s"]));
    registered(&relay, 1).await;

    relay.state.shutdown.cancel();
    assert!(recv(&mut socket).await.is_none());

    let Ok(Ok(result)) = tokio::time::timeout(Duration::from_secs(5), relay.server).await else {
        panic!("server did not stop");
    };
    assert!(result.is_ok());
    assert!(relay.state.registry.is_empty().await);
}
