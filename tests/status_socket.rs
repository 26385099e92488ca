mod common;

use agent_server::build_router;
use common::{app_state, EchoAgent};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn next_event(socket: &mut Socket) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for status event")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn request_status(socket: &mut Socket) -> Value {
    socket
        .send(Message::Text(json!({"event": "get-server-status"}).to_string()))
        .await
        .unwrap();
    let reply = next_event(socket).await;
    assert_eq!(reply["event"], "server-status");
    reply["data"].clone()
}

#[tokio::test]
async fn socket_answers_pulls_and_pushes_gate_updates() {
    let state = app_state(true, Arc::new(EchoAgent));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let (mut socket, _) = connect_async(format!("ws://{}/socket", addr)).await.unwrap();

    let status = request_status(&mut socket).await;
    assert_eq!(status["isExclusive"], true);
    assert_eq!(status["runningSessionId"], Value::Null);
    assert_eq!(status["canAcceptNewRequest"], true);
    assert_eq!(status["activeSessions"], 0);

    state.gate.set_running_session("S1");
    let started = next_event(&mut socket).await;
    assert_eq!(started["event"], "server-status-update");
    assert_eq!(started["data"]["runningSessionId"], "S1");
    assert_eq!(started["data"]["canAcceptNewRequest"], false);

    // A stale clear from another session produces no update.
    state.gate.clear_running_session("S0");
    state.gate.clear_running_session("S1");
    let ended = next_event(&mut socket).await;
    assert_eq!(ended["data"]["runningSessionId"], Value::Null);
    assert_eq!(ended["data"]["canAcceptNewRequest"], true);
    assert!(
        ended["data"]["timestamp"].as_u64().unwrap()
            > started["data"]["timestamp"].as_u64().unwrap()
    );

    let status = request_status(&mut socket).await;
    assert_eq!(status["runningSessionId"], Value::Null);
}

#[tokio::test]
async fn every_subscriber_receives_updates() {
    let state = app_state(true, Arc::new(EchoAgent));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let mut sockets = Vec::new();
    for _ in 0..3 {
        let (mut socket, _) = connect_async(format!("ws://{}/socket", addr)).await.unwrap();
        // The pull round trip guarantees the subscription is live.
        request_status(&mut socket).await;
        sockets.push(socket);
    }
    assert_eq!(state.broadcaster.subscriber_count(), 3);

    state.gate.set_running_session("S7");
    for socket in &mut sockets {
        let update = next_event(socket).await;
        assert_eq!(update["event"], "server-status-update");
        assert_eq!(update["data"]["runningSessionId"], "S7");
        assert_eq!(update["data"]["isExclusive"], true);
    }
}
