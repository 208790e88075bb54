//! WebSocket sessions against a real listener: auth at upgrade, subscribe
//! acks, status fan-out, ping/pong, and unsubscribe semantics.

mod common;

use common::{environment_probing, spawn_app, TestApp};
use futures_util::{SinkExt, StreamExt};
use opsdeck::domain::{EnvStatus, Health};
use opsdeck::hub::HubEvent;
use opsdeck::repository::EnvironmentRepository;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn serve(app: &TestApp) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr, token: &str) -> WsClient {
    let (client, _) = connect_async(format!("ws://{addr}/ws?token={token}"))
        .await
        .unwrap();
    client
}

async fn next_json(client: &mut WsClient) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("websocket error");
        match message {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            // Protocol-level frames are not part of the JSON protocol.
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn send_json(client: &mut WsClient, value: Value) {
    client
        .send(Message::Text(value.to_string()))
        .await
        .unwrap();
}

fn status(health: Health, message: &str) -> EnvStatus {
    EnvStatus {
        health,
        last_check: None,
        message: message.to_string(),
        response_time_ms: None,
    }
}

#[tokio::test]
async fn test_upgrade_rejected_without_valid_token() {
    let app = spawn_app().await;
    let addr = serve(&app).await;

    let missing = connect_async(format!("ws://{addr}/ws")).await;
    assert!(missing.is_err());

    let invalid = connect_async(format!("ws://{addr}/ws?token=bogus")).await;
    assert!(invalid.is_err());
}

#[tokio::test]
async fn test_subscribe_receives_status_updates() {
    let app = spawn_app().await;
    let addr = serve(&app).await;

    let env = environment_probing("127.0.0.1:1".parse().unwrap(), "ws-env");
    app.store.create_environment(&env).await.unwrap();

    let mut client = connect(addr, &app.token).await;
    send_json(
        &mut client,
        json!({"type": "subscribe", "payload": {"environments": [env.id]}}),
    )
    .await;

    let ack = next_json(&mut client).await;
    assert_eq!(ack["type"], "subscribed");
    assert_eq!(ack["payload"]["environments"][0], env.id.to_string());

    app.hub
        .publish(HubEvent::StatusUpdate {
            environment_id: env.id,
            status: status(Health::Healthy, "all good"),
        })
        .await
        .unwrap();

    let update = next_json(&mut client).await;
    assert_eq!(update["type"], "status_update");
    assert_eq!(update["payload"]["environmentId"], env.id.to_string());
    assert_eq!(update["payload"]["status"]["health"], "healthy");
    assert_eq!(update["payload"]["status"]["message"], "all good");
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let app = spawn_app().await;
    let addr = serve(&app).await;
    let env_id = Uuid::new_v4();

    let mut client = connect(addr, &app.token).await;
    send_json(
        &mut client,
        json!({"type": "subscribe", "payload": {"environments": [env_id]}}),
    )
    .await;
    assert_eq!(next_json(&mut client).await["type"], "subscribed");

    app.hub
        .publish(HubEvent::StatusUpdate {
            environment_id: env_id,
            status: status(Health::Healthy, "first"),
        })
        .await
        .unwrap();
    assert_eq!(next_json(&mut client).await["type"], "status_update");

    send_json(
        &mut client,
        json!({"type": "unsubscribe", "payload": {"environments": [env_id]}}),
    )
    .await;
    assert_eq!(next_json(&mut client).await["type"], "unsubscribed");

    app.hub
        .publish(HubEvent::StatusUpdate {
            environment_id: env_id,
            status: status(Health::Unhealthy, "second"),
        })
        .await
        .unwrap();

    // Only a pong should come back after the second publish.
    send_json(&mut client, json!({"type": "ping"})).await;
    let frame = next_json(&mut client).await;
    assert_eq!(frame["type"], "pong");
}

#[tokio::test]
async fn test_ping_pong() {
    let app = spawn_app().await;
    let addr = serve(&app).await;

    let mut client = connect(addr, &app.token).await;
    send_json(&mut client, json!({"type": "ping"})).await;
    let frame = next_json(&mut client).await;
    assert_eq!(frame["type"], "pong");
}

#[tokio::test]
async fn test_malformed_frames_are_ignored() {
    let app = spawn_app().await;
    let addr = serve(&app).await;

    let mut client = connect(addr, &app.token).await;
    send_json(&mut client, json!({"type": "unknown-frame"})).await;
    client.send(Message::Text("not json".to_string())).await.unwrap();

    // The session survives garbage and still answers pings.
    send_json(&mut client, json!({"type": "ping"})).await;
    let frame = next_json(&mut client).await;
    assert_eq!(frame["type"], "pong");
}

#[tokio::test]
async fn test_session_count_tracks_connections() {
    let app = spawn_app().await;
    let addr = serve(&app).await;
    assert_eq!(app.hub.session_count().await.unwrap(), 0);

    let client = connect(addr, &app.token).await;
    // The register command races the handshake completing; give the server
    // task a beat before counting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(app.hub.session_count().await.unwrap(), 1);

    drop(client);
    for _ in 0..100 {
        if app.hub.session_count().await.unwrap() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session was not unregistered after disconnect");
}
