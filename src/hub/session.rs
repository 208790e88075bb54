//! Per-connection session: a reader task decoding inbound frames for the
//! hub, and a writer task draining the bounded send queue and heartbeating.
//! Either side terminating stops the other and closes the connection.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::hub::hub::{HubHandle, SessionHandle, SESSION_QUEUE_CAPACITY};
use crate::hub::protocol::{ClientFrame, ServerFrame};

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Server-side protocol ping cadence
    pub ping_interval: Duration,
    /// Read deadline; refreshed by any inbound message (pongs included)
    pub pong_timeout: Duration,
    /// Hard cap on inbound frame payloads
    pub max_message_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
            max_message_bytes: 512 * 1024,
        }
    }
}

/// Drive one WebSocket connection until it closes, is evicted, or times out.
pub async fn run_session(socket: WebSocket, hub: HubHandle, config: SessionConfig) {
    let session_id = Uuid::new_v4();
    let (frame_tx, frame_rx) = mpsc::channel::<ServerFrame>(SESSION_QUEUE_CAPACITY);

    if hub
        .register(SessionHandle {
            id: session_id,
            tx: frame_tx,
        })
        .await
        .is_err()
    {
        return;
    }
    debug!(session = %session_id, "websocket session opened");

    let (ws_tx, ws_rx) = socket.split();
    let (done_tx, mut done_rx) = oneshot::channel::<()>();

    let writer = tokio::spawn(async move {
        write_loop(ws_tx, frame_rx, config.ping_interval).await;
        let _ = done_tx.send(());
    });

    read_loop(ws_rx, &hub, session_id, &config, &mut done_rx).await;

    // Reader is done (client close, deadline, oversize frame) or the writer
    // ended first (queue closed by eviction or shutdown). Unregistering
    // drops the hub's sender, which in turn lets the writer drain and stop.
    let _ = hub.unregister(session_id).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), writer).await;
    debug!(session = %session_id, "websocket session closed");
}

async fn write_loop(
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    mut frame_rx: mpsc::Receiver<ServerFrame>,
    ping_interval: Duration,
) {
    let mut ping_tick = tokio::time::interval(ping_interval);
    ping_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick of a tokio interval fires immediately; skip it so the
    // first ping goes out one full interval after connect.
    ping_tick.tick().await;

    loop {
        tokio::select! {
            maybe = frame_rx.recv() => match maybe {
                Some(frame) => {
                    let json = match serde_json::to_string(&frame) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("failed to serialize outbound frame: {e}");
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(json)).await.is_err() {
                        return;
                    }
                }
                None => {
                    // Queue closed: evicted as a slow consumer or the hub
                    // shut down. Say goodbye properly.
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: "".into(),
                        })))
                        .await;
                    return;
                }
            },
            _ = ping_tick.tick() => {
                if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn read_loop(
    mut ws_rx: futures_util::stream::SplitStream<WebSocket>,
    hub: &HubHandle,
    session_id: Uuid,
    config: &SessionConfig,
    writer_done: &mut oneshot::Receiver<()>,
) {
    loop {
        let inbound = tokio::select! {
            _ = &mut *writer_done => return,
            inbound = tokio::time::timeout(config.pong_timeout, ws_rx.next()) => inbound,
        };

        let message = match inbound {
            Err(_) => {
                debug!(session = %session_id, "read deadline exceeded, closing");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(_))) => return,
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => {
                if text.len() > config.max_message_bytes {
                    warn!(session = %session_id, bytes = text.len(), "oversize frame, closing session");
                    return;
                }
                match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(ClientFrame::Subscribe { environments }) => {
                        if hub.subscribe(session_id, environments).await.is_err() {
                            return;
                        }
                    }
                    Ok(ClientFrame::Unsubscribe { environments }) => {
                        if hub.unsubscribe(session_id, environments).await.is_err() {
                            return;
                        }
                    }
                    Ok(ClientFrame::Ping) => {
                        if hub.ping(session_id).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        debug!(session = %session_id, "ignoring malformed frame: {e}");
                    }
                }
            }
            Message::Binary(payload) if payload.len() > config.max_message_bytes => {
                warn!(session = %session_id, "oversize binary frame, closing session");
                return;
            }
            Message::Close(_) => return,
            // Protocol pings are answered by axum; pongs just refresh the
            // deadline by arriving.
            _ => {}
        }
    }
}
