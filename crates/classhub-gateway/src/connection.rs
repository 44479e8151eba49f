use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{error, info, warn};

use classhub_types::events::ClientCommand;
use classhub_types::models::Identity;

use crate::dispatcher::Dispatcher;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Longest slice of a rejected frame echoed into the log.
const BAD_FRAME_EXCERPT: usize = 200;

/// Drive one WebSocket from upgrade to close.
///
/// `identity` is present when the token was validated at the HTTP upgrade
/// layer; otherwise the client has to send `identify` before anything that
/// needs an identity will be honoured.
pub async fn handle_connection(socket: WebSocket, dispatcher: Dispatcher, identity: Option<Identity>) {
    let (mut sender, mut receiver) = socket.split();
    let (conn_id, mut events_rx) = dispatcher.connect().await;

    match identity {
        Some(identity) => {
            if let Err(e) = dispatcher.bind(conn_id, identity).await {
                warn!("Could not bind connection {}: {}", conn_id, e);
                dispatcher.disconnect(conn_id).await;
                return;
            }
        }
        None => info!("Connection {} opened without identity, awaiting identify", conn_id),
    }

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward queued events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    let Some(event) = event else { break };

                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to serialize outbound event for {}: {}", conn_id, e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout on {} (missed {} pongs), dropping connection", conn_id, missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let dispatcher_recv = dispatcher.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(cmd) => {
                        // Own task, awaited in order: tearing down the socket
                        // must not cut a write off between persist and apply.
                        let dispatcher = dispatcher_recv.clone();
                        let handled = tokio::spawn(async move { dispatcher.handle(conn_id, cmd).await });
                        if let Err(e) = handled.await {
                            error!("Command task for {} failed: {}", conn_id, e);
                        }
                    }
                    Err(e) => {
                        let excerpt: String = text.chars().take(BAD_FRAME_EXCERPT).collect();
                        warn!("Connection {} bad command: {} -- raw: {}", conn_id, e, excerpt);
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.disconnect(conn_id).await;
}
