use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use uuid::Uuid;

use crate::state::AppState;
use crate::viewers::{Outbound, ViewerHandle, VIEWER_QUEUE};

/// Overlay viewers connect here and only ever receive frames.
pub async fn handle_viewer_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_viewer_socket(socket, state))
}

async fn handle_viewer_socket(socket: WebSocket, state: AppState) {
    let id = Uuid::new_v4();
    let config = state.config.current();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(VIEWER_QUEUE);
    let handle = ViewerHandle::new(tx.clone());
    let closed = handle.closed.clone();

    // Task: drain the viewer's queue into the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Frames(frames) => {
                    for text in frames.iter() {
                        if sender.send(WsMessage::Text(text.clone().into())).await.is_err() {
                            return;
                        }
                    }
                }
                Outbound::Ping => {
                    if sender.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    // Task: any inbound frame, pongs included, counts as liveness
    let traffic = Arc::new(AtomicBool::new(true));
    let seen = traffic.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            seen.store(true, Ordering::Relaxed);
            if let WsMessage::Close(_) = msg {
                break;
            }
        }
    });

    // Task: ping on every tick; a tick with no traffic since the last ping
    // means the viewer is gone
    let period = config.server.heartbeat();
    let mut heartbeat_task = tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            if !traffic.swap(false, Ordering::Relaxed) {
                tracing::info!(viewer = %id, "heartbeat timed out");
                break;
            }
            if tx.try_send(Outbound::Ping).is_err() {
                tracing::info!(viewer = %id, "heartbeat ping not delivered");
                break;
            }
        }
    });

    let viewers = state
        .broadcaster
        .attach(id, handle, config.display.style(), config.display.max_comments)
        .await;
    tracing::info!(viewer = %id, viewers, "viewer connected");

    tokio::select! {
        _ = &mut send_task => {}
        _ = &mut recv_task => {}
        _ = &mut heartbeat_task => {}
        _ = closed.cancelled() => {}
        _ = state.shutdown.cancelled() => {}
    }

    send_task.abort();
    recv_task.abort();
    heartbeat_task.abort();
    state.viewers().remove(&id);
    tracing::info!(viewer = %id, viewers = state.viewers().len(), "viewer disconnected");
}
