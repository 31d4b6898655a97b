use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};

use crate::state::AppState;
use crate::{api, orchestrator, ws};

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Control surface
        .route("/api/monitor", post(api::start_monitor))
        .route("/api/monitor/stop", post(api::stop_monitor))
        .route("/api/config/reload", post(api::reload_config))
        .route("/api/status", get(api::get_status))
        .route("/api/events", get(api::events))
        // Overlay viewers
        .route("/ws", get(ws::handle_viewer_ws))
        .layer(cors)
        .with_state(state)
}

/// Spawn the poll loop and the presence task; both end on shutdown.
pub fn spawn_loops(state: &AppState) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(orchestrator::run_poll_loop(state.clone())),
        tokio::spawn(orchestrator::run_presence_loop(state.clone())),
    ]
}

/// Serve until `state.shutdown` is cancelled. Workers are stopped before open
/// connections are drained.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let loops = spawn_loops(&state);
    let stopping = state.clone();

    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(async move {
            stopping.shutdown.cancelled().await;
            orchestrator::shutdown(&stopping).await;
        })
        .await?;

    for task in loops {
        let _ = task.await;
    }
    Ok(())
}
