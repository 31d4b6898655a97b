use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream::Stream;
use std::convert::Infallible;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use danmu_collector::TargetError;
use danmu_common::{
    ErrorResponse, LifecycleEvent, MonitorRequest, MonitorResponse, ReloadResponse, StatusResponse,
};

use crate::orchestrator::{self, ControlError};
use crate::state::AppState;

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = match &self {
            ControlError::Target(TargetError::InvalidFormat(_)) => StatusCode::BAD_REQUEST,
            ControlError::Target(TargetError::Unresolvable { .. }) => StatusCode::BAD_GATEWAY,
            ControlError::Collector(_) | ControlError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        tracing::warn!(status = status.as_u16(), error = %self, "control request failed");
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

pub async fn start_monitor(
    State(state): State<AppState>,
    Json(req): Json<MonitorRequest>,
) -> Result<Json<MonitorResponse>, ControlError> {
    orchestrator::start_monitoring(&state, &req.target)
        .await
        .map(Json)
}

pub async fn stop_monitor(
    State(state): State<AppState>,
    Json(req): Json<MonitorRequest>,
) -> Result<Json<MonitorResponse>, ControlError> {
    orchestrator::stop_monitoring(&state, &req.target)
        .await
        .map(Json)
}

pub async fn reload_config(
    State(state): State<AppState>,
) -> Result<Json<ReloadResponse>, ControlError> {
    orchestrator::reload_config(&state).await.map(Json)
}

pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        viewers: state.viewers().len(),
        targets: state.targets.desired().into_iter().collect(),
        workers: state.workers.snapshot(),
    })
}

pub async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();

    // Current viewer count first, so a fresh subscriber has a baseline
    let initial = serde_json::to_string(&LifecycleEvent::viewer_count(state.viewers().len()))
        .ok()
        .map(|json| Ok(Event::default().data(json)));

    let feed = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => match serde_json::to_string(&event) {
            Ok(json) => Some(Ok(Event::default().data(json))),
            Err(_) => None,
        },
        Err(_) => None,
    });

    // Ends on shutdown so the connection can drain
    let feed = futures::StreamExt::take_until(feed, state.shutdown.clone().cancelled_owned());
    let stream = futures::stream::iter(initial).chain(feed);

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    )
}
