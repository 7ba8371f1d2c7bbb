use crate::config::ApiConfig;
use crate::hub::{BroadcastHub, HubEvent};
use crate::lanes::LaneRouter;
use crate::records::{TrackPath, TrackRecord, TrackUpdate};
use crate::store::TrackStore;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<LaneRouter>,
    pub hub: Arc<BroadcastHub>,
    pub store: Arc<dyn TrackStore>,
    pub max_history_limit: i64,
}

/// Messages pushed to WebSocket clients
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    TrackUpdate(TrackUpdate),
    Resync { skipped: u64 },
    Snapshot(Vec<TrackUpdate>),
}

/// Query parameters for track history
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Start time (RFC 3339), defaults to one hour before `end`
    pub start: Option<DateTime<Utc>>,
    /// End time (RFC 3339, exclusive), defaults to now
    pub end: Option<DateTime<Utc>>,
    /// Maximum results
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    1000
}

/// Optional bounds for a track path, both inclusive
#[derive(Debug, Default, Deserialize)]
pub struct PathQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// Track history response
#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub camera_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub records: Vec<TrackRecord>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/ws/cameras/:camera_id", get(websocket_handler))
        .route("/api/v1/cameras/:camera_id/snapshot", get(get_snapshot))
        .route("/api/v1/cameras/:camera_id/tracks", get(get_track_history))
        .route("/api/v1/cameras/:camera_id/tracks/:track_id", get(get_track_path))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "tracker-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.health().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "store": "connected",
                "lanes": state.router.active_lanes()
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "store": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Live tracks of one camera
#[instrument(skip(state))]
async fn get_snapshot(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
) -> Result<Json<Vec<TrackUpdate>>, ApiError> {
    state.router.snapshot(&camera_id).await.map(Json).map_err(|e| {
        warn!(error = %e, "Snapshot failed");
        api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string(), "LANE_UNAVAILABLE")
    })
}

/// Persisted track versions of one camera, ordered by time
#[instrument(skip(state))]
async fn get_track_history(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let end = params.end.unwrap_or_else(Utc::now);
    let start = params.start.unwrap_or(end - Duration::hours(1));
    if start >= end {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "start must be before end",
            "INVALID_RANGE",
        ));
    }
    if params.limit <= 0 {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "limit must be positive",
            "INVALID_LIMIT",
        ));
    }
    let limit = params.limit.min(state.max_history_limit);

    let records = state
        .store
        .track_history(&camera_id, start, end, limit)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to query track history");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to query track history",
                "QUERY_ERROR",
            )
        })?;

    Ok(Json(HistoryResponse {
        camera_id,
        start,
        end,
        records,
    }))
}

/// Observed path of one track with its distance and average speed
#[instrument(skip(state))]
async fn get_track_path(
    State(state): State<AppState>,
    Path((camera_id, track_id)): Path<(String, u64)>,
    Query(params): Query<PathQuery>,
) -> Result<Json<TrackPath>, ApiError> {
    if let (Some(start), Some(end)) = (params.start, params.end) {
        if start > end {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "start must not be after end",
                "INVALID_RANGE",
            ));
        }
    }

    let path = state
        .store
        .track_path(&camera_id, track_id, params.start, params.end)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to query track path");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to query track path",
                "QUERY_ERROR",
            )
        })?;

    path.map(Json).ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            format!("No detections for track {} on camera {}", track_id, camera_id),
            "TRACK_NOT_FOUND",
        )
    })
}

/// WebSocket upgrade handler
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state, camera_id))
}

/// Stream one camera's updates to a client until either side goes away
async fn handle_websocket(socket: WebSocket, state: AppState, camera_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let mut updates = state.hub.subscribe(&camera_id);
    let (snapshot_tx, mut snapshot_rx) = mpsc::channel::<()>(4);

    metrics::gauge!("tracker.api.ws_clients").increment(1.0);
    info!(camera_id = %camera_id, "WebSocket client connected");

    let router = state.router.clone();
    let camera = camera_id.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                event = updates.next() => match event {
                    Some(HubEvent::Update(update)) => ServerMessage::TrackUpdate((*update).clone()),
                    Some(HubEvent::Resync { skipped }) => ServerMessage::Resync { skipped },
                    None => break,
                },
                Some(()) = snapshot_rx.recv() => match router.snapshot(&camera).await {
                    Ok(tracks) => ServerMessage::Snapshot(tracks),
                    Err(e) => {
                        warn!(camera_id = %camera, error = %e, "Snapshot for client failed");
                        continue;
                    }
                },
            };

            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    error!(error = %e, "Failed to encode server message");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let camera = camera_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Text(text)) if text.trim() == "snapshot" => {
                    if snapshot_tx.send(()).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Text(text)) => {
                    debug!(camera_id = %camera, command = %text, "Ignoring unknown command");
                }
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    warn!(camera_id = %camera, error = %e, "WebSocket error");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    metrics::gauge!("tracker.api.ws_clients").decrement(1.0);
    info!(camera_id = %camera_id, "WebSocket client disconnected");
}

/// Start the API server, stopping once `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting tracker API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
