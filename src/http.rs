//! The JSON/WebSocket surface: status, memory summary, and manual control.
//! Every handler only ever reaches the tick actor through `AppState::command_tx`
//! — never by mutating controller state directly (§5).

use crate::controller::{ControlMode, DecisionInfo, ManualCommand, ManualRequest};
use crate::domain::PerRoad;
use crate::memory::MemorySummary;
use crate::predictor::Prediction;
use crate::metrics::RoadMetrics;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};

/// The same document pushed to `GET /status` and to every WebSocket observer.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub current_green: crate::domain::Road,
    pub remaining_green: i64,
    pub mode: ControlMode,
    pub manual_cmd: Option<ManualCommand>,
    pub remaining_manual: Option<u64>,
    pub last_decision: DecisionInfo,
    pub metrics: PerRoad<RoadMetrics>,
    pub predictions: PerRoad<Prediction>,
    pub sim_time: u64,
}

/// A command the surface hands to the tick actor. Carried over a
/// single-producer `mpsc` channel; the actor drains it once per tick.
#[derive(Debug, Clone, Copy)]
pub enum SurfaceCommand {
    Manual(ManualRequest),
    Start,
    Stop,
}

pub struct AppState {
    pub command_tx: mpsc::Sender<SurfaceCommand>,
    pub status: Arc<RwLock<StatusSnapshot>>,
    pub status_broadcast: broadcast::Sender<StatusSnapshot>,
    pub memory_summary: Arc<RwLock<MemorySummary>>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/memory/summary", get(memory_summary_handler))
        .route("/control/mode", get(get_mode_handler).post(post_mode_handler))
        .route("/control/manual/apply", post(manual_apply_handler))
        .route("/control/manual/cancel", post(manual_cancel_handler))
        .route("/control/start", post(control_start_handler))
        .route("/control/stop", post(control_stop_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusSnapshot> {
    Json(state.status.read().await.clone())
}

async fn memory_summary_handler(State(state): State<Arc<AppState>>) -> Json<MemorySummary> {
    Json(state.memory_summary.read().await.clone())
}

#[derive(Debug, Serialize)]
struct ModeResponse {
    mode: ControlMode,
    manual_cmd: Option<ManualCommand>,
    remaining_manual: Option<u64>,
}

async fn get_mode_handler(State(state): State<Arc<AppState>>) -> Json<ModeResponse> {
    let status = state.status.read().await;
    Json(ModeResponse {
        mode: status.mode,
        manual_cmd: status.manual_cmd,
        remaining_manual: status.remaining_manual,
    })
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ModeRequest {
    Apply { command: ManualCommand, duration: u64 },
    Cancel,
}

#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
}

fn invalid(reason: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(ApiError { error: reason.into() })).into_response()
}

fn validate_duration(duration: u64) -> Result<(), Response> {
    if !(10..=120).contains(&duration) {
        return Err(invalid(format!("duration must be in [10,120], got {duration}")));
    }
    Ok(())
}

async fn post_mode_handler(State(state): State<Arc<AppState>>, Json(body): Json<ModeRequest>) -> Response {
    match body {
        ModeRequest::Apply { command, duration } => apply_manual(state, command, duration).await,
        ModeRequest::Cancel => cancel_manual(state).await,
    }
}

#[derive(Debug, Deserialize)]
struct ManualApplyRequest {
    command: ManualCommand,
    duration: u64,
}

async fn manual_apply_handler(State(state): State<Arc<AppState>>, Json(body): Json<ManualApplyRequest>) -> Response {
    apply_manual(state, body.command, body.duration).await
}

async fn apply_manual(state: Arc<AppState>, command: ManualCommand, duration: u64) -> Response {
    if let Err(resp) = validate_duration(duration) {
        return resp;
    }
    let request = ManualRequest::Apply { command, duration_secs: duration };
    match state.command_tx.send(SurfaceCommand::Manual(request)).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, Json(ApiError { error: "tick actor unreachable".into() })).into_response(),
    }
}

async fn manual_cancel_handler(State(state): State<Arc<AppState>>) -> Response {
    cancel_manual(state).await
}

async fn cancel_manual(state: Arc<AppState>) -> Response {
    match state.command_tx.send(SurfaceCommand::Manual(ManualRequest::Cancel)).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, Json(ApiError { error: "tick actor unreachable".into() })).into_response(),
    }
}

async fn control_start_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.command_tx.send(SurfaceCommand::Start).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, Json(ApiError { error: "tick actor unreachable".into() })).into_response(),
    }
}

async fn control_stop_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.command_tx.send(SurfaceCommand::Stop).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, Json(ApiError { error: "tick actor unreachable".into() })).into_response(),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| push_status(socket, state))
}

/// Streams the status snapshot to one observer, once per tick, for as long
/// as the socket stays writable. A lagging receiver silently skips buffered
/// messages (the broadcast channel's own drop policy) rather than blocking
/// the tick actor; a send failure ends this task.
async fn push_status(mut socket: WebSocket, state: Arc<AppState>) {
    let mut rx = state.status_broadcast.subscribe();
    loop {
        match rx.recv().await {
            Ok(snapshot) => match serde_json::to_string(&snapshot) {
                Ok(text) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    log::warn!("failed to serialize status snapshot for websocket: {err}");
                }
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("websocket observer lagged, skipped {skipped} status updates");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
