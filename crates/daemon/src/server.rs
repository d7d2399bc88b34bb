//! HTTP and WebSocket surface of the daemon
//!
//! REST routes for submission, status, cancellation and the queue, two
//! WebSocket progress feeds, and the metrics snapshot.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcaster::{has_changed, SentState, TASK_POLL_INTERVAL};
use crate::engine::{SubmitError, TaskEngine};
use crate::metrics::{MetricsSnapshot, SharedMetrics};
use crate::registry::{CancelOutcome, PurgeOutcome, QueueSummary};
use crate::task::{EncodeRequest, EncodingTask};

/// Close code for a per-task feed on an unknown task
const CLOSE_POLICY_VIOLATION: u16 = 1008;
const CLOSE_NORMAL: u16 = 1000;

/// Errors that can occur when running the server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<TaskEngine>,
    pub metrics: SharedMetrics,
}

/// JSON error body
struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn task_not_found(task_id: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("Task {} not found", task_id))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        let status = match &e {
            SubmitError::InvalidSettings(_) => StatusCode::BAD_REQUEST,
            SubmitError::InputMissing(_) => StatusCode::NOT_FOUND,
            SubmitError::AlreadyEncoded(_) | SubmitError::DuplicateTask(_) => StatusCode::CONFLICT,
            SubmitError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

/// Feed message: a `type` tag plus the flattened task.
#[derive(Serialize)]
struct TaskMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    task: &'a EncodingTask,
}

fn task_message(kind: &'static str, task: &EncodingTask) -> String {
    serde_json::to_string(&TaskMessage { kind, task }).unwrap_or_default()
}

#[derive(Serialize)]
struct BatchMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    tasks: &'a [EncodingTask],
}

fn batch_message(tasks: &[EncodingTask]) -> String {
    serde_json::to_string(&BatchMessage {
        kind: "progress_update",
        tasks,
    })
    .unwrap_or_default()
}

fn close_frame(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

async fn submit_encode(
    State(state): State<AppState>,
    Json(request): Json<EncodeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let task_id = state.engine.submit(request).await?;
    Ok(Json(json!({ "task_id": task_id })))
}

async fn get_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<EncodingTask>, ApiError> {
    state
        .engine
        .registry()
        .snapshot(&task_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::task_not_found(&task_id))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    match state.engine.registry().cancel(&task_id).await {
        CancelOutcome::NotFound => Err(ApiError::task_not_found(&task_id)),
        CancelOutcome::Requested | CancelOutcome::AlreadyTerminal => Ok(StatusCode::NO_CONTENT),
    }
}

async fn purge_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    match state.engine.registry().purge(&task_id).await {
        PurgeOutcome::Removed => Ok(StatusCode::NO_CONTENT),
        PurgeOutcome::NotFound => Err(ApiError::task_not_found(&task_id)),
        PurgeOutcome::StillLive => Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("Task {} is still running", task_id),
        )),
    }
}

async fn get_queue(State(state): State<AppState>) -> Json<QueueSummary> {
    Json(state.engine.registry().queue().await)
}

/// Handler for GET /metrics endpoint
async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    let snapshot = state.metrics.read().await.clone();
    Json(snapshot)
}

async fn task_progress_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| task_feed(socket, state, task_id))
}

async fn all_progress_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| multiplexed_feed(socket, state))
}

/// Answers `ping` with `pong`. Returns false once the client is gone.
async fn handle_client_message<S>(msg: Option<Result<Message, axum::Error>>, sender: &mut S) -> bool
where
    S: SinkExt<Message> + Unpin,
{
    match msg {
        Some(Ok(Message::Text(text))) if text.trim() == "ping" => {
            sender.send(Message::Text("pong".to_string())).await.is_ok()
        }
        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => false,
        Some(Ok(_)) => true,
    }
}

/// Per-task feed: initial snapshot, then changes at 0.5 s polling until the
/// task is terminal.
async fn task_feed(socket: WebSocket, state: AppState, task_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let registry = Arc::clone(state.engine.registry());

    let Some(initial) = registry.snapshot(&task_id).await else {
        debug!(task_id = %task_id, "progress feed for unknown task");
        let _ = sender
            .send(close_frame(CLOSE_POLICY_VIOLATION, "Task not found"))
            .await;
        return;
    };

    if sender
        .send(Message::Text(task_message("status", &initial)))
        .await
        .is_err()
    {
        return;
    }

    let mut last = SentState::of(&initial);
    let mut done = initial.is_terminal();
    let mut poll = tokio::time::interval(TASK_POLL_INTERVAL);

    while !done {
        tokio::select! {
            _ = poll.tick() => {
                let Some(task) = registry.snapshot(&task_id).await else {
                    break;
                };
                if has_changed(Some(&last), &task) {
                    last = SentState::of(&task);
                    if sender.send(Message::Text(task_message("progress", &task))).await.is_err() {
                        return;
                    }
                }
                done = task.is_terminal();
            }
            msg = receiver.next() => {
                if !handle_client_message(msg, &mut sender).await {
                    return;
                }
            }
        }
    }

    let _ = sender.send(close_frame(CLOSE_NORMAL, "Task finished")).await;
}

/// Multiplexed feed: every changed task, batched by the broadcaster.
async fn multiplexed_feed(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let broadcaster = Arc::clone(state.engine.broadcaster());
    let mut updates = broadcaster.subscribe();

    let current = broadcaster.registry().snapshots().await;
    if !current.is_empty()
        && sender
            .send(Message::Text(batch_message(&current)))
            .await
            .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            batch = updates.recv() => match batch {
                Ok(batch) => {
                    if sender.send(Message::Text(batch_message(&batch))).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "progress subscriber lagging");
                }
                Err(RecvError::Closed) => break,
            },
            msg = receiver.next() => {
                if !handle_client_message(msg, &mut sender).await {
                    break;
                }
            }
        }
    }
}

/// Creates the axum Router with every endpoint
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/encode", post(submit_encode))
        .route("/api/status/:task_id", get(get_status))
        .route("/api/cancel/:task_id", delete(cancel_task))
        .route("/api/tasks/:task_id", delete(purge_task))
        .route("/api/queue", get(get_queue))
        .route("/ws/progress", get(all_progress_ws))
        .route("/ws/progress/:task_id", get(task_progress_ws))
        .route("/metrics", get(get_metrics))
        .with_state(state)
}

/// Serves until `shutdown` fires
pub async fn run_server(
    bind_address: &str,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!(address = %bind_address, "http server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
