use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::WsConfig;
use crate::errors::SchedulerError;
use crate::hub::ProgressHub;
use crate::scheduler::{JsonObject, Task, TaskKind, TaskScheduler, TaskStatus};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub scheduler: Arc<TaskScheduler>,
    pub hub: Arc<ProgressHub>,
    pub ws_config: WsConfig,
}

pub type SharedState = Arc<AppState>;

// ── Request/response payload types ────────────────────────────────────

#[derive(Deserialize)]
pub struct TaskCreateRequest {
    pub kind: TaskKind,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: JsonObject,
}

#[derive(Serialize)]
pub struct TaskCreateResponse {
    pub task_id: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct TaskResponse {
    pub task: Task,
}

#[derive(Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<Task>,
    pub total: usize,
}

#[derive(Serialize)]
pub struct TaskResultResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub result: JsonObject,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    Conflict(String),
    Unavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        let message = err.to_string();
        match err {
            SchedulerError::TaskNotFound { .. } => ApiError::NotFound(message),
            SchedulerError::InvalidTransition { .. } | SchedulerError::NotCompleted { .. } => {
                ApiError::Conflict(message)
            }
            SchedulerError::QueueSaturated | SchedulerError::ShuttingDown => {
                ApiError::Unavailable(message)
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/v1/tasks", get(list_tasks).post(create_task))
        .route("/api/v1/tasks/{id}", get(get_task))
        .route("/api/v1/tasks/{id}/cancel", post(cancel_task))
        .route("/api/v1/tasks/{id}/result", get(get_task_result))
        .route("/api/v1/health", get(health_check))
        .route("/api/v1/health/detailed", get(detailed_health))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Liveness plus scheduler introspection: worker cap, live running count,
/// queue depth, subscriber count.
async fn detailed_health(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "scheduler": {
            "workers": state.scheduler.worker_count(),
            "running_tasks": state.scheduler.running_count(),
            "queue_depth": state.scheduler.queue_depth(),
        },
        "websocket": {
            "subscribers": state.hub.subscriber_count(),
        },
    }))
}

/// Create a task. Returns the id immediately; execution is asynchronous
/// and observed by polling or subscribing.
async fn create_task(
    State(state): State<SharedState>,
    Json(req): Json<TaskCreateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state
        .scheduler
        .submit(req.kind, &req.name, &req.description, req.params)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(TaskCreateResponse {
            task_id: task.id,
            message: "Task created successfully".to_string(),
        }),
    ))
}

async fn list_tasks(State(state): State<SharedState>) -> impl IntoResponse {
    let mut tasks = state.scheduler.list();
    // Store order is unspecified; present newest first.
    tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let total = tasks.len();
    Json(TaskListResponse { tasks, total })
}

async fn get_task(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.scheduler.get(&id)?;
    Ok(Json(TaskResponse { task }))
}

async fn cancel_task(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.scheduler.cancel(&id)?;
    Ok(Json(json!({"message": "Task cancelled successfully"})))
}

async fn get_task_result(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state.scheduler.get_result(&id)?;
    Ok(Json(TaskResultResponse {
        task_id: id,
        status: TaskStatus::Completed,
        result,
    }))
}
