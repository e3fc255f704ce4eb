//! HTTP trigger endpoint
//!
//! A deliberately thin translation layer: every route maps onto one
//! [`TaskScheduler`] call. Protecting these routes (localhost only, shared
//! secret) is left to the deployment.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::error::SchedulerError;
use crate::scheduler::{DispatchedRun, PollReport, TaskScheduler};
use crate::storage::TaskStore;

/// Route prefix of the trigger endpoint
pub const BASE_PATH: &str = "/taskscheduler";

/// Application state shared across handlers
pub struct AppState<S: TaskStore> {
    pub scheduler: TaskScheduler<S>,
}

/// Create the trigger router
pub fn router<S: TaskStore + Clone>(state: Arc<AppState<S>>) -> Router {
    Router::new()
        .route("/taskscheduler/poll", get(poll::<S>).post(poll::<S>))
        .route("/taskscheduler/run/:id", get(run::<S>).post(run::<S>))
        .route("/taskscheduler/noop", get(noop).post(noop))
        .route("/taskscheduler/cancel/:id", post(cancel::<S>))
        .with_state(state)
}

// === Response types ===

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub task_id: i64,
    pub cancelled: bool,
}

// === Handlers ===

async fn poll<S: TaskStore + Clone>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<PollReport>, AppError> {
    let report = state.scheduler.poll().await?;
    Ok(Json(report))
}

/// Query-string pairs become task parameters
async fn run<S: TaskStore + Clone>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<i64>,
    Query(parameters): Query<HashMap<String, String>>,
) -> Result<Json<DispatchedRun>, AppError> {
    let dispatched = state.scheduler.run_single(id, parameters).await?;
    Ok(Json(dispatched))
}

async fn noop() -> StatusCode {
    StatusCode::OK
}

async fn cancel<S: TaskStore + Clone>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<i64>,
) -> Response {
    let cancelled = state.scheduler.request_cancel(id);
    let status = if cancelled {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };

    (
        status,
        Json(CancelResponse {
            task_id: id,
            cancelled,
        }),
    )
        .into_response()
}

// === Error handling ===

pub struct AppError(SchedulerError);

impl From<SchedulerError> for AppError {
    fn from(e: SchedulerError) -> Self {
        Self(e)
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            SchedulerError::TaskNotFound { .. } | SchedulerError::ExecutionNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            SchedulerError::AlreadyRunning { .. } => StatusCode::CONFLICT,
            SchedulerError::NotActive => StatusCode::SERVICE_UNAVAILABLE,
            SchedulerError::TaskTypeNotRegistered { .. }
            | SchedulerError::InvalidCronExpression { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            SchedulerError::InvalidStateTransition { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "Trigger endpoint failed");
            "Internal server error".to_string()
        } else {
            self.0.to_string()
        };

        let body = serde_json::json!({ "error": message });
        (status, Json(body)).into_response()
    }
}
