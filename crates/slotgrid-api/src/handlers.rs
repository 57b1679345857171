//! REST API handlers for tasks, pools, metrics and checkpoints.
//!
//! Each handler forwards to the `Master` and returns JSON responses.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::warn;

use slotgrid_core::TaskSpec;
use slotgrid_scheduler::SchedulerError;
use slotgrid_state::{
    CheckpointRecord, StateError, TrainingMetrics, UpsertOutcome, ValidationMetrics,
};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
pub(crate) struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// Map a scheduler error onto an HTTP status.
pub(crate) fn scheduler_error(err: SchedulerError) -> Response {
    let status = match &err {
        SchedulerError::InvalidSpec(_) => StatusCode::BAD_REQUEST,
        SchedulerError::Unsatisfiable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        SchedulerError::UnknownPool(_)
        | SchedulerError::UnknownAgent(_)
        | SchedulerError::NotFound(_) => StatusCode::NOT_FOUND,
        SchedulerError::Finished(_) | SchedulerError::State(StateError::Conflict(_)) => {
            StatusCode::CONFLICT
        }
        SchedulerError::Registry(_) => StatusCode::BAD_REQUEST,
        SchedulerError::PoolStopped(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %err, "request failed");
    }
    error_response(&err.to_string(), status).into_response()
}

// ── Tasks ──────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub task_id: String,
}

/// POST /api/v1/tasks
pub async fn submit_task(
    State(state): State<ApiState>,
    Json(spec): Json<TaskSpec>,
) -> impl IntoResponse {
    match state.master.submit_task(spec).await {
        Ok(task_id) => (StatusCode::CREATED, ApiResponse::ok(SubmitResponse { task_id })).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// GET /api/v1/tasks
pub async fn list_tasks(State(state): State<ApiState>) -> impl IntoResponse {
    match state.master.list_tasks().await {
        Ok(tasks) => ApiResponse::ok(tasks).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// GET /api/v1/tasks/{id}
pub async fn get_task(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.master.task_status(&id).await {
        Ok(status) => ApiResponse::ok(status).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// DELETE /api/v1/tasks/{id}
pub async fn cancel_task(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.master.cancel_task(&id).await {
        Ok(()) => ApiResponse::ok("canceled").into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// Reprioritize request body.
#[derive(Debug, Deserialize)]
pub struct PriorityRequest {
    pub priority: u32,
}

/// POST /api/v1/tasks/{id}/priority
pub async fn reprioritize_task(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<PriorityRequest>,
) -> impl IntoResponse {
    match state.master.reprioritize(&id, req.priority).await {
        Ok(()) => ApiResponse::ok(serde_json::json!({
            "task_id": id,
            "priority": req.priority,
        }))
        .into_response(),
        Err(e) => scheduler_error(e),
    }
}

// ── Pools ──────────────────────────────────────────────────────

/// GET /api/v1/pools
pub async fn list_pools(State(state): State<ApiState>) -> impl IntoResponse {
    match state.master.list_pools().await {
        Ok(pools) => ApiResponse::ok(pools).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// GET /api/v1/pools/{name}
pub async fn get_pool(State(state): State<ApiState>, Path(name): Path<String>) -> impl IntoResponse {
    match state.master.pool_summary(&name).await {
        Ok(summary) => ApiResponse::ok(summary).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// GET /api/v1/pools/{name}/agents
pub async fn list_pool_agents(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.master.pool_agents(&name).await {
        Ok(agents) => ApiResponse::ok(agents).into_response(),
        Err(e) => scheduler_error(e),
    }
}

// ── Metrics ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct TrainingMetricsBody {
    pub training_metrics: TrainingMetrics,
}

#[derive(Debug, Deserialize)]
pub struct ValidationMetricsBody {
    pub validation_metrics: ValidationMetrics,
}

fn upsert_status(outcome: UpsertOutcome) -> StatusCode {
    match outcome {
        UpsertOutcome::Created => StatusCode::CREATED,
        UpsertOutcome::Updated | UpsertOutcome::Unchanged => StatusCode::OK,
    }
}

/// POST /api/v1/training_metrics
///
/// Creates the record for a batch range; replays of an existing range
/// update it.
pub async fn create_training_metrics(
    State(state): State<ApiState>,
    Json(body): Json<TrainingMetricsBody>,
) -> impl IntoResponse {
    let record = body.training_metrics;
    match state.master.record_training_metrics(&record) {
        Ok(outcome) => (upsert_status(outcome), ApiResponse::ok(record)).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// PUT /api/v1/training_metrics
pub async fn update_training_metrics(
    State(state): State<ApiState>,
    Json(body): Json<TrainingMetricsBody>,
) -> impl IntoResponse {
    let record = body.training_metrics;
    let existing = state.master.store().get_training_metrics(
        &record.trial_id,
        record.start_batch,
        record.end_batch,
    );
    match existing {
        Ok(Some(_)) => {}
        Ok(None) => {
            return error_response("training metrics not found", StatusCode::NOT_FOUND)
                .into_response();
        }
        Err(e) => return scheduler_error(e.into()),
    }
    match state.master.record_training_metrics(&record) {
        Ok(_) => ApiResponse::ok(record).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// POST /api/v1/validation_metrics
pub async fn create_validation_metrics(
    State(state): State<ApiState>,
    Json(body): Json<ValidationMetricsBody>,
) -> impl IntoResponse {
    let record = body.validation_metrics;
    match state.master.record_validation_metrics(&record) {
        Ok(outcome) => (upsert_status(outcome), ApiResponse::ok(record)).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// PUT /api/v1/validation_metrics
pub async fn update_validation_metrics(
    State(state): State<ApiState>,
    Json(body): Json<ValidationMetricsBody>,
) -> impl IntoResponse {
    let record = body.validation_metrics;
    let existing = state
        .master
        .store()
        .get_validation_metrics(&record.trial_id, record.total_batches);
    match existing {
        Ok(Some(_)) => {}
        Ok(None) => {
            return error_response("validation metrics not found", StatusCode::NOT_FOUND)
                .into_response();
        }
        Err(e) => return scheduler_error(e.into()),
    }
    match state.master.record_validation_metrics(&record) {
        Ok(_) => ApiResponse::ok(record).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// GET /api/v1/trials/{id}/training_metrics
pub async fn list_training_metrics(
    State(state): State<ApiState>,
    Path(trial_id): Path<String>,
) -> impl IntoResponse {
    match state.master.training_metrics(&trial_id) {
        Ok(records) => ApiResponse::ok(records).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// GET /api/v1/trials/{id}/validation_metrics
pub async fn list_validation_metrics(
    State(state): State<ApiState>,
    Path(trial_id): Path<String>,
) -> impl IntoResponse {
    match state.master.validation_metrics(&trial_id) {
        Ok(records) => ApiResponse::ok(records).into_response(),
        Err(e) => scheduler_error(e),
    }
}

// ── Checkpoints ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CheckpointBody {
    pub checkpoint: CheckpointRecord,
}

/// POST /api/v1/checkpoints
///
/// Called when a trial starts saving; the record is usually Active.
pub async fn create_checkpoint(
    State(state): State<ApiState>,
    Json(body): Json<CheckpointBody>,
) -> impl IntoResponse {
    let record = body.checkpoint;
    match state.master.record_checkpoint(&record) {
        Ok(outcome) => (upsert_status(outcome), ApiResponse::ok(record)).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// PUT /api/v1/checkpoints
///
/// Marks a saving checkpoint Completed or Errored.
pub async fn update_checkpoint(
    State(state): State<ApiState>,
    Json(body): Json<CheckpointBody>,
) -> impl IntoResponse {
    let record = body.checkpoint;
    match state.master.checkpoint(&record.trial_id, record.batch_number) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return error_response("checkpoint not found", StatusCode::NOT_FOUND).into_response();
        }
        Err(e) => return scheduler_error(e),
    }
    match state.master.record_checkpoint(&record) {
        Ok(_) => ApiResponse::ok(record).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// GET /api/v1/trials/{id}/checkpoints
pub async fn list_checkpoints(
    State(state): State<ApiState>,
    Path(trial_id): Path<String>,
) -> impl IntoResponse {
    match state.master.checkpoints(&trial_id) {
        Ok(records) => ApiResponse::ok(records).into_response(),
        Err(e) => scheduler_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotgrid_core::{ConfigError, ValidationError};

    fn status_of(err: SchedulerError) -> StatusCode {
        scheduler_error(err).status()
    }

    #[test]
    fn error_status_mapping() {
        assert_eq!(
            status_of(SchedulerError::InvalidSpec(vec![ValidationError::new(
                "units",
                "must be >= 1"
            )])),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(SchedulerError::Unsatisfiable {
                pool: "default".to_string(),
                requested: 20,
                capacity: 16,
            }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(SchedulerError::UnknownPool("x".to_string())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(SchedulerError::Finished("task-1".to_string())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(SchedulerError::State(StateError::Conflict(
                "immutable".to_string()
            ))),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(SchedulerError::PoolStopped("default".to_string())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(SchedulerError::Config(ConfigError::Invalid(
                "no pools".to_string()
            ))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn upsert_outcomes() {
        assert_eq!(upsert_status(UpsertOutcome::Created), StatusCode::CREATED);
        assert_eq!(upsert_status(UpsertOutcome::Unchanged), StatusCode::OK);
    }
}
