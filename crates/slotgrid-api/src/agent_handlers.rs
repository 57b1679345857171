//! REST API handlers for the agent protocol.
//!
//! Agents poll: every register and heartbeat response carries the
//! commands queued for that agent since its last call.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};

use slotgrid_core::{AgentCommand, AgentDescriptor, AgentEvent, SlotReport};

use crate::ApiState;
use crate::handlers::{ApiResponse, error_response, scheduler_error};

/// Commands handed to an agent.
#[derive(Debug, Serialize, Deserialize)]
pub struct CommandBatch {
    pub commands: Vec<AgentCommand>,
}

/// Heartbeat request body.
#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub slots: Vec<SlotReport>,
}

/// POST /api/v1/agents
pub async fn register_agent(
    State(state): State<ApiState>,
    Json(descriptor): Json<AgentDescriptor>,
) -> impl IntoResponse {
    if descriptor.id.trim().is_empty() {
        return error_response("agent id must not be empty", StatusCode::BAD_REQUEST).into_response();
    }
    match state.master.register_agent(descriptor).await {
        Ok(commands) => (StatusCode::CREATED, ApiResponse::ok(CommandBatch { commands })).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// POST /api/v1/agents/{id}/heartbeat
pub async fn heartbeat(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> impl IntoResponse {
    match state.master.heartbeat(&id, req.slots).await {
        Ok(commands) => ApiResponse::ok(CommandBatch { commands }).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// POST /api/v1/agents/{id}/events
pub async fn report_event(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(event): Json<AgentEvent>,
) -> impl IntoResponse {
    match state.master.agent_event(&id, event).await {
        Ok(()) => ApiResponse::ok("accepted").into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// POST /api/v1/agents/{id}/drain
pub async fn drain_agent(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.master.drain_agent(&id).await {
        Ok(()) => ApiResponse::ok("draining").into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// DELETE /api/v1/agents/{id}
pub async fn disconnect_agent(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.master.disconnect_agent(&id).await {
        Ok(()) => ApiResponse::ok("disconnected").into_response(),
        Err(e) => scheduler_error(e),
    }
}
