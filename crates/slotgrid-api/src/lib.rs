//! slotgrid-api — REST API for SlotGrid.
//!
//! Thin axum adapter over [`Master`]: clients submit and control tasks,
//! agents register, heartbeat (receiving their queued commands in the
//! response) and report command outcomes, trials report metrics and
//! checkpoints.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/tasks` | List tasks |
//! | POST | `/api/v1/tasks` | Submit a task |
//! | GET | `/api/v1/tasks/{id}` | Task status |
//! | DELETE | `/api/v1/tasks/{id}` | Cancel a task |
//! | POST | `/api/v1/tasks/{id}/priority` | Reprioritize a task |
//! | GET | `/api/v1/pools` | List pool summaries |
//! | GET | `/api/v1/pools/{name}` | Pool summary |
//! | GET | `/api/v1/pools/{name}/agents` | Agents of a pool |
//! | POST | `/api/v1/agents` | Register an agent |
//! | DELETE | `/api/v1/agents/{id}` | Disconnect an agent |
//! | POST | `/api/v1/agents/{id}/heartbeat` | Heartbeat, returns queued commands |
//! | POST | `/api/v1/agents/{id}/events` | Report a command outcome |
//! | POST | `/api/v1/agents/{id}/drain` | Stop placing work on an agent |
//! | POST/PUT | `/api/v1/training_metrics` | Create / update training metrics |
//! | POST/PUT | `/api/v1/validation_metrics` | Create / update validation metrics |
//! | GET | `/api/v1/trials/{id}/training_metrics` | Training metrics of a trial |
//! | GET | `/api/v1/trials/{id}/validation_metrics` | Validation metrics of a trial |
//! | POST/PUT | `/api/v1/checkpoints` | Start / finish a checkpoint save |
//! | GET | `/api/v1/trials/{id}/checkpoints` | Checkpoints of a trial |

pub mod agent_handlers;
pub mod handlers;

use axum::Router;
use axum::routing::{delete, get, post};
use slotgrid_scheduler::Master;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub master: Master,
}

/// Build the complete API router.
pub fn build_router(master: Master) -> Router {
    let state = ApiState { master };

    let api_routes = Router::new()
        .route("/tasks", get(handlers::list_tasks).post(handlers::submit_task))
        .route("/tasks/{id}", get(handlers::get_task).delete(handlers::cancel_task))
        .route("/tasks/{id}/priority", post(handlers::reprioritize_task))
        .route("/pools", get(handlers::list_pools))
        .route("/pools/{name}", get(handlers::get_pool))
        .route("/pools/{name}/agents", get(handlers::list_pool_agents))
        .route("/agents", post(agent_handlers::register_agent))
        .route("/agents/{id}", delete(agent_handlers::disconnect_agent))
        .route("/agents/{id}/heartbeat", post(agent_handlers::heartbeat))
        .route("/agents/{id}/events", post(agent_handlers::report_event))
        .route("/agents/{id}/drain", post(agent_handlers::drain_agent))
        .route(
            "/training_metrics",
            post(handlers::create_training_metrics).put(handlers::update_training_metrics),
        )
        .route(
            "/validation_metrics",
            post(handlers::create_validation_metrics).put(handlers::update_validation_metrics),
        )
        .route("/trials/{id}/training_metrics", get(handlers::list_training_metrics))
        .route("/trials/{id}/validation_metrics", get(handlers::list_validation_metrics))
        .route(
            "/checkpoints",
            post(handlers::create_checkpoint).put(handlers::update_checkpoint),
        )
        .route("/trials/{id}/checkpoints", get(handlers::list_checkpoints))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
