//! Standalone regression tests.
//!
//! Assembles the control plane the way the daemon does (file-backed
//! store, master, router) and checks that work survives a restart.

use std::path::Path;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use slotgrid_api::build_router;
use slotgrid_core::MasterConfig;
use slotgrid_scheduler::Master;
use slotgrid_state::StateStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower::ServiceExt;

struct Daemon {
    router: Router,
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl Daemon {
    fn start(db_path: &Path) -> Self {
        let config = MasterConfig::default();
        let store = StateStore::open(db_path).unwrap();
        let (shutdown, rx) = watch::channel(false);
        let (master, handles) = Master::start(&config, store, rx).unwrap();
        Self {
            router: build_router(master),
            handles,
            shutdown,
        }
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        drop(self.router);
        for handle in self.handles {
            handle.await.unwrap();
        }
    }

    async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(req).await
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        self.send(req).await
    }

    async fn send(&self, req: Request<Body>) -> (StatusCode, Value) {
        let resp = self.router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }
}

fn agent(id: &str, occupied: Value) -> Value {
    json!({
        "id": id,
        "pool": "default",
        "address": "10.0.0.1:7000",
        "slots": [{"kind": "gpu"}, {"kind": "gpu"}],
        "occupied": occupied,
    })
}

#[tokio::test]
async fn standalone_running_task_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("slotgrid.redb");

    let daemon = Daemon::start(&db);
    daemon.post("/api/v1/agents", agent("a", json!([]))).await;
    let (status, _) = daemon
        .post(
            "/api/v1/tasks",
            json!({"name": "resnet", "pool": "default", "units": 2}),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    daemon
        .post(
            "/api/v1/agents/a/events",
            json!({"type": "start_ack", "allocation_id": "task-1.1"}),
        )
        .await;
    let (_, body) = daemon.get("/api/v1/tasks/task-1").await;
    assert_eq!(body["data"]["state"], json!("running"));
    daemon.stop().await;

    let daemon = Daemon::start(&db);
    let (status, body) = daemon.get("/api/v1/tasks/task-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], json!("running"));

    let occupied = json!([
        {"index": 0, "unit": {"allocation_id": "task-1.1", "unit": 0}},
        {"index": 1, "unit": {"allocation_id": "task-1.1", "unit": 1}},
    ]);
    let (status, body) = daemon.post("/api/v1/agents", agent("a", occupied)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["commands"], json!([]));

    let (_, body) = daemon.get("/api/v1/pools/default").await;
    assert_eq!(body["data"]["allocations"], json!(1));
    assert_eq!(body["data"]["free_slots"], json!(0));
    daemon.stop().await;
}

#[tokio::test]
async fn standalone_unknown_units_are_stopped_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("slotgrid.redb");

    let daemon = Daemon::start(&db);
    let occupied = json!([{"index": 1, "unit": {"allocation_id": "task-9.1", "unit": 0}}]);
    let (_, body) = daemon.post("/api/v1/agents", agent("a", occupied)).await;
    assert_eq!(
        body["data"]["commands"],
        json!([{"type": "stop", "allocation_id": "task-9.1"}])
    );
    daemon.stop().await;
}
