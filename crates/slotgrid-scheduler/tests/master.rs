//! Control-surface tests against running pool loops.

use std::time::Duration;

use slotgrid_core::{
    AgentCommand, AgentDescriptor, AgentEvent, DeviceDescriptor, MasterConfig, SlotReport,
    TaskSpec, TaskState, UnitRef,
};
use slotgrid_registry::AgentStatus;
use slotgrid_scheduler::{Master, SchedulerError};
use slotgrid_state::StateStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;

fn agent(id: &str, slots: usize) -> AgentDescriptor {
    AgentDescriptor {
        id: id.to_string(),
        pool: "default".to_string(),
        address: format!("{id}:7000"),
        slots: vec![DeviceDescriptor::gpu("A100"); slots],
        occupied: Vec::new(),
    }
}

fn start(store: StateStore) -> (Master, Vec<JoinHandle<()>>, watch::Sender<bool>) {
    let config = MasterConfig::parse("").unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (master, handles) = Master::start(&config, store, shutdown_rx).unwrap();
    (master, handles, shutdown_tx)
}

async fn stop(handles: Vec<JoinHandle<()>>, shutdown: watch::Sender<bool>) {
    shutdown.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }
}

fn start_ids(commands: &[AgentCommand]) -> Vec<String> {
    commands
        .iter()
        .filter_map(|c| match c {
            AgentCommand::Start { allocation_id, .. } => Some(allocation_id.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn task_runs_to_completion_through_heartbeats() {
    let (master, handles, shutdown) = start(StateStore::open_in_memory().unwrap());
    let mut notifications = master.subscribe();

    assert!(master.register_agent(agent("a", 4)).await.unwrap().is_empty());
    let task_id = master
        .submit_task(TaskSpec::new("mnist", "default", 2))
        .await
        .unwrap();
    assert_eq!(task_id, "task-1");

    // Commands ride on the next heartbeat response.
    let commands = master.heartbeat("a", Vec::new()).await.unwrap();
    assert_eq!(start_ids(&commands), vec!["task-1.1".to_string()]);
    match &commands[0] {
        AgentCommand::Start { units, task_id, .. } => {
            assert_eq!(task_id, "task-1");
            assert_eq!(units.len(), 2);
        }
        other => panic!("unexpected command {other:?}"),
    }
    assert!(master.heartbeat("a", Vec::new()).await.unwrap().is_empty());
    assert_eq!(
        master.task_status("task-1").await.unwrap().state,
        TaskState::Scheduled
    );

    master
        .agent_event(
            "a",
            AgentEvent::StartAck {
                allocation_id: "task-1.1".to_string(),
            },
        )
        .await
        .unwrap();
    let status = master.task_status("task-1").await.unwrap();
    assert_eq!(status.state, TaskState::Running);
    assert_eq!(status.allocation.unwrap().units.len(), 2);

    master
        .agent_event(
            "a",
            AgentEvent::UnitExited {
                allocation_id: "task-1.1".to_string(),
                unit: 0,
                success: true,
                message: String::new(),
            },
        )
        .await
        .unwrap();
    let commands = master.heartbeat("a", Vec::new()).await.unwrap();
    assert!(matches!(
        commands.as_slice(),
        [AgentCommand::Stop { allocation_id }] if allocation_id == "task-1.1"
    ));
    master
        .agent_event(
            "a",
            AgentEvent::StopAck {
                allocation_id: "task-1.1".to_string(),
            },
        )
        .await
        .unwrap();

    let done = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.task_id, "task-1");
    assert_eq!(done.state, TaskState::Completed);

    // Finished tasks are served from the store.
    assert_eq!(
        master.task_status("task-1").await.unwrap().state,
        TaskState::Completed
    );
    assert!(matches!(
        master.cancel_task("task-1").await,
        Err(SchedulerError::NotFound(_))
    ));
    assert!(matches!(
        master.reprioritize("task-1", 1).await,
        Err(SchedulerError::Finished(_))
    ));

    let summary = master.pool_summary("default").await.unwrap();
    assert_eq!(summary.free_slots, 4);
    assert_eq!(summary.allocations, 0);

    stop(handles, shutdown).await;
}

#[tokio::test]
async fn submission_errors() {
    let (master, handles, shutdown) = start(StateStore::open_in_memory().unwrap());
    master.register_agent(agent("a", 4)).await.unwrap();

    let err = master
        .submit_task(TaskSpec::new("bad", "default", 0))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidSpec(ref errors) if errors.len() == 1));

    let err = master
        .submit_task(TaskSpec::new("lost", "nowhere", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::UnknownPool(_)));

    let err = master
        .submit_task(TaskSpec::new("huge", "default", 10))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::Unsatisfiable {
            requested: 10,
            capacity: 4,
            ..
        }
    ));
    // Rejected submissions leave nothing behind.
    assert!(master.list_tasks().await.unwrap().is_empty());

    assert!(matches!(
        master.cancel_task("task-99").await,
        Err(SchedulerError::NotFound(_))
    ));
    assert!(matches!(
        master.task_status("task-99").await,
        Err(SchedulerError::NotFound(_))
    ));
    assert!(matches!(
        master.heartbeat("ghost", Vec::new()).await,
        Err(SchedulerError::UnknownAgent(_))
    ));

    stop(handles, shutdown).await;
}

#[tokio::test]
async fn cancel_and_reprioritize_queued_task() {
    let (master, handles, shutdown) = start(StateStore::open_in_memory().unwrap());
    let mut notifications = master.subscribe();

    // No agents yet: accepted and queued.
    let task_id = master
        .submit_task(TaskSpec::new("waiting", "default", 2))
        .await
        .unwrap();
    master.reprioritize(&task_id, 7).await.unwrap();
    let status = master.task_status(&task_id).await.unwrap();
    assert_eq!(status.state, TaskState::Queued);
    assert_eq!(status.priority, 7);

    master.cancel_task(&task_id).await.unwrap();
    assert!(matches!(
        master.cancel_task(&task_id).await,
        Err(SchedulerError::NotFound(_))
    ));
    let note = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(note.state, TaskState::Canceled);
    assert_eq!(
        master.task_status(&task_id).await.unwrap().state,
        TaskState::Canceled
    );

    let listed = master.list_tasks().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].state, TaskState::Canceled);

    stop(handles, shutdown).await;
}

#[tokio::test]
async fn restart_keeps_running_gang() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("slotgrid.redb");

    {
        let (master, handles, shutdown) = start(StateStore::open(&path).unwrap());
        master.register_agent(agent("a", 2)).await.unwrap();
        master
            .submit_task(TaskSpec::new("long", "default", 2))
            .await
            .unwrap();
        master
            .agent_event(
                "a",
                AgentEvent::StartAck {
                    allocation_id: "task-1.1".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            master.task_status("task-1").await.unwrap().state,
            TaskState::Running
        );
        stop(handles, shutdown).await;
    }

    let (master, handles, shutdown) = start(StateStore::open(&path).unwrap());
    assert_eq!(
        master.task_status("task-1").await.unwrap().state,
        TaskState::Running
    );

    let mut descriptor = agent("a", 2);
    descriptor.occupied = (0..2)
        .map(|i| SlotReport::occupied(i, UnitRef::new("task-1.1", i)))
        .collect();
    let commands = master.register_agent(descriptor).await.unwrap();
    assert!(commands.is_empty(), "running gang is adopted, not restarted");
    assert!(master.heartbeat("a", Vec::new()).await.unwrap().is_empty());

    let summary = master.pool_summary("default").await.unwrap();
    assert_eq!(summary.allocations, 1);
    assert_eq!(summary.free_slots, 0);

    // Sequence numbers continue after a restart.
    let next = master
        .submit_task(TaskSpec::new("next", "default", 1))
        .await
        .unwrap();
    assert_eq!(next, "task-2");

    stop(handles, shutdown).await;
}

#[tokio::test]
async fn agent_ownership_is_tracked_per_pool() {
    let (master, handles, shutdown) = start(StateStore::open_in_memory().unwrap());
    master.register_agent(agent("a", 2)).await.unwrap();

    let agents = master.pool_agents("default").await.unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].id, "a");

    let mut foreign = agent("b", 2);
    foreign.pool = "missing".to_string();
    assert!(matches!(
        master.register_agent(foreign).await,
        Err(SchedulerError::UnknownPool(_))
    ));

    master.drain_agent("a").await.unwrap();
    master.disconnect_agent("a").await.unwrap();
    assert!(matches!(
        master.heartbeat("a", Vec::new()).await,
        Err(SchedulerError::UnknownAgent(_))
    ));

    stop(handles, shutdown).await;
}

#[tokio::test]
async fn agent_moving_pools_is_detached_from_the_old_one() {
    let config = MasterConfig::parse(
        r#"
[[pools]]
name = "default"

[[pools]]
name = "research"
"#,
    )
    .unwrap();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let (master, handles) =
        Master::start(&config, StateStore::open_in_memory().unwrap(), shutdown_rx).unwrap();

    master.register_agent(agent("a", 2)).await.unwrap();
    let mut moved = agent("a", 2);
    moved.pool = "research".to_string();
    master.register_agent(moved).await.unwrap();

    let old = master.pool_agents("default").await.unwrap();
    assert_eq!(old.len(), 1);
    assert_eq!(old[0].status, AgentStatus::Disconnected);
    let new = master.pool_agents("research").await.unwrap();
    assert_eq!(new[0].status, AgentStatus::Connected);

    stop(handles, shutdown).await;
}
