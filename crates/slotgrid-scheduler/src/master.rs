//! Task control surface.
//!
//! `Master` is the entry point for clients and agents. It validates and
//! numbers submissions, routes every request to the owning pool loop and
//! serves finished tasks from the state store once the pool has let go
//! of them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use slotgrid_core::{
    AgentCommand, AgentDescriptor, AgentEvent, BasicValidator, MasterConfig, SlotReport,
    SpecValidator, TaskId, TaskSpec, epoch_millis,
};
use slotgrid_registry::Agent;
use slotgrid_state::{
    CheckpointRecord, StateStore, TrainingMetrics, UpsertOutcome, ValidationMetrics,
};
use tokio::sync::{RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::effect::TaskNotification;
use crate::error::{SchedulerError, SchedulerResult};
use crate::journal::Journal;
use crate::outbox::CommandOutbox;
use crate::pool::{PoolState, PoolSummary, TaskStatus};
use crate::runtime::{PoolDeps, PoolHandle, spawn_pool};

const NOTIFICATION_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct Master {
    inner: Arc<MasterInner>,
}

struct MasterInner {
    pools: BTreeMap<String, PoolHandle>,
    /// agent id -> pool name
    agents: RwLock<HashMap<String, String>>,
    /// task id -> pool name
    tasks: RwLock<HashMap<TaskId, String>>,
    store: StateStore,
    validator: Arc<dyn SpecValidator>,
    outbox: CommandOutbox,
    notifications: broadcast::Sender<TaskNotification>,
}

impl Master {
    /// Recover persisted state and start the journal writer and one loop
    /// per configured pool.
    pub fn start(
        config: &MasterConfig,
        store: StateStore,
        shutdown: watch::Receiver<bool>,
    ) -> SchedulerResult<(Self, Vec<JoinHandle<()>>)> {
        Self::start_with_validator(config, store, Arc::new(BasicValidator::new()), shutdown)
    }

    pub fn start_with_validator(
        config: &MasterConfig,
        store: StateStore,
        validator: Arc<dyn SpecValidator>,
        shutdown: watch::Receiver<bool>,
    ) -> SchedulerResult<(Self, Vec<JoinHandle<()>>)> {
        config.validate()?;
        let timings = config.timings()?;
        let open_tasks = store.list_open_tasks()?;
        let live = store.live_allocations()?;
        let now = epoch_millis();

        let (journal, journal_handle) = Journal::spawn(store.clone(), shutdown.clone());
        let outbox = CommandOutbox::new();
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let deps = PoolDeps {
            transport: Arc::new(outbox.clone()),
            journal,
            notifications: notifications.clone(),
        };

        let mut handles = vec![journal_handle];
        let mut pools = BTreeMap::new();
        for pool_config in &config.pools {
            let mut state = PoolState::new(pool_config.clone(), timings.clone(), store.clone());
            let initial = state.recover(open_tasks.clone(), live.clone(), now);
            let (handle, join) = spawn_pool(state, initial, deps.clone(), shutdown.clone());
            pools.insert(pool_config.name.clone(), handle);
            handles.push(join);
        }

        let mut tasks = HashMap::new();
        for record in &open_tasks {
            if pools.contains_key(&record.spec.pool) {
                tasks.insert(record.id.clone(), record.spec.pool.clone());
            } else {
                warn!(task_id = %record.id, pool = %record.spec.pool, "task belongs to an unconfigured pool");
            }
        }

        info!(
            pools = pools.len(),
            open_tasks = tasks.len(),
            live_allocations = live.len(),
            "master started"
        );
        let master = Self {
            inner: Arc::new(MasterInner {
                pools,
                agents: RwLock::new(HashMap::new()),
                tasks: RwLock::new(tasks),
                store,
                validator,
                outbox,
                notifications,
            }),
        };
        Ok((master, handles))
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    pub fn pool_names(&self) -> Vec<String> {
        self.inner.pools.keys().cloned().collect()
    }

    /// Receive a notification for every task that reaches a terminal state.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskNotification> {
        self.inner.notifications.subscribe()
    }

    fn pool(&self, name: &str) -> SchedulerResult<&PoolHandle> {
        self.inner
            .pools
            .get(name)
            .ok_or_else(|| SchedulerError::UnknownPool(name.to_string()))
    }

    async fn task_pool(&self, task_id: &str) -> Option<PoolHandle> {
        let tasks = self.inner.tasks.read().await;
        tasks
            .get(task_id)
            .and_then(|name| self.inner.pools.get(name))
            .cloned()
    }

    async fn agent_pool(&self, agent_id: &str) -> SchedulerResult<PoolHandle> {
        let agents = self.inner.agents.read().await;
        agents
            .get(agent_id)
            .and_then(|name| self.inner.pools.get(name))
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownAgent(agent_id.to_string()))
    }

    // ── Tasks ─────────────────────────────────────────────────────

    pub async fn submit_task(&self, spec: TaskSpec) -> SchedulerResult<TaskId> {
        self.inner
            .validator
            .validate(&spec)
            .map_err(SchedulerError::InvalidSpec)?;
        let pool = self.pool(&spec.pool)?.clone();
        let seq = self.inner.store.next_task_seq()?;
        let task_id = format!("task-{seq}");

        self.inner
            .tasks
            .write()
            .await
            .insert(task_id.clone(), pool.name().to_string());
        if let Err(err) = pool.submit(&task_id, seq, spec).await {
            self.inner.tasks.write().await.remove(&task_id);
            return Err(err);
        }
        Ok(task_id)
    }

    /// Cancel a live task. Unknown and already finished tasks are
    /// `NotFound`.
    pub async fn cancel_task(&self, task_id: &str) -> SchedulerResult<()> {
        match self.task_pool(task_id).await {
            Some(pool) => pool.cancel(task_id).await,
            None => Err(SchedulerError::NotFound(task_id.to_string())),
        }
    }

    pub async fn reprioritize(&self, task_id: &str, priority: u32) -> SchedulerResult<()> {
        if let Some(pool) = self.task_pool(task_id).await {
            match pool.reprioritize(task_id, priority).await {
                Err(SchedulerError::NotFound(_)) => {}
                other => return other,
            }
        }
        match self.inner.store.get_task(task_id)? {
            Some(record) if record.state.is_terminal() => {
                Err(SchedulerError::Finished(task_id.to_string()))
            }
            _ => Err(SchedulerError::NotFound(task_id.to_string())),
        }
    }

    pub async fn task_status(&self, task_id: &str) -> SchedulerResult<TaskStatus> {
        if let Some(pool) = self.task_pool(task_id).await {
            if let Some(status) = pool.status(task_id).await? {
                return Ok(status);
            }
        }
        self.inner
            .store
            .get_task(task_id)?
            .map(|record| TaskStatus::from_record(&record))
            .ok_or_else(|| SchedulerError::NotFound(task_id.to_string()))
    }

    /// Every known task, oldest first.
    pub async fn list_tasks(&self) -> SchedulerResult<Vec<TaskStatus>> {
        let mut records = self.inner.store.list_tasks()?;
        records.sort_by_key(|r| r.seq);
        let mut statuses = Vec::with_capacity(records.len());
        for record in records {
            let live = match self.task_pool(&record.id).await {
                Some(pool) if !record.state.is_terminal() => pool.status(&record.id).await?,
                _ => None,
            };
            statuses.push(live.unwrap_or_else(|| TaskStatus::from_record(&record)));
        }
        Ok(statuses)
    }

    // ── Pools ─────────────────────────────────────────────────────

    pub async fn pool_summary(&self, name: &str) -> SchedulerResult<PoolSummary> {
        self.pool(name)?.summary().await
    }

    pub async fn list_pools(&self) -> SchedulerResult<Vec<PoolSummary>> {
        let mut summaries = Vec::with_capacity(self.inner.pools.len());
        for pool in self.inner.pools.values() {
            summaries.push(pool.summary().await?);
        }
        Ok(summaries)
    }

    pub async fn pool_agents(&self, name: &str) -> SchedulerResult<Vec<Agent>> {
        self.pool(name)?.agents().await
    }

    // ── Agents ────────────────────────────────────────────────────

    /// Register (or re-register) an agent. Returns the commands already
    /// queued for it, such as stops for units nobody owns any more.
    pub async fn register_agent(
        &self,
        descriptor: AgentDescriptor,
    ) -> SchedulerResult<Vec<AgentCommand>> {
        let pool = self.pool(&descriptor.pool)?.clone();
        let agent_id = descriptor.id.clone();
        let previous = self
            .inner
            .agents
            .write()
            .await
            .insert(agent_id.clone(), pool.name().to_string());
        if let Some(previous) = previous.filter(|p| p != pool.name()) {
            warn!(%agent_id, from = %previous, to = %pool.name(), "agent moved pools");
            if let Some(old) = self.inner.pools.get(&previous) {
                if let Err(err) = old.disconnect(&agent_id).await {
                    warn!(%agent_id, pool = %previous, error = %err, "failed to detach agent from previous pool");
                }
            }
        }
        pool.register(descriptor).await?;
        Ok(self.inner.outbox.drain(&agent_id))
    }

    /// Record a heartbeat and hand back the agent's queued commands.
    pub async fn heartbeat(
        &self,
        agent_id: &str,
        reports: Vec<SlotReport>,
    ) -> SchedulerResult<Vec<AgentCommand>> {
        let pool = self.agent_pool(agent_id).await?;
        pool.heartbeat(agent_id, reports).await?;
        Ok(self.inner.outbox.drain(agent_id))
    }

    pub async fn agent_event(&self, agent_id: &str, event: AgentEvent) -> SchedulerResult<()> {
        self.agent_pool(agent_id).await?.event(agent_id, event).await
    }

    pub async fn drain_agent(&self, agent_id: &str) -> SchedulerResult<()> {
        self.agent_pool(agent_id).await?.drain(agent_id).await
    }

    pub async fn disconnect_agent(&self, agent_id: &str) -> SchedulerResult<()> {
        self.agent_pool(agent_id).await?.disconnect(agent_id).await
    }

    // ── Metrics ───────────────────────────────────────────────────

    pub fn record_training_metrics(
        &self,
        record: &TrainingMetrics,
    ) -> SchedulerResult<UpsertOutcome> {
        Ok(self.inner.store.upsert_training_metrics(record)?)
    }

    pub fn training_metrics(&self, trial_id: &str) -> SchedulerResult<Vec<TrainingMetrics>> {
        Ok(self.inner.store.list_training_metrics(trial_id)?)
    }

    pub fn record_validation_metrics(
        &self,
        record: &ValidationMetrics,
    ) -> SchedulerResult<UpsertOutcome> {
        Ok(self.inner.store.upsert_validation_metrics(record)?)
    }

    pub fn validation_metrics(&self, trial_id: &str) -> SchedulerResult<Vec<ValidationMetrics>> {
        Ok(self.inner.store.list_validation_metrics(trial_id)?)
    }

    // ── Checkpoints ───────────────────────────────────────────────

    /// Record a checkpoint save. Completed and Errored checkpoints are final.
    pub fn record_checkpoint(&self, record: &CheckpointRecord) -> SchedulerResult<UpsertOutcome> {
        let outcome = self.inner.store.upsert_checkpoint(record)?;
        if outcome != UpsertOutcome::Unchanged {
            info!(
                trial_id = %record.trial_id,
                batch_number = record.batch_number,
                state = ?record.state,
                "checkpoint recorded"
            );
        }
        Ok(outcome)
    }

    pub fn checkpoint(
        &self,
        trial_id: &str,
        batch_number: u64,
    ) -> SchedulerResult<Option<CheckpointRecord>> {
        Ok(self.inner.store.get_checkpoint(trial_id, batch_number)?)
    }

    pub fn checkpoints(&self, trial_id: &str) -> SchedulerResult<Vec<CheckpointRecord>> {
        Ok(self.inner.store.list_checkpoints(trial_id)?)
    }
}
