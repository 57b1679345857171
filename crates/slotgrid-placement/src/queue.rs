//! Per-pool queue of pending tasks.
//!
//! Priority pools order by `(priority, submitted_at, seq)`. Fair-share
//! pools insert the submitter's decayed usage after priority, so heavy
//! consumers sink within their priority band.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use slotgrid_core::{DeviceKind, PoolPolicy, TaskId, TaskSpec};
use tracing::debug;

use crate::error::{QueueError, QueueResult};

/// Resource shape of a gang.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GangDemand {
    pub units: u32,
    pub slots_per_unit: u32,
    pub device: DeviceKind,
    /// All units on one agent.
    pub co_locate: bool,
}

impl GangDemand {
    /// Resolve a spec's demand, falling back to the pool's co-location default.
    pub fn from_spec(spec: &TaskSpec, pool_co_locate: bool) -> Self {
        Self {
            units: spec.units,
            slots_per_unit: spec.slots_per_unit,
            device: spec.device,
            co_locate: spec.co_locate.unwrap_or(pool_co_locate),
        }
    }

    pub fn slots(&self) -> u64 {
        u64::from(self.units) * u64::from(self.slots_per_unit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedTask {
    pub id: TaskId,
    pub submitter: String,
    pub priority: u32,
    pub submitted_at: u64,
    pub seq: u64,
    pub demand: GangDemand,
    pub preemptible: bool,
    /// Retry backoff: passes skip the task until this time (epoch ms).
    pub not_before: Option<u64>,
}

impl QueuedTask {
    pub fn is_ready(&self, now: u64) -> bool {
        self.not_before.is_none_or(|t| t <= now)
    }
}

pub struct TaskQueue {
    policy: PoolPolicy,
    tasks: BTreeMap<TaskId, QueuedTask>,
}

impl TaskQueue {
    pub fn new(policy: PoolPolicy) -> Self {
        Self {
            policy,
            tasks: BTreeMap::new(),
        }
    }

    pub fn policy(&self) -> PoolPolicy {
        self.policy
    }

    /// Add a task. Re-enqueueing a known id replaces its entry.
    pub fn enqueue(&mut self, task: QueuedTask) {
        debug!(task_id = %task.id, priority = task.priority, "task enqueued");
        self.tasks.insert(task.id.clone(), task);
    }

    pub fn cancel(&mut self, task_id: &str) -> QueueResult<QueuedTask> {
        self.tasks
            .remove(task_id)
            .ok_or_else(|| QueueError::NotFound(task_id.to_string()))
    }

    /// Remove without treating absence as an error (allocation commit).
    pub fn remove(&mut self, task_id: &str) -> Option<QueuedTask> {
        self.tasks.remove(task_id)
    }

    pub fn reprioritize(&mut self, task_id: &str, priority: u32) -> QueueResult<()> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| QueueError::NotFound(task_id.to_string()))?;
        task.priority = priority;
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Option<&QueuedTask> {
        self.tasks.get(task_id)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Pending tasks in scheduling order. `usage` holds decayed
    /// per-submitter usage and is only consulted by fair-share pools.
    pub fn peek_ordered(&self, usage: &HashMap<String, f64>) -> Vec<&QueuedTask> {
        let mut ordered: Vec<&QueuedTask> = self.tasks.values().collect();
        match self.policy {
            PoolPolicy::Priority => ordered.sort_by(|a, b| priority_order(a, b)),
            PoolPolicy::FairShare => ordered.sort_by(|a, b| {
                let ua = usage.get(&a.submitter).copied().unwrap_or(0.0);
                let ub = usage.get(&b.submitter).copied().unwrap_or(0.0);
                a.priority
                    .cmp(&b.priority)
                    .then(ua.total_cmp(&ub))
                    .then(a.submitted_at.cmp(&b.submitted_at))
                    .then(a.seq.cmp(&b.seq))
            }),
        }
        ordered
    }
}

fn priority_order(a: &QueuedTask, b: &QueuedTask) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then(a.submitted_at.cmp(&b.submitted_at))
        .then(a.seq.cmp(&b.seq))
}
