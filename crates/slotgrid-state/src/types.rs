//! Persisted record types.

use serde::{Deserialize, Serialize};
use slotgrid_core::{
    AllocationId, AllocationState, TaskId, TaskSpec, TaskState, TerminationReason, UnitBinding,
};

// ── Tasks ─────────────────────────────────────────────────────────

/// Durable view of a task, rewritten on every gang-level state change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub id: TaskId,
    pub spec: TaskSpec,
    pub state: TaskState,
    /// Monotonic submission sequence, the final ordering tie-break.
    pub seq: u64,
    /// Submission time, epoch milliseconds.
    pub submitted_at: u64,
    /// Number of allocation attempts made so far.
    pub attempts: u32,
    /// Failed attempts charged against the retry budget.
    pub failures: u32,
    /// Why the latest allocation ended.
    #[serde(default)]
    pub last_reason: Option<TerminationReason>,
    pub updated_at: u64,
}

impl TaskRecord {
    pub fn table_key(&self) -> String {
        self.id.clone()
    }
}

// ── Decisions ─────────────────────────────────────────────────────

/// A scheduler decision, recorded before any command for it is sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionRecord {
    pub allocation_id: AllocationId,
    pub task_id: TaskId,
    pub pool: String,
    pub decision: DecisionKind,
    pub decided_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionKind {
    /// Bind every unit of the task attempt.
    Allocate { attempt: u32, bindings: Vec<UnitBinding> },
    /// Tear the allocation down to make room for `for_task`.
    Preempt { for_task: TaskId },
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allocate { .. } => "allocate",
            Self::Preempt { .. } => "preempt",
        }
    }
}

impl DecisionRecord {
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.allocation_id, self.decision.as_str())
    }
}

// ── Transitions ───────────────────────────────────────────────────

/// One step of an allocation's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionRecord {
    pub allocation_id: AllocationId,
    pub task_id: TaskId,
    pub state: AllocationState,
    #[serde(default)]
    pub reason: Option<TerminationReason>,
    pub at: u64,
}

impl TransitionRecord {
    /// Idempotent key: an allocation enters each state at most once.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.allocation_id, self.state.as_str())
    }
}

/// An allocation decision whose lifecycle has not reached a terminal
/// state in the journal, with everything recorded about it so far.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveAllocation {
    pub decision: DecisionRecord,
    pub transitions: Vec<TransitionRecord>,
    /// Set when a preemption was decided but never finished.
    pub preempted_for: Option<TaskId>,
}

impl LiveAllocation {
    /// Latest journaled state, `Pending` when nothing was journaled yet.
    pub fn last_state(&self) -> AllocationState {
        self.transitions
            .iter()
            .max_by_key(|t| (t.at, state_rank(t.state)))
            .map(|t| t.state)
            .unwrap_or(AllocationState::Pending)
    }
}

fn state_rank(state: AllocationState) -> u8 {
    match state {
        AllocationState::Pending => 0,
        AllocationState::Starting => 1,
        AllocationState::Running => 2,
        AllocationState::Terminating => 3,
        _ => 4,
    }
}

// ── Metrics ───────────────────────────────────────────────────────

/// State of an ingested metrics or checkpoint record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricsState {
    #[serde(alias = "STATE_ACTIVE")]
    Active,
    #[serde(alias = "STATE_COMPLETED")]
    Completed,
    #[serde(alias = "STATE_ERRORED")]
    Errored,
}

impl MetricsState {
    /// Completed and Errored records are immutable.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// Metrics for a range of training batches of one trial.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingMetrics {
    pub trial_id: String,
    #[serde(default)]
    pub experiment_id: u64,
    #[serde(default)]
    pub step_id: u64,
    pub start_batch: u64,
    pub end_batch: u64,
    pub state: MetricsState,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub metrics: serde_json::Value,
}

impl TrainingMetrics {
    pub fn table_key(&self) -> String {
        format!(
            "{}:{:020}-{:020}",
            self.trial_id, self.start_batch, self.end_batch
        )
    }
}

/// Validation metrics taken after `total_batches` batches of one trial.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationMetrics {
    pub trial_id: String,
    #[serde(default)]
    pub experiment_id: u64,
    pub total_batches: u64,
    pub state: MetricsState,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub metrics: serde_json::Value,
}

impl ValidationMetrics {
    pub fn table_key(&self) -> String {
        format!("{}:{:020}", self.trial_id, self.total_batches)
    }
}

/// A checkpoint a trial saved after `batch_number` batches. Created
/// Active when saving begins; `uuid` and the storage details arrive with
/// the Completed update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointRecord {
    pub trial_id: String,
    #[serde(default)]
    pub experiment_id: u64,
    pub batch_number: u64,
    pub state: MetricsState,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    /// Stored files and their sizes in bytes.
    #[serde(default)]
    pub resources: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub hparams: serde_json::Value,
}

impl CheckpointRecord {
    pub fn table_key(&self) -> String {
        format!("{}:{:020}", self.trial_id, self.batch_number)
    }
}

/// Result of a metrics or checkpoint upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    /// Identical replay of an existing record.
    Unchanged,
}
