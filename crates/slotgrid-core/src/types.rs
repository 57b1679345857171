//! Domain types shared by every SlotGrid crate.
//!
//! Priorities follow a single convention everywhere: a lower number is
//! more important (`0` is the most important task in a pool).

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Identifier of a submitted task (`task-<n>`).
pub type TaskId = String;

/// Identifier of an agent, chosen by the agent on registration.
pub type AgentId = String;

/// Identifier of one allocation attempt of a task (`<task_id>.<attempt>`).
pub type AllocationId = String;

/// Priority given to tasks that don't specify one.
pub const DEFAULT_PRIORITY: u32 = 42;

/// Build the allocation id for a task attempt.
pub fn allocation_id(task_id: &str, attempt: u32) -> AllocationId {
    format!("{task_id}.{attempt}")
}

/// Milliseconds since the Unix epoch. Scheduler state stores wall-clock
/// times in this unit so that tests can drive time explicitly.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Devices ───────────────────────────────────────────────────────

/// Device class backing a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    Gpu,
    Cpu,
}

/// Per-slot device description reported by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub kind: DeviceKind,
    /// Vendor/model string, e.g. "NVIDIA A100".
    #[serde(default)]
    pub brand: String,
    #[serde(default)]
    pub uuid: String,
}

impl DeviceDescriptor {
    pub fn gpu(brand: &str) -> Self {
        Self {
            kind: DeviceKind::Gpu,
            brand: brand.to_string(),
            uuid: String::new(),
        }
    }

    pub fn cpu() -> Self {
        Self {
            kind: DeviceKind::Cpu,
            brand: String::new(),
            uuid: String::new(),
        }
    }
}

// ── Tasks ─────────────────────────────────────────────────────────

/// A task submission as received from the control surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub pool: String,
    /// Owner used for fair-share accounting.
    #[serde(default)]
    pub submitter: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Number of gang members.
    #[serde(default = "default_one")]
    pub units: u32,
    #[serde(default = "default_one")]
    pub slots_per_unit: u32,
    #[serde(default)]
    pub device: DeviceKind,
    /// Whether higher-priority work may preempt this task.
    #[serde(default = "default_true")]
    pub preemptible: bool,
    /// Force every unit onto one agent. `None` uses the pool default.
    #[serde(default)]
    pub co_locate: Option<bool>,
    /// Overrides the configured retry budget.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Opaque payload forwarded to agents in start commands.
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn default_priority() -> u32 {
    DEFAULT_PRIORITY
}

fn default_one() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl TaskSpec {
    /// Minimal spec used by tests and examples.
    pub fn new(name: &str, pool: &str, units: u32) -> Self {
        Self {
            name: name.to_string(),
            pool: pool.to_string(),
            submitter: String::new(),
            priority: DEFAULT_PRIORITY,
            units,
            slots_per_unit: 1,
            device: DeviceKind::Gpu,
            preemptible: true,
            co_locate: None,
            max_attempts: None,
            payload: serde_json::Value::Null,
        }
    }

    /// Total slots the gang occupies.
    pub fn slots_required(&self) -> u64 {
        u64::from(self.units) * u64::from(self.slots_per_unit)
    }
}

/// Gang-level state of a task. A task is never reported per unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting in the pool queue (including retry backoff).
    Queued,
    /// Allocated; agents are starting the gang.
    Scheduled,
    Running,
    Terminating,
    Completed,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

// ── Allocations ───────────────────────────────────────────────────

/// Lifecycle state of a single allocation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationState {
    Pending,
    Starting,
    Running,
    Terminating,
    Completed,
    Failed,
    Preempted,
    Canceled,
}

impl AllocationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Preempted | Self::Canceled
        )
    }

    /// Starting or Running: holds slots and can be preempted.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: AllocationState) -> bool {
        use AllocationState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            // Loss of a bound slot fails the gang from any live state.
            (_, Failed) => true,
            (Pending, Starting) => true,
            (Starting, Running) | (Starting, Terminating) => true,
            (Running, Terminating) => true,
            (Terminating, Completed) | (Terminating, Preempted) | (Terminating, Canceled) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Terminating => "terminating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Preempted => "preempted",
            Self::Canceled => "canceled",
        }
    }
}

/// Why an allocation left the running path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationReason {
    /// Every unit exited successfully.
    Exited,
    ExitFailure { message: String },
    Canceled,
    Preempted { for_task: TaskId },
    StartFailed { agent_id: AgentId, message: String },
    StartTimeout,
    AgentLost { agent_id: AgentId },
    SlotUnhealthy { agent_id: AgentId, slot: u32 },
    /// Restored after a restart and never confirmed by its agents.
    NotReconciled,
}

impl TerminationReason {
    /// Terminal allocation state reached after teardown for this reason.
    pub fn terminal_state(&self) -> AllocationState {
        match self {
            Self::Exited => AllocationState::Completed,
            Self::Canceled => AllocationState::Canceled,
            Self::Preempted { .. } => AllocationState::Preempted,
            _ => AllocationState::Failed,
        }
    }

    /// Transient failures are retried with backoff; exits are not transient
    /// but still draw from the same retry budget.
    pub fn is_failure(&self) -> bool {
        self.terminal_state() == AllocationState::Failed
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited => write!(f, "all units exited"),
            Self::ExitFailure { message } => write!(f, "unit failed: {message}"),
            Self::Canceled => write!(f, "canceled"),
            Self::Preempted { for_task } => write!(f, "preempted for {for_task}"),
            Self::StartFailed { agent_id, message } => {
                write!(f, "start failed on {agent_id}: {message}")
            }
            Self::StartTimeout => write!(f, "start timed out"),
            Self::AgentLost { agent_id } => write!(f, "agent {agent_id} lost"),
            Self::SlotUnhealthy { agent_id, slot } => {
                write!(f, "slot {slot} on {agent_id} became unhealthy")
            }
            Self::NotReconciled => write!(f, "not confirmed by agents after restart"),
        }
    }
}

/// A unit's placement on one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitBinding {
    pub unit: u32,
    pub agent_id: AgentId,
    pub slots: Vec<u32>,
}

/// Reference from a slot to the unit occupying it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitRef {
    pub allocation_id: AllocationId,
    pub unit: u32,
}

impl UnitRef {
    pub fn new(allocation_id: &str, unit: u32) -> Self {
        Self {
            allocation_id: allocation_id.to_string(),
            unit,
        }
    }
}
