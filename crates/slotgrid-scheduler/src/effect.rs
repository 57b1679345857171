//! Side effects produced by the pool state machine.
//!
//! `PoolState` never performs I/O beyond its synchronous decision
//! writes. Everything else it wants done is returned as an `Effect` and
//! carried out by the pool runtime.

use std::time::Duration;

use serde::Serialize;
use slotgrid_core::{AgentCommand, AgentId, AllocationId, TaskId, TaskState, TerminationReason};
use slotgrid_state::{TaskRecord, TransitionRecord};

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Queue a command for an agent.
    Dispatch {
        agent_id: AgentId,
        command: AgentCommand,
    },
    /// Fire `timer` back into the pool after `after`.
    Arm { after: Duration, timer: Timer },
    /// Persist asynchronously, at least once.
    Journal(JournalEntry),
    Notify(TaskNotification),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Timer {
    StartDeadline(AllocationId),
    TeardownDeadline(AllocationId),
    /// Reclaim slots an agent still reports for an allocation nobody owns.
    OrphanDeadline {
        agent_id: AgentId,
        allocation_id: AllocationId,
    },
    RetryReady(TaskId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum JournalEntry {
    Transition(TransitionRecord),
    Task(TaskRecord),
}

/// Published when a task reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskNotification {
    pub task_id: TaskId,
    pub pool: String,
    pub state: TaskState,
    pub reason: Option<TerminationReason>,
    /// Set when the retry budget ran out.
    pub error: Option<String>,
}
