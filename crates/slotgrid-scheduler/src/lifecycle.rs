//! Allocation lifecycle.
//!
//! An allocation is one attempt at running a task's gang:
//!
//! ```text
//! Pending -> Starting -> Running -> Terminating -> Completed | Preempted | Canceled
//!               |                       ^
//!               +-----------------------+
//! any live state -> Failed
//! ```
//!
//! A gang is Running only once every bound agent has acknowledged its
//! start. Teardown is complete once every bound agent has either
//! acknowledged the stop or reported all of its units exited.

use std::collections::BTreeSet;

use slotgrid_core::{
    AgentId, AllocationId, AllocationState, DeviceKind, TaskId, TerminationReason, UnitBinding,
    UnitRef,
};
use slotgrid_placement::HeldAllocation;
use slotgrid_state::TransitionRecord;
use tracing::debug;

use crate::error::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub id: AllocationId,
    pub task_id: TaskId,
    pub attempt: u32,
    pub device: DeviceKind,
    pub bindings: Vec<UnitBinding>,
    state: AllocationState,
    pub reason: Option<TerminationReason>,
    /// Epoch ms of the allocation decision.
    pub created_at: u64,
    /// Epoch ms the whole gang was acknowledged.
    pub started_at: Option<u64>,
    acked: BTreeSet<AgentId>,
    stopped: BTreeSet<AgentId>,
    exited: BTreeSet<u32>,
    /// Agents that have not re-reported this allocation since a restart.
    unconfirmed: BTreeSet<AgentId>,
}

impl Allocation {
    pub fn new(
        id: &str,
        task_id: &str,
        attempt: u32,
        device: DeviceKind,
        bindings: Vec<UnitBinding>,
        now: u64,
    ) -> Self {
        Self {
            id: id.to_string(),
            task_id: task_id.to_string(),
            attempt,
            device,
            bindings,
            state: AllocationState::Pending,
            reason: None,
            created_at: now,
            started_at: None,
            acked: BTreeSet::new(),
            stopped: BTreeSet::new(),
            exited: BTreeSet::new(),
            unconfirmed: BTreeSet::new(),
        }
    }

    /// Rebuild an allocation from the journal. Every bound agent must
    /// re-report it before it counts as confirmed.
    pub fn restored(
        mut self,
        state: AllocationState,
        reason: Option<TerminationReason>,
    ) -> Self {
        self.state = state;
        self.reason = reason;
        if state == AllocationState::Running {
            self.started_at = Some(self.created_at);
            self.acked = self.agents();
        }
        self.unconfirmed = self.agents();
        self
    }

    pub fn state(&self) -> AllocationState {
        self.state
    }

    pub fn transition(&mut self, next: AllocationState) -> SchedulerResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(SchedulerError::InvalidTransition {
                allocation_id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        debug!(allocation_id = %self.id, from = self.state.as_str(), to = next.as_str(), "allocation transition");
        self.state = next;
        Ok(())
    }

    pub fn transition_record(&self, at: u64) -> TransitionRecord {
        TransitionRecord {
            allocation_id: self.id.clone(),
            task_id: self.task_id.clone(),
            state: self.state,
            reason: self.reason.clone(),
            at,
        }
    }

    /// Distinct agents the gang is bound to.
    pub fn agents(&self) -> BTreeSet<AgentId> {
        self.bindings.iter().map(|b| b.agent_id.clone()).collect()
    }

    pub fn is_bound_to(&self, agent_id: &str) -> bool {
        self.bindings.iter().any(|b| b.agent_id == agent_id)
    }

    pub fn bindings_on(&self, agent_id: &str) -> Vec<UnitBinding> {
        self.bindings
            .iter()
            .filter(|b| b.agent_id == agent_id)
            .cloned()
            .collect()
    }

    /// Every (agent, slot, unit) the allocation holds.
    pub fn slot_refs(&self) -> Vec<(AgentId, u32, UnitRef)> {
        self.bindings
            .iter()
            .flat_map(|b| {
                b.slots
                    .iter()
                    .map(|s| (b.agent_id.clone(), *s, UnitRef::new(&self.id, b.unit)))
            })
            .collect()
    }

    pub fn slot_count(&self) -> u64 {
        self.bindings.iter().map(|b| b.slots.len() as u64).sum()
    }

    /// Record a start acknowledgement. Returns true once every bound
    /// agent has acknowledged.
    pub fn record_ack(&mut self, agent_id: &str) -> bool {
        self.acked.insert(agent_id.to_string());
        self.agents().iter().all(|a| self.acked.contains(a))
    }

    pub fn record_exit(&mut self, unit: u32) {
        self.exited.insert(unit);
    }

    pub fn record_stopped(&mut self, agent_id: &str) {
        self.stopped.insert(agent_id.to_string());
    }

    /// The agent has nothing left running for this allocation.
    pub fn agent_done(&self, agent_id: &str) -> bool {
        self.stopped.contains(agent_id)
            || self
                .bindings
                .iter()
                .filter(|b| b.agent_id == agent_id)
                .all(|b| self.exited.contains(&b.unit))
    }

    /// Agents that still need a stop before teardown completes.
    pub fn agents_running(&self) -> Vec<AgentId> {
        self.agents()
            .into_iter()
            .filter(|a| !self.agent_done(a))
            .collect()
    }

    pub fn teardown_complete(&self) -> bool {
        self.agents_running().is_empty()
    }

    /// Mark an agent as having re-reported the allocation. Returns true
    /// once every bound agent has.
    pub fn confirm(&mut self, agent_id: &str) -> bool {
        self.unconfirmed.remove(agent_id);
        self.unconfirmed.is_empty()
    }

    pub fn is_confirmed(&self) -> bool {
        self.unconfirmed.is_empty()
    }

    pub fn awaiting_confirmation_from(&self, agent_id: &str) -> bool {
        self.unconfirmed.contains(agent_id)
    }

    /// View for the placement engine.
    pub fn held(&self, priority: u32, preemptible: bool) -> HeldAllocation {
        HeldAllocation {
            allocation_id: self.id.clone(),
            task_id: self.task_id.clone(),
            priority,
            preemptible,
            started_at: self.started_at.unwrap_or(self.created_at),
            device: self.device,
            bindings: self.bindings.clone(),
            terminating: self.state == AllocationState::Terminating,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(unit: u32, agent: &str, slot: u32) -> UnitBinding {
        UnitBinding {
            unit,
            agent_id: agent.to_string(),
            slots: vec![slot],
        }
    }

    fn gang() -> Allocation {
        Allocation::new(
            "task-1.1",
            "task-1",
            1,
            DeviceKind::Gpu,
            vec![binding(0, "a", 0), binding(1, "a", 1), binding(2, "b", 0)],
            1_000,
        )
    }

    #[test]
    fn running_requires_every_agent() {
        let mut alloc = gang();
        alloc.transition(AllocationState::Starting).unwrap();
        assert!(!alloc.record_ack("a"));
        assert!(alloc.record_ack("b"));
    }

    #[test]
    fn illegal_transitions_rejected() {
        let mut alloc = gang();
        assert!(alloc.transition(AllocationState::Running).is_err());
        alloc.transition(AllocationState::Starting).unwrap();
        alloc.transition(AllocationState::Running).unwrap();
        assert!(alloc.transition(AllocationState::Completed).is_err());
        alloc.transition(AllocationState::Terminating).unwrap();
        alloc.transition(AllocationState::Completed).unwrap();
        assert!(alloc.transition(AllocationState::Failed).is_err());
    }

    #[test]
    fn teardown_counts_exits_and_stops() {
        let mut alloc = gang();
        assert_eq!(alloc.agents_running(), vec!["a".to_string(), "b".to_string()]);
        alloc.record_exit(0);
        assert!(!alloc.agent_done("a"));
        alloc.record_exit(1);
        assert!(alloc.agent_done("a"));
        assert!(!alloc.teardown_complete());
        alloc.record_stopped("b");
        assert!(alloc.teardown_complete());
    }

    #[test]
    fn restored_allocation_needs_confirmation() {
        let mut alloc = gang().restored(AllocationState::Running, None);
        assert!(!alloc.is_confirmed());
        assert!(alloc.awaiting_confirmation_from("b"));
        assert!(!alloc.confirm("a"));
        assert!(alloc.confirm("b"));
        assert!(alloc.is_confirmed());
    }

    #[test]
    fn slot_refs_cover_every_slot() {
        let alloc = gang();
        let refs = alloc.slot_refs();
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[2], ("b".to_string(), 0, UnitRef::new("task-1.1", 2)));
        assert_eq!(alloc.slot_count(), 3);
    }
}
