//! Per-pool scheduler state.
//!
//! `PoolState` is the single writer for one resource pool: it owns the
//! pool's agent registry, task queue, fair-share usage and every live
//! allocation. Each operation runs to completion, mutates state and
//! returns the effects (agent commands, timers, journal writes) for the
//! runtime to carry out. Allocation decisions are recorded in the state
//! store before any `Start` leaves the pool, so a restart never forgets a
//! gang it may have launched.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;
use slotgrid_core::{
    AgentCommand, AgentDescriptor, AgentEvent, AllocationId, AllocationState, PoolConfig,
    PoolPolicy, SchedulerTimings, SlotReport, TaskId, TaskSpec, TaskState, TerminationReason,
    UnitBinding, allocation_id,
};
use slotgrid_placement::{
    Decision, GangDemand, HeldAllocation, PassPlan, QueuedTask, Reservation, TaskQueue,
    UsageTracker, plan_pass, satisfiable,
};
use slotgrid_registry::{Agent, AgentRegistry, AgentStatus, LossCause, RegistryError, SlotLost};
use slotgrid_state::{DecisionKind, DecisionRecord, LiveAllocation, StateStore, TaskRecord};
use tracing::{debug, error, info, warn};

use crate::backoff::RetryBackoff;
use crate::effect::{Effect, JournalEntry, TaskNotification, Timer};
use crate::error::{SchedulerError, SchedulerResult};
use crate::lifecycle::Allocation;

/// Replans allowed when the registry moves under a pass.
const MAX_STALE_RETRIES: usize = 3;

#[derive(Debug, Clone)]
struct TaskEntry {
    record: TaskRecord,
    demand: GangDemand,
    /// Current attempt, if one holds slots.
    allocation: Option<AllocationId>,
    cancel_requested: bool,
    not_before: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationSummary {
    pub allocation_id: AllocationId,
    pub attempt: u32,
    pub state: AllocationState,
    pub units: Vec<UnitBinding>,
}

/// Gang-level view of a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub name: String,
    pub pool: String,
    pub state: TaskState,
    pub priority: u32,
    pub attempts: u32,
    pub failures: u32,
    pub allocation: Option<AllocationSummary>,
    pub last_reason: Option<TerminationReason>,
}

impl TaskStatus {
    /// Status of a task that is no longer held in memory.
    pub fn from_record(record: &TaskRecord) -> Self {
        Self {
            task_id: record.id.clone(),
            name: record.spec.name.clone(),
            pool: record.spec.pool.clone(),
            state: record.state,
            priority: record.spec.priority,
            attempts: record.attempts,
            failures: record.failures,
            allocation: None,
            last_reason: record.last_reason.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolSummary {
    pub name: String,
    pub policy: PoolPolicy,
    pub agents: usize,
    pub connected_agents: usize,
    pub total_slots: u64,
    pub free_slots: u64,
    pub queued: usize,
    pub allocations: usize,
    pub reservations: usize,
    pub registry_version: u64,
}

pub struct PoolState {
    config: PoolConfig,
    timings: SchedulerTimings,
    backoff: RetryBackoff,
    registry: AgentRegistry,
    queue: TaskQueue,
    usage: UsageTracker,
    tasks: BTreeMap<TaskId, TaskEntry>,
    allocations: BTreeMap<AllocationId, Allocation>,
    reservations: BTreeMap<TaskId, Reservation>,
    store: StateStore,
    /// Epoch ms up to which running allocations were charged.
    last_accrual: u64,
}

impl PoolState {
    pub fn new(config: PoolConfig, timings: SchedulerTimings, store: StateStore) -> Self {
        let registry =
            AgentRegistry::new(&config.name).with_heartbeat_timeout(timings.agent_timeout);
        let queue = TaskQueue::new(config.policy);
        let usage = UsageTracker::new(config.usage_half_life());
        let backoff = RetryBackoff::new(timings.backoff_base, timings.backoff_max);
        Self {
            config,
            timings,
            backoff,
            registry,
            queue,
            usage,
            tasks: BTreeMap::new(),
            allocations: BTreeMap::new(),
            reservations: BTreeMap::new(),
            store,
            last_accrual: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn timings(&self) -> &SchedulerTimings {
        &self.timings
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn allocation(&self, allocation_id: &str) -> Option<&Allocation> {
        self.allocations.get(allocation_id)
    }

    pub fn allocations(&self) -> impl Iterator<Item = &Allocation> {
        self.allocations.values()
    }

    pub fn reservations(&self) -> &BTreeMap<TaskId, Reservation> {
        &self.reservations
    }

    pub fn agents(&self) -> Vec<Agent> {
        self.registry.agents().cloned().collect()
    }

    // ── Task control ──────────────────────────────────────────────

    /// Accept a validated spec under an already-assigned id.
    pub fn submit(
        &mut self,
        task_id: &str,
        seq: u64,
        spec: TaskSpec,
        now: u64,
    ) -> SchedulerResult<Vec<Effect>> {
        let demand = GangDemand::from_spec(&spec, self.config.co_locate);
        self.check_satisfiable(&demand)?;

        let record = TaskRecord {
            id: task_id.to_string(),
            spec,
            state: TaskState::Queued,
            seq,
            submitted_at: now,
            attempts: 0,
            failures: 0,
            last_reason: None,
            updated_at: now,
        };
        self.store.put_task(&record)?;
        info!(
            %task_id,
            pool = %self.config.name,
            units = demand.units,
            slots = demand.slots(),
            priority = record.spec.priority,
            "task submitted"
        );
        self.tasks.insert(
            task_id.to_string(),
            TaskEntry {
                record,
                demand,
                allocation: None,
                cancel_requested: false,
                not_before: None,
            },
        );
        self.enqueue(task_id);

        let mut effects = Vec::new();
        self.schedule(now, &mut effects);
        Ok(effects)
    }

    /// Reject demand that no combination of the pool's registered agents
    /// could ever hold. A pool without agents accepts anything.
    fn check_satisfiable(&self, demand: &GangDemand) -> SchedulerResult<()> {
        let capacities: Vec<u32> = self
            .registry
            .agents()
            .map(|a| a.capacity(demand.device))
            .collect();
        if satisfiable(&capacities, demand) {
            return Ok(());
        }
        Err(SchedulerError::Unsatisfiable {
            pool: self.config.name.clone(),
            requested: demand.slots(),
            capacity: capacities.iter().map(|c| u64::from(*c)).sum(),
        })
    }

    pub fn cancel(&mut self, task_id: &str, now: u64) -> SchedulerResult<Vec<Effect>> {
        let entry = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::NotFound(task_id.to_string()))?;
        let mut effects = Vec::new();

        match entry.allocation.clone() {
            None => {
                entry.record.last_reason = Some(TerminationReason::Canceled);
                info!(%task_id, "queued task canceled");
                self.finalize(task_id, TaskState::Canceled, None, now, &mut effects);
            }
            Some(alloc_id) => {
                entry.cancel_requested = true;
                let active = self
                    .allocations
                    .get(&alloc_id)
                    .is_some_and(|a| a.state().is_active());
                if active {
                    info!(%task_id, allocation_id = %alloc_id, "canceling running task");
                    self.begin_teardown(&alloc_id, TerminationReason::Canceled, now, &mut effects);
                }
            }
        }

        self.schedule(now, &mut effects);
        Ok(effects)
    }

    /// Change a task's priority. Applies to queued tasks and to the
    /// preemption standing of running ones.
    pub fn reprioritize(
        &mut self,
        task_id: &str,
        priority: u32,
        now: u64,
    ) -> SchedulerResult<Vec<Effect>> {
        let entry = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::NotFound(task_id.to_string()))?;
        let previous = entry.record.spec.priority;
        entry.record.spec.priority = priority;
        entry.record.updated_at = now;

        let mut effects = vec![Effect::Journal(JournalEntry::Task(entry.record.clone()))];
        if self.queue.contains(task_id) {
            self.queue.reprioritize(task_id, priority)?;
        }
        info!(%task_id, from = previous, to = priority, "task reprioritized");

        self.schedule(now, &mut effects);
        Ok(effects)
    }

    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        let entry = self.tasks.get(task_id)?;
        let allocation = entry
            .allocation
            .as_ref()
            .and_then(|id| self.allocations.get(id));
        let state = match allocation.map(|a| a.state()) {
            None => TaskState::Queued,
            Some(AllocationState::Pending | AllocationState::Starting) => TaskState::Scheduled,
            Some(AllocationState::Running) => TaskState::Running,
            Some(AllocationState::Terminating) => TaskState::Terminating,
            Some(_) => entry.record.state,
        };
        Some(TaskStatus {
            task_id: entry.record.id.clone(),
            name: entry.record.spec.name.clone(),
            pool: self.config.name.clone(),
            state,
            priority: entry.record.spec.priority,
            attempts: entry.record.attempts,
            failures: entry.record.failures,
            allocation: allocation.map(|a| AllocationSummary {
                allocation_id: a.id.clone(),
                attempt: a.attempt,
                state: a.state(),
                units: a.bindings.clone(),
            }),
            last_reason: entry.record.last_reason.clone(),
        })
    }

    pub fn summary(&self) -> PoolSummary {
        let snapshot = self.registry.query_slots();
        PoolSummary {
            name: self.config.name.clone(),
            policy: self.config.policy,
            agents: snapshot.agents.len(),
            connected_agents: snapshot
                .agents
                .iter()
                .filter(|a| a.status == AgentStatus::Connected)
                .count(),
            total_slots: snapshot.agents.iter().map(|a| a.slots.len() as u64).sum(),
            free_slots: snapshot
                .agents
                .iter()
                .filter(|a| a.is_schedulable())
                .map(|a| a.free_slots().count() as u64)
                .sum(),
            queued: self.queue.len(),
            allocations: self.allocations.len(),
            reservations: self.reservations.len(),
            registry_version: snapshot.version,
        }
    }

    // ── Agents ────────────────────────────────────────────────────

    pub fn register_agent(
        &mut self,
        descriptor: &AgentDescriptor,
        now: u64,
    ) -> SchedulerResult<Vec<Effect>> {
        let ack = self.registry.register(descriptor, now)?;
        let agent_id = descriptor.id.as_str();
        let mut effects = Vec::new();

        for lost in ack.lost {
            self.handle_slot_lost(lost, now, &mut effects);
        }

        // Reported units that no live allocation accounts for are stopped.
        let mut orphans = BTreeSet::new();
        let mut reported: BTreeSet<(AllocationId, u32)> = BTreeSet::new();
        for (slot, unit) in &ack.reported {
            match self.allocations.get(&unit.allocation_id) {
                Some(alloc) if alloc.is_bound_to(agent_id) => {
                    let matches = alloc
                        .bindings
                        .iter()
                        .any(|b| b.agent_id == agent_id && b.unit == unit.unit && b.slots.contains(slot));
                    if matches {
                        reported.insert((unit.allocation_id.clone(), unit.unit));
                    } else {
                        warn!(%agent_id, slot, allocation_id = %unit.allocation_id, "unit reported on unexpected slot");
                        self.registry.release(agent_id, *slot, unit);
                    }
                }
                _ => {
                    orphans.insert(unit.allocation_id.clone());
                }
            }
        }
        for alloc_id in orphans {
            warn!(%agent_id, allocation_id = %alloc_id, "agent reports unknown allocation, stopping it");
            effects.push(Effect::Dispatch {
                agent_id: agent_id.to_string(),
                command: AgentCommand::Stop {
                    allocation_id: alloc_id.clone(),
                },
            });
            effects.push(Effect::Arm {
                after: self.timings.teardown_timeout,
                timer: Timer::OrphanDeadline {
                    agent_id: agent_id.to_string(),
                    allocation_id: alloc_id,
                },
            });
        }

        let awaiting: Vec<AllocationId> = self
            .allocations
            .values()
            .filter(|a| a.awaiting_confirmation_from(agent_id))
            .map(|a| a.id.clone())
            .collect();
        for alloc_id in awaiting {
            self.reconcile_restored(&alloc_id, agent_id, &reported, now, &mut effects);
        }

        self.schedule(now, &mut effects);
        Ok(effects)
    }

    /// Match a restored allocation against what the agent reported.
    fn reconcile_restored(
        &mut self,
        alloc_id: &str,
        agent_id: &str,
        reported: &BTreeSet<(AllocationId, u32)>,
        now: u64,
        effects: &mut Vec<Effect>,
    ) {
        let Some(alloc) = self.allocations.get_mut(alloc_id) else {
            return;
        };
        let units: Vec<u32> = alloc.bindings_on(agent_id).iter().map(|b| b.unit).collect();
        let present = units
            .iter()
            .filter(|u| reported.contains(&(alloc_id.to_string(), **u)))
            .count();

        if alloc.state() == AllocationState::Terminating {
            if present == 0 {
                alloc.record_stopped(agent_id);
            } else {
                effects.push(Effect::Dispatch {
                    agent_id: agent_id.to_string(),
                    command: AgentCommand::Stop {
                        allocation_id: alloc_id.to_string(),
                    },
                });
            }
            alloc.confirm(agent_id);
            if alloc.teardown_complete() {
                self.finish(alloc_id, now, effects);
            }
            return;
        }

        if present < units.len() {
            warn!(%agent_id, allocation_id = %alloc_id, present, expected = units.len(), "restored allocation missing units");
            self.fail_gang(alloc_id, TerminationReason::NotReconciled, None, now, effects);
            return;
        }

        let confirmed = alloc.confirm(agent_id);
        let all_acked = alloc.record_ack(agent_id);
        if confirmed {
            info!(allocation_id = %alloc_id, "restored allocation confirmed by agents");
            if alloc.state() == AllocationState::Starting && all_acked {
                self.mark_running(alloc_id, now, effects);
            }
        }
    }

    pub fn heartbeat(
        &mut self,
        agent_id: &str,
        reports: &[SlotReport],
        now: u64,
    ) -> SchedulerResult<Vec<Effect>> {
        let ack = self
            .registry
            .heartbeat(agent_id, reports, now)
            .map_err(unknown_agent)?;
        let mut effects = Vec::new();
        let changed = ack.changed();
        for lost in ack.lost {
            self.handle_slot_lost(lost, now, &mut effects);
        }
        if changed {
            self.schedule(now, &mut effects);
        }
        Ok(effects)
    }

    pub fn disconnect_agent(&mut self, agent_id: &str, now: u64) -> SchedulerResult<Vec<Effect>> {
        let lost = self
            .registry
            .mark_disconnected(agent_id)
            .map_err(unknown_agent)?;
        let mut effects = Vec::new();
        for slot in lost {
            self.handle_slot_lost(slot, now, &mut effects);
        }
        self.schedule(now, &mut effects);
        Ok(effects)
    }

    /// Stop placing work on an agent. Running allocations are untouched.
    pub fn drain_agent(&mut self, agent_id: &str) -> SchedulerResult<()> {
        self.registry.mark_draining(agent_id).map_err(unknown_agent)
    }

    pub fn agent_event(
        &mut self,
        agent_id: &str,
        event: AgentEvent,
        now: u64,
    ) -> SchedulerResult<Vec<Effect>> {
        if self.registry.get(agent_id).is_none() {
            return Err(SchedulerError::UnknownAgent(agent_id.to_string()));
        }
        let alloc_id = event.allocation_id().to_string();
        let mut effects = Vec::new();

        match self.allocations.get(&alloc_id).map(|a| a.is_bound_to(agent_id)) {
            None => self.orphan_event(agent_id, &event, &mut effects),
            Some(false) => {
                warn!(%agent_id, allocation_id = %alloc_id, "event from agent outside the gang ignored");
            }
            Some(true) => match event {
                AgentEvent::StartAck { .. } => self.on_start_ack(&alloc_id, agent_id, now, &mut effects),
                AgentEvent::StartFailed { message, .. } => {
                    let starting = self
                        .allocations
                        .get(&alloc_id)
                        .is_some_and(|a| a.state() == AllocationState::Starting);
                    if starting {
                        let reason = TerminationReason::StartFailed {
                            agent_id: agent_id.to_string(),
                            message,
                        };
                        self.fail_gang(&alloc_id, reason, None, now, &mut effects);
                    }
                }
                AgentEvent::UnitExited {
                    unit,
                    success,
                    message,
                    ..
                } => self.on_unit_exited(&alloc_id, unit, success, message, now, &mut effects),
                AgentEvent::StopAck { .. } => self.on_stop_ack(&alloc_id, agent_id, now, &mut effects),
            },
        }

        self.schedule(now, &mut effects);
        Ok(effects)
    }

    fn orphan_event(&mut self, agent_id: &str, event: &AgentEvent, effects: &mut Vec<Effect>) {
        let alloc_id = event.allocation_id();
        match event {
            AgentEvent::StopAck { .. } => {
                let freed = self.registry.release_allocation(agent_id, alloc_id);
                debug!(%agent_id, allocation_id = %alloc_id, freed = freed.len(), "stop acknowledged for finished allocation");
            }
            AgentEvent::StartAck { .. } => {
                warn!(%agent_id, allocation_id = %alloc_id, "late start ack for finished allocation, stopping it");
                effects.push(Effect::Dispatch {
                    agent_id: agent_id.to_string(),
                    command: AgentCommand::Stop {
                        allocation_id: alloc_id.to_string(),
                    },
                });
            }
            _ => debug!(%agent_id, allocation_id = %alloc_id, "event for finished allocation ignored"),
        }
    }

    fn on_start_ack(&mut self, alloc_id: &str, agent_id: &str, now: u64, effects: &mut Vec<Effect>) {
        let Some(alloc) = self.allocations.get_mut(alloc_id) else {
            return;
        };
        if alloc.state() != AllocationState::Starting {
            debug!(allocation_id = %alloc_id, state = alloc.state().as_str(), "start ack ignored");
            return;
        }
        if alloc.record_ack(agent_id) {
            self.mark_running(alloc_id, now, effects);
        }
    }

    fn mark_running(&mut self, alloc_id: &str, now: u64, effects: &mut Vec<Effect>) {
        let Some(alloc) = self.allocations.get_mut(alloc_id) else {
            return;
        };
        if let Err(err) = alloc.transition(AllocationState::Running) {
            warn!(error = %err, "gang not marked running");
            return;
        }
        alloc.started_at = Some(now);
        effects.push(Effect::Journal(JournalEntry::Transition(
            alloc.transition_record(now),
        )));
        info!(allocation_id = %alloc_id, agents = alloc.agents().len(), "gang running");
        let task_id = alloc.task_id.clone();
        self.set_task_state(&task_id, TaskState::Running, now, effects);
    }

    fn on_unit_exited(
        &mut self,
        alloc_id: &str,
        unit: u32,
        success: bool,
        message: String,
        now: u64,
        effects: &mut Vec<Effect>,
    ) {
        let Some(alloc) = self.allocations.get_mut(alloc_id) else {
            return;
        };
        alloc.record_exit(unit);
        debug!(allocation_id = %alloc_id, unit, success, "unit exited");
        match alloc.state() {
            AllocationState::Starting | AllocationState::Running => {
                let reason = if success {
                    TerminationReason::Exited
                } else {
                    TerminationReason::ExitFailure { message }
                };
                self.begin_teardown(alloc_id, reason, now, effects);
            }
            AllocationState::Terminating => {
                if alloc.teardown_complete() {
                    self.finish(alloc_id, now, effects);
                }
            }
            _ => {}
        }
    }

    fn on_stop_ack(&mut self, alloc_id: &str, agent_id: &str, now: u64, effects: &mut Vec<Effect>) {
        let Some(alloc) = self.allocations.get_mut(alloc_id) else {
            return;
        };
        alloc.record_stopped(agent_id);
        if alloc.state() == AllocationState::Terminating && alloc.teardown_complete() {
            self.finish(alloc_id, now, effects);
        }
    }

    // ── Timers and ticks ──────────────────────────────────────────

    pub fn timer_fired(&mut self, timer: Timer, now: u64) -> Vec<Effect> {
        let mut effects = Vec::new();
        match timer {
            Timer::StartDeadline(alloc_id) => {
                if let Some(alloc) = self.allocations.get(&alloc_id) {
                    if alloc.state().is_active() && !alloc.is_confirmed() {
                        warn!(allocation_id = %alloc_id, "restored allocation never confirmed");
                        self.fail_gang(&alloc_id, TerminationReason::NotReconciled, None, now, &mut effects);
                    } else if alloc.state() == AllocationState::Starting {
                        warn!(allocation_id = %alloc_id, "gang start timed out");
                        self.fail_gang(&alloc_id, TerminationReason::StartTimeout, None, now, &mut effects);
                    }
                }
            }
            Timer::TeardownDeadline(alloc_id) => {
                let terminating = self
                    .allocations
                    .get(&alloc_id)
                    .is_some_and(|a| a.state() == AllocationState::Terminating);
                if terminating {
                    warn!(allocation_id = %alloc_id, "teardown deadline passed, releasing slots");
                    self.finish(&alloc_id, now, &mut effects);
                }
            }
            Timer::OrphanDeadline {
                agent_id,
                allocation_id,
            } => {
                if !self.allocations.contains_key(&allocation_id) {
                    let freed = self.registry.release_allocation(&agent_id, &allocation_id);
                    if !freed.is_empty() {
                        warn!(%agent_id, %allocation_id, freed = freed.len(), "stop never acknowledged, reclaiming slots");
                    }
                }
            }
            Timer::RetryReady(task_id) => {
                debug!(%task_id, "retry backoff elapsed");
            }
        }
        self.schedule(now, &mut effects);
        effects
    }

    /// Periodic work: reap silent agents, charge usage, run a pass.
    pub fn tick(&mut self, now: u64) -> Vec<Effect> {
        let mut effects = Vec::new();
        for (_, lost) in self.registry.reap_expired(now) {
            for slot in lost {
                self.handle_slot_lost(slot, now, &mut effects);
            }
        }
        self.schedule(now, &mut effects);
        effects
    }

    fn accrue_usage(&mut self, now: u64) {
        if self.last_accrual == 0 {
            self.last_accrual = now;
            return;
        }
        let elapsed = now.saturating_sub(self.last_accrual);
        self.last_accrual = now;
        if elapsed == 0 || self.config.policy != PoolPolicy::FairShare {
            return;
        }
        let seconds = elapsed as f64 / 1000.0;
        for alloc in self.allocations.values() {
            if alloc.state() != AllocationState::Running {
                continue;
            }
            if let Some(entry) = self.tasks.get(&alloc.task_id) {
                self.usage.charge(
                    &entry.record.spec.submitter,
                    alloc.slot_count() as f64 * seconds,
                    now,
                );
            }
        }
    }

    // ── Scheduling ────────────────────────────────────────────────

    fn schedule(&mut self, now: u64, effects: &mut Vec<Effect>) {
        self.accrue_usage(now);
        for _ in 0..MAX_STALE_RETRIES {
            let plan = self.plan(now);
            if plan.is_empty() && plan.reservations == self.reservations {
                return;
            }
            match self.commit(plan, now, effects) {
                Ok(()) => return,
                Err(SchedulerError::StaleDecision { planned, current }) => {
                    debug!(pool = %self.config.name, planned, current, "stale pass, replanning");
                }
                Err(err) => {
                    error!(pool = %self.config.name, error = %err, "scheduling pass failed");
                    return;
                }
            }
        }
        warn!(pool = %self.config.name, "scheduling pass abandoned after repeated stale decisions");
    }

    fn plan(&self, now: u64) -> PassPlan {
        let usage = match self.config.policy {
            PoolPolicy::FairShare => self.usage.snapshot(now),
            PoolPolicy::Priority => HashMap::new(),
        };
        let ordered: Vec<&QueuedTask> = self.queue.peek_ordered(&usage);
        let held = self.held_allocations();
        plan_pass(
            &self.registry.query_slots(),
            &ordered,
            &held,
            &self.reservations,
            now,
        )
    }

    fn held_allocations(&self) -> Vec<HeldAllocation> {
        self.allocations
            .values()
            .filter_map(|alloc| {
                let entry = self.tasks.get(&alloc.task_id)?;
                Some(alloc.held(entry.record.spec.priority, entry.record.spec.preemptible))
            })
            .collect()
    }

    /// Apply a plan. Fails with `StaleDecision` if the registry changed
    /// since the plan's snapshot.
    fn commit(&mut self, plan: PassPlan, now: u64, effects: &mut Vec<Effect>) -> SchedulerResult<()> {
        let current = self.registry.version();
        if plan.version != current {
            return Err(SchedulerError::StaleDecision {
                planned: plan.version,
                current,
            });
        }
        self.reservations = plan.reservations;
        for decision in plan.decisions {
            match decision {
                Decision::Allocate { task_id, bindings } => {
                    self.apply_allocate(&task_id, bindings, plan.version, now, effects)?;
                }
                Decision::Preempt {
                    allocation_id,
                    for_task,
                    ..
                } => self.apply_preempt(&allocation_id, &for_task, now, effects),
            }
        }
        Ok(())
    }

    fn apply_allocate(
        &mut self,
        task_id: &str,
        bindings: Vec<UnitBinding>,
        planned: u64,
        now: u64,
        effects: &mut Vec<Effect>,
    ) -> SchedulerResult<()> {
        let Some(entry) = self.tasks.get(task_id) else {
            return Ok(());
        };
        let attempt = entry.record.attempts + 1;
        let alloc_id = allocation_id(task_id, attempt);
        if self.allocations.contains_key(&alloc_id) {
            debug!(allocation_id = %alloc_id, "allocation already applied");
            return Ok(());
        }

        let all_free = bindings.iter().all(|b| {
            b.slots.iter().all(|s| {
                self.registry
                    .get(&b.agent_id)
                    .and_then(|a| a.slots.get(*s as usize))
                    .is_some_and(|slot| slot.is_free())
            })
        });
        if !all_free {
            return Err(SchedulerError::StaleDecision {
                planned,
                current: self.registry.version(),
            });
        }

        let decision = DecisionRecord {
            allocation_id: alloc_id.clone(),
            task_id: task_id.to_string(),
            pool: self.config.name.clone(),
            decision: DecisionKind::Allocate {
                attempt,
                bindings: bindings.clone(),
            },
            decided_at: now,
        };
        if let Err(err) = self.store.put_decision(&decision) {
            error!(allocation_id = %alloc_id, error = %err, "decision not recorded, allocation abandoned");
            return Ok(());
        }

        let device = entry.record.spec.device;
        let payload = entry.record.spec.payload.clone();
        let mut alloc = Allocation::new(&alloc_id, task_id, attempt, device, bindings, now);
        for (agent_id, slot, unit) in alloc.slot_refs() {
            self.registry.assign(&agent_id, slot, &unit)?;
        }
        alloc.transition(AllocationState::Starting)?;
        effects.push(Effect::Journal(JournalEntry::Transition(
            alloc.transition_record(now),
        )));
        for agent_id in alloc.agents() {
            let units = alloc.bindings_on(&agent_id);
            effects.push(Effect::Dispatch {
                agent_id,
                command: AgentCommand::Start {
                    allocation_id: alloc_id.clone(),
                    task_id: task_id.to_string(),
                    units,
                    payload: payload.clone(),
                },
            });
        }
        effects.push(Effect::Arm {
            after: self.timings.start_timeout,
            timer: Timer::StartDeadline(alloc_id.clone()),
        });

        self.queue.remove(task_id);
        if let Some(entry) = self.tasks.get_mut(task_id) {
            entry.allocation = Some(alloc_id.clone());
            entry.not_before = None;
            entry.record.attempts = attempt;
            entry.record.state = TaskState::Scheduled;
            entry.record.updated_at = now;
            effects.push(Effect::Journal(JournalEntry::Task(entry.record.clone())));
        }
        info!(
            allocation_id = %alloc_id,
            %task_id,
            attempt,
            agents = alloc.agents().len(),
            slots = alloc.slot_count(),
            "gang allocated"
        );
        self.allocations.insert(alloc_id, alloc);
        Ok(())
    }

    fn apply_preempt(&mut self, alloc_id: &str, for_task: &str, now: u64, effects: &mut Vec<Effect>) {
        let Some(alloc) = self.allocations.get(alloc_id) else {
            return;
        };
        if !alloc.state().is_active() {
            return;
        }
        let record = DecisionRecord {
            allocation_id: alloc_id.to_string(),
            task_id: alloc.task_id.clone(),
            pool: self.config.name.clone(),
            decision: DecisionKind::Preempt {
                for_task: for_task.to_string(),
            },
            decided_at: now,
        };
        if let Err(err) = self.store.put_decision(&record) {
            error!(allocation_id = %alloc_id, error = %err, "preemption not recorded, skipped");
            return;
        }
        let reason = TerminationReason::Preempted {
            for_task: for_task.to_string(),
        };
        self.begin_teardown(alloc_id, reason, now, effects);
    }

    // ── Teardown and outcomes ─────────────────────────────────────

    /// Move an active allocation to Terminating and stop its units.
    fn begin_teardown(
        &mut self,
        alloc_id: &str,
        reason: TerminationReason,
        now: u64,
        effects: &mut Vec<Effect>,
    ) {
        let Some(alloc) = self.allocations.get_mut(alloc_id) else {
            return;
        };
        if let Err(err) = alloc.transition(AllocationState::Terminating) {
            warn!(error = %err, "teardown skipped");
            return;
        }
        info!(allocation_id = %alloc_id, reason = %reason, "tearing down gang");
        alloc.reason = Some(reason);
        effects.push(Effect::Journal(JournalEntry::Transition(
            alloc.transition_record(now),
        )));

        let running = alloc.agents_running();
        let task_id = alloc.task_id.clone();
        for agent_id in &running {
            effects.push(Effect::Dispatch {
                agent_id: agent_id.clone(),
                command: AgentCommand::Stop {
                    allocation_id: alloc_id.to_string(),
                },
            });
        }
        self.set_task_state(&task_id, TaskState::Terminating, now, effects);

        if running.is_empty() {
            self.finish(alloc_id, now, effects);
        } else {
            effects.push(Effect::Arm {
                after: self.timings.teardown_timeout,
                timer: Timer::TeardownDeadline(alloc_id.to_string()),
            });
        }
    }

    /// Complete a teardown: reach the terminal state its reason implies
    /// and release every slot.
    fn finish(&mut self, alloc_id: &str, now: u64, effects: &mut Vec<Effect>) {
        let Some(mut alloc) = self.allocations.remove(alloc_id) else {
            return;
        };
        let reason = alloc.reason.clone().unwrap_or(TerminationReason::Exited);
        if let Err(err) = alloc.transition(reason.terminal_state()) {
            warn!(error = %err, "forcing terminal state");
        }
        self.release_slots(&alloc);
        effects.push(Effect::Journal(JournalEntry::Transition(
            alloc.transition_record(now),
        )));
        info!(allocation_id = %alloc_id, state = alloc.state().as_str(), reason = %reason, "allocation finished");
        self.settle_task(&alloc, reason, now, effects);
    }

    /// Fail a whole gang at once: stop every bound agent except `skip`,
    /// release every slot.
    fn fail_gang(
        &mut self,
        alloc_id: &str,
        reason: TerminationReason,
        skip: Option<&str>,
        now: u64,
        effects: &mut Vec<Effect>,
    ) {
        let Some(mut alloc) = self.allocations.remove(alloc_id) else {
            return;
        };
        alloc.reason = Some(reason.clone());
        if let Err(err) = alloc.transition(AllocationState::Failed) {
            warn!(error = %err, "forcing failed state");
        }
        warn!(allocation_id = %alloc_id, reason = %reason, "gang failed");

        for agent_id in alloc.agents_running() {
            if Some(agent_id.as_str()) == skip {
                continue;
            }
            effects.push(Effect::Dispatch {
                agent_id,
                command: AgentCommand::Stop {
                    allocation_id: alloc_id.to_string(),
                },
            });
        }
        self.release_slots(&alloc);
        effects.push(Effect::Journal(JournalEntry::Transition(
            alloc.transition_record(now),
        )));
        self.settle_task(&alloc, reason, now, effects);
    }

    fn release_slots(&mut self, alloc: &Allocation) {
        for (agent_id, slot, unit) in alloc.slot_refs() {
            self.registry.release(&agent_id, slot, &unit);
        }
    }

    fn handle_slot_lost(&mut self, lost: SlotLost, now: u64, effects: &mut Vec<Effect>) {
        let alloc_id = lost.unit.allocation_id.clone();
        let Some(alloc) = self.allocations.get_mut(&alloc_id) else {
            return;
        };
        // A lost agent has nothing left to tear down.
        if alloc.state() == AllocationState::Terminating {
            alloc.record_stopped(&lost.agent_id);
            if alloc.teardown_complete() {
                self.finish(&alloc_id, now, effects);
            }
            return;
        }
        let reason = match lost.cause {
            LossCause::Unhealthy => TerminationReason::SlotUnhealthy {
                agent_id: lost.agent_id.clone(),
                slot: lost.slot,
            },
            LossCause::Disconnected | LossCause::NotReported => TerminationReason::AgentLost {
                agent_id: lost.agent_id.clone(),
            },
        };
        let skip = (lost.cause == LossCause::Disconnected).then_some(lost.agent_id.as_str());
        self.fail_gang(&alloc_id, reason, skip, now, effects);
    }

    /// Route a finished allocation's outcome to its task.
    fn settle_task(
        &mut self,
        alloc: &Allocation,
        reason: TerminationReason,
        now: u64,
        effects: &mut Vec<Effect>,
    ) {
        let max_attempts = self.timings.max_attempts;
        let Some(entry) = self.tasks.get_mut(&alloc.task_id) else {
            return;
        };
        if entry.allocation.as_deref() != Some(alloc.id.as_str()) {
            return;
        }
        let task_id = alloc.task_id.clone();
        entry.allocation = None;
        entry.record.updated_at = now;

        if entry.cancel_requested || reason == TerminationReason::Canceled {
            entry.record.last_reason = Some(TerminationReason::Canceled);
            self.finalize(&task_id, TaskState::Canceled, None, now, effects);
            return;
        }
        entry.record.last_reason = Some(reason.clone());

        match reason.terminal_state() {
            AllocationState::Completed => {
                self.finalize(&task_id, TaskState::Completed, None, now, effects);
            }
            AllocationState::Preempted => {
                entry.record.state = TaskState::Queued;
                effects.push(Effect::Journal(JournalEntry::Task(entry.record.clone())));
                info!(%task_id, "task requeued after preemption");
                self.enqueue(&task_id);
            }
            _ => {
                entry.record.failures += 1;
                let budget = entry.record.spec.max_attempts.unwrap_or(max_attempts);
                if entry.record.failures >= budget {
                    let err = SchedulerError::PermanentTaskFailure {
                        task_id: task_id.clone(),
                        attempts: entry.record.attempts,
                        reason: reason.to_string(),
                    };
                    error!(error = %err, "retry budget exhausted");
                    self.finalize(&task_id, TaskState::Failed, Some(err.to_string()), now, effects);
                    return;
                }
                let delay = self.backoff.delay(entry.record.failures);
                entry.not_before = Some(now + delay.as_millis() as u64);
                entry.record.state = TaskState::Queued;
                effects.push(Effect::Journal(JournalEntry::Task(entry.record.clone())));
                effects.push(Effect::Arm {
                    after: delay,
                    timer: Timer::RetryReady(task_id.clone()),
                });
                let err = SchedulerError::TransientAgentFailure {
                    task_id: task_id.clone(),
                    attempt: entry.record.attempts,
                    retry_in_ms: delay.as_millis() as u64,
                    reason: reason.to_string(),
                };
                warn!(error = %err, failures = entry.record.failures, budget, "task requeued after failure");
                self.enqueue(&task_id);
            }
        }
    }

    /// Persist a terminal task record and drop the task from memory.
    fn finalize(
        &mut self,
        task_id: &str,
        state: TaskState,
        error: Option<String>,
        now: u64,
        effects: &mut Vec<Effect>,
    ) {
        self.queue.remove(task_id);
        self.reservations.remove(task_id);
        let Some(mut entry) = self.tasks.remove(task_id) else {
            return;
        };
        entry.record.state = state;
        entry.record.updated_at = now;
        if let Err(err) = self.store.put_task(&entry.record) {
            error!(%task_id, error = %err, "terminal task record not written, journaling");
            effects.push(Effect::Journal(JournalEntry::Task(entry.record.clone())));
        }
        info!(%task_id, state = ?state, "task finished");
        effects.push(Effect::Notify(TaskNotification {
            task_id: task_id.to_string(),
            pool: self.config.name.clone(),
            state,
            reason: entry.record.last_reason,
            error,
        }));
    }

    fn set_task_state(&mut self, task_id: &str, state: TaskState, now: u64, effects: &mut Vec<Effect>) {
        if let Some(entry) = self.tasks.get_mut(task_id) {
            if entry.record.state != state {
                entry.record.state = state;
                entry.record.updated_at = now;
                effects.push(Effect::Journal(JournalEntry::Task(entry.record.clone())));
            }
        }
    }

    fn enqueue(&mut self, task_id: &str) {
        let Some(entry) = self.tasks.get(task_id) else {
            return;
        };
        self.queue.enqueue(QueuedTask {
            id: entry.record.id.clone(),
            submitter: entry.record.spec.submitter.clone(),
            priority: entry.record.spec.priority,
            submitted_at: entry.record.submitted_at,
            seq: entry.record.seq,
            demand: entry.demand,
            preemptible: entry.record.spec.preemptible,
            not_before: entry.not_before,
        });
    }

    // ── Recovery ──────────────────────────────────────────────────

    /// Rebuild the pool from persisted tasks and live allocations.
    ///
    /// Restored allocations hold their place until every bound agent
    /// re-registers and reports their units; the start deadline fails
    /// the ones that never are. Tasks without a live allocation go back
    /// to the queue.
    pub fn recover(
        &mut self,
        tasks: Vec<TaskRecord>,
        mut live: Vec<LiveAllocation>,
        now: u64,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.last_accrual = now;

        for record in tasks {
            if record.spec.pool != self.config.name || record.state.is_terminal() {
                continue;
            }
            let demand = GangDemand::from_spec(&record.spec, self.config.co_locate);
            self.tasks.insert(
                record.id.clone(),
                TaskEntry {
                    record,
                    demand,
                    allocation: None,
                    cancel_requested: false,
                    not_before: None,
                },
            );
        }

        live.sort_by_key(|l| match &l.decision.decision {
            DecisionKind::Allocate { attempt, .. } => (l.decision.task_id.clone(), *attempt),
            DecisionKind::Preempt { .. } => (l.decision.task_id.clone(), 0),
        });
        for live in live {
            if live.decision.pool != self.config.name {
                continue;
            }
            let state = live.last_state();
            let DecisionKind::Allocate { attempt, bindings } = live.decision.decision else {
                continue;
            };
            let task_id = live.decision.task_id.clone();
            let alloc_id = live.decision.allocation_id.clone();
            let Some(entry) = self.tasks.get_mut(&task_id) else {
                warn!(allocation_id = %alloc_id, %task_id, "live allocation for unknown task dropped");
                continue;
            };
            if let Some(previous) = entry.allocation.take() {
                self.allocations.remove(&previous);
            }

            let mut reason = live
                .transitions
                .iter()
                .rev()
                .find_map(|t| t.reason.clone());
            let mut state = match state {
                AllocationState::Pending => AllocationState::Starting,
                other => other,
            };
            if let Some(for_task) = live.preempted_for {
                state = AllocationState::Terminating;
                reason = Some(TerminationReason::Preempted { for_task });
            }

            let alloc = Allocation::new(
                &alloc_id,
                &task_id,
                attempt,
                entry.record.spec.device,
                bindings,
                live.decision.decided_at,
            )
            .restored(state, reason);
            entry.allocation = Some(alloc_id.clone());
            entry.record.attempts = entry.record.attempts.max(attempt);

            if state == AllocationState::Terminating {
                for agent_id in alloc.agents() {
                    effects.push(Effect::Dispatch {
                        agent_id,
                        command: AgentCommand::Stop {
                            allocation_id: alloc_id.clone(),
                        },
                    });
                }
                effects.push(Effect::Arm {
                    after: self.timings.teardown_timeout,
                    timer: Timer::TeardownDeadline(alloc_id.clone()),
                });
            } else {
                effects.push(Effect::Arm {
                    after: self.timings.start_timeout,
                    timer: Timer::StartDeadline(alloc_id.clone()),
                });
            }
            debug!(allocation_id = %alloc_id, state = state.as_str(), "allocation restored");
            self.allocations.insert(alloc_id, alloc);
        }

        let unplaced: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|(_, e)| e.allocation.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        for task_id in &unplaced {
            if let Some(entry) = self.tasks.get_mut(task_id) {
                entry.record.state = TaskState::Queued;
            }
            self.enqueue(task_id);
        }

        info!(
            pool = %self.config.name,
            tasks = self.tasks.len(),
            allocations = self.allocations.len(),
            queued = unplaced.len(),
            "pool state recovered"
        );
        effects
    }
}

fn unknown_agent(err: RegistryError) -> SchedulerError {
    match err {
        RegistryError::UnknownAgent(id) => SchedulerError::UnknownAgent(id),
        other => SchedulerError::Registry(other),
    }
}
