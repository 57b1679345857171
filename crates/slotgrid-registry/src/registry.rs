//! Agent registry — tracks the agents of one resource pool.
//!
//! Agents are created on their first handshake, refreshed by heartbeats
//! and marked disconnected on timeout or explicit disconnect. Every
//! inventory mutation bumps `version`, which the scheduler uses to detect
//! decisions computed against a stale snapshot.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use slotgrid_core::{AgentDescriptor, AgentId, DeviceDescriptor, DeviceKind, SlotReport, UnitRef};
use tracing::{debug, info, warn};

use crate::error::{RegistryError, RegistryResult};

/// Connectivity state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Connected,
    Disconnected,
    /// Keeps running allocations but receives no new ones.
    Draining,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "unit", rename_all = "snake_case")]
pub enum SlotState {
    Free,
    Assigned(UnitRef),
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Slot {
    pub index: u32,
    pub device: DeviceDescriptor,
    pub state: SlotState,
}

impl Slot {
    pub fn is_free(&self) -> bool {
        self.state == SlotState::Free
    }

    pub fn unit(&self) -> Option<&UnitRef> {
        match &self.state {
            SlotState::Assigned(unit) => Some(unit),
            _ => None,
        }
    }
}

/// In-memory view of a registered agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Agent {
    pub id: AgentId,
    pub address: String,
    pub status: AgentStatus,
    pub slots: Vec<Slot>,
    /// Epoch milliseconds of the last register or heartbeat.
    pub last_heartbeat: u64,
}

impl Agent {
    /// Slots of the given device class, whatever their state.
    pub fn capacity(&self, kind: DeviceKind) -> u32 {
        self.slots.iter().filter(|s| s.device.kind == kind).count() as u32
    }

    pub fn free_slots(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter().filter(|s| s.is_free())
    }

    pub fn is_schedulable(&self) -> bool {
        self.status == AgentStatus::Connected
    }
}

/// Why a held slot was lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossCause {
    Disconnected,
    Unhealthy,
    /// The agent re-registered without reporting the unit.
    NotReported,
}

/// Synthetic event: a slot held by `unit` is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotLost {
    pub agent_id: AgentId,
    pub slot: u32,
    pub unit: UnitRef,
    pub cause: LossCause,
}

/// Returned by `register`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterAck {
    /// True when the agent was already known.
    pub reconnected: bool,
    /// Occupancy the agent reported, for reconciliation.
    pub reported: Vec<(u32, UnitRef)>,
    /// Units the registry had on this agent that the agent no longer reports.
    pub lost: Vec<SlotLost>,
}

/// Returned by `heartbeat`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatAck {
    /// Assigned slots that turned unhealthy.
    pub lost: Vec<SlotLost>,
    /// Slots that became healthy again.
    pub recovered: Vec<u32>,
}

impl HeartbeatAck {
    pub fn changed(&self) -> bool {
        !self.lost.is_empty() || !self.recovered.is_empty()
    }
}

/// Versioned copy of the registry handed to the fitting engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub version: u64,
    pub agents: Vec<Agent>,
}

/// Registry of the agents in one pool.
pub struct AgentRegistry {
    pool: String,
    agents: BTreeMap<AgentId, Agent>,
    version: u64,
    heartbeat_timeout: Duration,
}

impl AgentRegistry {
    pub fn new(pool: &str) -> Self {
        Self {
            pool: pool.to_string(),
            agents: BTreeMap::new(),
            version: 0,
            heartbeat_timeout: Duration::from_secs(30),
        }
    }

    /// Set how long an agent may go without heartbeating.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, agent_id: &str) -> Option<&Agent> {
        self.agents.get(agent_id)
    }

    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    fn bump(&mut self) {
        self.version += 1;
    }

    /// Handshake. A known agent has its inventory replaced and is
    /// reconnected. Slots the agent reports as occupied start out
    /// assigned to the reported unit.
    pub fn register(&mut self, descriptor: &AgentDescriptor, now: u64) -> RegistryResult<RegisterAck> {
        if descriptor.pool != self.pool {
            return Err(RegistryError::WrongPool {
                agent_id: descriptor.id.clone(),
                expected: self.pool.clone(),
                actual: descriptor.pool.clone(),
            });
        }

        let mut slots: Vec<Slot> = descriptor
            .slots
            .iter()
            .enumerate()
            .map(|(index, device)| Slot {
                index: index as u32,
                device: device.clone(),
                state: SlotState::Free,
            })
            .collect();

        let mut reported = Vec::new();
        for report in &descriptor.occupied {
            let Some(slot) = slots.get_mut(report.index as usize) else {
                warn!(agent_id = %descriptor.id, slot = report.index, "report for unknown slot ignored");
                continue;
            };
            match (&report.unit, report.healthy) {
                (Some(unit), _) => {
                    slot.state = SlotState::Assigned(unit.clone());
                    reported.push((report.index, unit.clone()));
                }
                (None, false) => slot.state = SlotState::Unhealthy,
                (None, true) => {}
            }
        }

        let mut lost = Vec::new();
        let previous = self.agents.remove(&descriptor.id);
        let reconnected = previous.is_some();
        if let Some(previous) = previous {
            for slot in &previous.slots {
                if let Some(unit) = slot.unit() {
                    if !reported.iter().any(|(_, r)| r == unit) {
                        lost.push(SlotLost {
                            agent_id: descriptor.id.clone(),
                            slot: slot.index,
                            unit: unit.clone(),
                            cause: LossCause::NotReported,
                        });
                    }
                }
            }
        }

        self.agents.insert(
            descriptor.id.clone(),
            Agent {
                id: descriptor.id.clone(),
                address: descriptor.address.clone(),
                status: AgentStatus::Connected,
                slots,
                last_heartbeat: now,
            },
        );
        self.bump();

        info!(
            agent_id = %descriptor.id,
            pool = %self.pool,
            slots = descriptor.slots.len(),
            reconnected,
            "agent registered"
        );
        Ok(RegisterAck {
            reconnected,
            reported,
            lost,
        })
    }

    /// Refresh liveness and apply per-slot health reports.
    ///
    /// Disconnected agents are reported as unknown so that they
    /// re-register with their occupancy.
    pub fn heartbeat(
        &mut self,
        agent_id: &str,
        reports: &[SlotReport],
        now: u64,
    ) -> RegistryResult<HeartbeatAck> {
        let agent = match self.agents.get_mut(agent_id) {
            Some(agent) if agent.status != AgentStatus::Disconnected => agent,
            _ => {
                warn!(%agent_id, "heartbeat from unknown agent");
                return Err(RegistryError::UnknownAgent(agent_id.to_string()));
            }
        };
        agent.last_heartbeat = now;

        let mut ack = HeartbeatAck::default();
        let mut changed = false;
        for report in reports {
            let Some(slot) = agent.slots.get_mut(report.index as usize) else {
                continue;
            };
            match (&slot.state, report.healthy) {
                (SlotState::Unhealthy, true) => {
                    slot.state = SlotState::Free;
                    ack.recovered.push(slot.index);
                    changed = true;
                }
                (SlotState::Assigned(unit), false) => {
                    warn!(%agent_id, slot = slot.index, unit = %unit.allocation_id, "assigned slot unhealthy");
                    ack.lost.push(SlotLost {
                        agent_id: agent_id.to_string(),
                        slot: slot.index,
                        unit: unit.clone(),
                        cause: LossCause::Unhealthy,
                    });
                    slot.state = SlotState::Unhealthy;
                    changed = true;
                }
                (SlotState::Free, false) => {
                    slot.state = SlotState::Unhealthy;
                    changed = true;
                }
                _ => {}
            }
        }

        if changed {
            self.bump();
        }
        debug!(%agent_id, "heartbeat received");
        Ok(ack)
    }

    /// Mark an agent disconnected. Every assigned slot is lost.
    pub fn mark_disconnected(&mut self, agent_id: &str) -> RegistryResult<Vec<SlotLost>> {
        let agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::UnknownAgent(agent_id.to_string()))?;
        if agent.status == AgentStatus::Disconnected {
            return Ok(Vec::new());
        }
        agent.status = AgentStatus::Disconnected;

        let mut lost = Vec::new();
        for slot in &mut agent.slots {
            if let SlotState::Assigned(unit) = &slot.state {
                lost.push(SlotLost {
                    agent_id: agent_id.to_string(),
                    slot: slot.index,
                    unit: unit.clone(),
                    cause: LossCause::Disconnected,
                });
                slot.state = SlotState::Free;
            }
        }
        self.bump();
        warn!(%agent_id, lost = lost.len(), "agent disconnected");
        Ok(lost)
    }

    /// Stop placing new work on an agent.
    pub fn mark_draining(&mut self, agent_id: &str) -> RegistryResult<()> {
        let agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::UnknownAgent(agent_id.to_string()))?;
        if agent.status == AgentStatus::Connected {
            agent.status = AgentStatus::Draining;
            self.bump();
            info!(%agent_id, "agent draining");
        }
        Ok(())
    }

    pub fn query_slots(&self) -> Snapshot {
        Snapshot {
            version: self.version,
            agents: self.agents.values().cloned().collect(),
        }
    }

    /// Bind a free slot to a unit.
    pub fn assign(&mut self, agent_id: &str, slot: u32, unit: &UnitRef) -> RegistryResult<()> {
        let agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::UnknownAgent(agent_id.to_string()))?;
        let entry = agent
            .slots
            .get_mut(slot as usize)
            .ok_or_else(|| RegistryError::UnknownSlot {
                agent_id: agent_id.to_string(),
                slot,
            })?;
        match &entry.state {
            SlotState::Free => {}
            // Re-assigning the same unit is a no-op.
            SlotState::Assigned(current) if current == unit => return Ok(()),
            _ => {
                return Err(RegistryError::SlotNotFree {
                    agent_id: agent_id.to_string(),
                    slot,
                });
            }
        }
        entry.state = SlotState::Assigned(unit.clone());
        self.bump();
        Ok(())
    }

    /// Free a slot, but only if `unit` holds it. Returns whether it did.
    pub fn release(&mut self, agent_id: &str, slot: u32, unit: &UnitRef) -> bool {
        let Some(entry) = self
            .agents
            .get_mut(agent_id)
            .and_then(|a| a.slots.get_mut(slot as usize))
        else {
            return false;
        };
        if entry.unit() != Some(unit) {
            return false;
        }
        entry.state = SlotState::Free;
        self.bump();
        true
    }

    /// Free every slot on an agent held by any unit of `allocation_id`.
    pub fn release_allocation(&mut self, agent_id: &str, allocation_id: &str) -> Vec<u32> {
        let mut freed = Vec::new();
        if let Some(agent) = self.agents.get_mut(agent_id) {
            for slot in &mut agent.slots {
                if slot.unit().is_some_and(|u| u.allocation_id == allocation_id) {
                    slot.state = SlotState::Free;
                    freed.push(slot.index);
                }
            }
        }
        if !freed.is_empty() {
            self.bump();
        }
        freed
    }

    /// Disconnect every agent whose last heartbeat is older than the
    /// heartbeat timeout.
    pub fn reap_expired(&mut self, now: u64) -> Vec<(AgentId, Vec<SlotLost>)> {
        let timeout = self.heartbeat_timeout.as_millis() as u64;
        let expired: Vec<AgentId> = self
            .agents
            .values()
            .filter(|a| a.status != AgentStatus::Disconnected)
            .filter(|a| now.saturating_sub(a.last_heartbeat) > timeout)
            .map(|a| a.id.clone())
            .collect();

        let mut reaped = Vec::new();
        for agent_id in expired {
            warn!(%agent_id, "agent missed heartbeats");
            if let Ok(lost) = self.mark_disconnected(&agent_id) {
                reaped.push((agent_id, lost));
            }
        }
        reaped
    }

    /// Every (agent, slot) currently assigned.
    pub fn assignments(&self) -> Vec<(AgentId, u32, UnitRef)> {
        self.agents
            .values()
            .flat_map(|a| {
                a.slots
                    .iter()
                    .filter_map(move |s| s.unit().map(|u| (a.id.clone(), s.index, u.clone())))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str, slots: usize) -> AgentDescriptor {
        AgentDescriptor {
            id: id.to_string(),
            pool: "default".to_string(),
            address: "10.0.0.1:9000".to_string(),
            slots: vec![DeviceDescriptor::gpu("A100"); slots],
            occupied: Vec::new(),
        }
    }

    fn registry() -> AgentRegistry {
        AgentRegistry::new("default").with_heartbeat_timeout(Duration::from_secs(10))
    }

    #[test]
    fn register_creates_agent() {
        let mut reg = registry();
        let ack = reg.register(&descriptor("a1", 4), 1_000).unwrap();
        assert!(!ack.reconnected);

        let agent = reg.get("a1").unwrap();
        assert_eq!(agent.status, AgentStatus::Connected);
        assert_eq!(agent.slots.len(), 4);
        assert!(agent.slots.iter().all(Slot::is_free));
        assert_eq!(reg.version(), 1);
    }

    #[test]
    fn register_rejects_foreign_pool() {
        let mut reg = registry();
        let mut desc = descriptor("a1", 4);
        desc.pool = "other".to_string();
        assert!(matches!(
            reg.register(&desc, 0),
            Err(RegistryError::WrongPool { .. })
        ));
    }

    #[test]
    fn reregistration_replaces_inventory_and_reports_occupancy() {
        let mut reg = registry();
        reg.register(&descriptor("a1", 4), 0).unwrap();
        let kept = UnitRef::new("task-1.1", 0);
        let dropped = UnitRef::new("task-2.1", 0);
        reg.assign("a1", 0, &kept).unwrap();
        reg.assign("a1", 1, &dropped).unwrap();
        reg.mark_disconnected("a1").unwrap();

        let mut desc = descriptor("a1", 2);
        desc.occupied = vec![SlotReport::occupied(0, kept.clone())];
        let ack = reg.register(&desc, 5_000).unwrap();

        assert!(ack.reconnected);
        assert_eq!(ack.reported, vec![(0, kept.clone())]);
        let agent = reg.get("a1").unwrap();
        assert_eq!(agent.slots.len(), 2);
        assert_eq!(agent.slots[0].unit(), Some(&kept));
        assert_eq!(agent.status, AgentStatus::Connected);
    }

    #[test]
    fn reregistration_without_disconnect_reports_lost_units() {
        let mut reg = registry();
        reg.register(&descriptor("a1", 4), 0).unwrap();
        let unit = UnitRef::new("task-1.1", 0);
        reg.assign("a1", 2, &unit).unwrap();

        let ack = reg.register(&descriptor("a1", 4), 1_000).unwrap();
        assert_eq!(ack.lost.len(), 1);
        assert_eq!(ack.lost[0].unit, unit);
        assert_eq!(ack.lost[0].cause, LossCause::NotReported);
    }

    #[test]
    fn heartbeat_unknown_agent() {
        let mut reg = registry();
        assert_eq!(
            reg.heartbeat("ghost", &[], 0).unwrap_err(),
            RegistryError::UnknownAgent("ghost".to_string())
        );
    }

    #[test]
    fn heartbeat_after_disconnect_requires_reregistration() {
        let mut reg = registry();
        reg.register(&descriptor("a1", 1), 0).unwrap();
        reg.mark_disconnected("a1").unwrap();
        assert!(reg.heartbeat("a1", &[], 1).is_err());
    }

    #[test]
    fn unhealthy_assigned_slot_is_lost() {
        let mut reg = registry();
        reg.register(&descriptor("a1", 2), 0).unwrap();
        let unit = UnitRef::new("task-1.1", 0);
        reg.assign("a1", 1, &unit).unwrap();
        let before = reg.version();

        let ack = reg
            .heartbeat("a1", &[SlotReport::healthy(0), SlotReport::unhealthy(1)], 100)
            .unwrap();
        assert_eq!(ack.lost.len(), 1);
        assert_eq!(ack.lost[0].cause, LossCause::Unhealthy);
        assert_eq!(reg.get("a1").unwrap().slots[1].state, SlotState::Unhealthy);
        assert!(reg.version() > before);

        // The losing unit cannot free an unhealthy slot.
        assert!(!reg.release("a1", 1, &unit));

        let ack = reg.heartbeat("a1", &[SlotReport::healthy(1)], 200).unwrap();
        assert_eq!(ack.recovered, vec![1]);
        assert!(reg.get("a1").unwrap().slots[1].is_free());
    }

    #[test]
    fn steady_heartbeat_does_not_bump_version() {
        let mut reg = registry();
        reg.register(&descriptor("a1", 2), 0).unwrap();
        let version = reg.version();
        reg.heartbeat("a1", &[SlotReport::healthy(0)], 100).unwrap();
        assert_eq!(reg.version(), version);
        assert_eq!(reg.get("a1").unwrap().last_heartbeat, 100);
    }

    #[test]
    fn disconnect_emits_slot_lost_for_assigned_slots() {
        let mut reg = registry();
        reg.register(&descriptor("a1", 4), 0).unwrap();
        reg.assign("a1", 0, &UnitRef::new("task-1.1", 0)).unwrap();
        reg.assign("a1", 1, &UnitRef::new("task-1.1", 1)).unwrap();

        let lost = reg.mark_disconnected("a1").unwrap();
        assert_eq!(lost.len(), 2);
        assert!(lost.iter().all(|l| l.cause == LossCause::Disconnected));
        assert_eq!(reg.get("a1").unwrap().status, AgentStatus::Disconnected);

        // Second disconnect is a no-op.
        assert!(reg.mark_disconnected("a1").unwrap().is_empty());
    }

    #[test]
    fn assign_requires_free_slot() {
        let mut reg = registry();
        reg.register(&descriptor("a1", 2), 0).unwrap();
        let first = UnitRef::new("task-1.1", 0);
        let second = UnitRef::new("task-2.1", 0);

        reg.assign("a1", 0, &first).unwrap();
        assert!(reg.assign("a1", 0, &first).is_ok());
        assert_eq!(
            reg.assign("a1", 0, &second).unwrap_err(),
            RegistryError::SlotNotFree {
                agent_id: "a1".to_string(),
                slot: 0
            }
        );
        assert!(matches!(
            reg.assign("a1", 9, &second),
            Err(RegistryError::UnknownSlot { .. })
        ));
    }

    #[test]
    fn release_only_by_holder() {
        let mut reg = registry();
        reg.register(&descriptor("a1", 2), 0).unwrap();
        let holder = UnitRef::new("task-1.1", 0);
        reg.assign("a1", 0, &holder).unwrap();

        assert!(!reg.release("a1", 0, &UnitRef::new("task-2.1", 0)));
        assert!(reg.release("a1", 0, &holder));
        assert!(!reg.release("a1", 0, &holder));
    }

    #[test]
    fn release_allocation_frees_all_units() {
        let mut reg = registry();
        reg.register(&descriptor("a1", 4), 0).unwrap();
        reg.assign("a1", 0, &UnitRef::new("task-1.1", 0)).unwrap();
        reg.assign("a1", 1, &UnitRef::new("task-1.1", 1)).unwrap();
        reg.assign("a1", 2, &UnitRef::new("task-2.1", 0)).unwrap();

        assert_eq!(reg.release_allocation("a1", "task-1.1"), vec![0, 1]);
        assert_eq!(reg.assignments().len(), 1);
    }

    #[test]
    fn draining_agent_is_not_schedulable() {
        let mut reg = registry();
        reg.register(&descriptor("a1", 2), 0).unwrap();
        let version = reg.version();
        reg.mark_draining("a1").unwrap();
        assert!(!reg.get("a1").unwrap().is_schedulable());
        assert_eq!(reg.version(), version + 1);
    }

    #[test]
    fn reap_expired_disconnects_silent_agents() {
        let mut reg = registry();
        reg.register(&descriptor("a1", 2), 0).unwrap();
        reg.register(&descriptor("a2", 2), 0).unwrap();
        reg.assign("a1", 0, &UnitRef::new("task-1.1", 0)).unwrap();
        reg.heartbeat("a2", &[], 8_000).unwrap();

        let reaped = reg.reap_expired(12_000);
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].0, "a1");
        assert_eq!(reaped[0].1.len(), 1);
        assert_eq!(reg.get("a2").unwrap().status, AgentStatus::Connected);

        // Already disconnected agents are not reaped twice.
        assert!(reg.reap_expired(30_000).iter().all(|(id, _)| id != "a1"));
    }

    #[test]
    fn snapshot_version_tracks_mutations() {
        let mut reg = registry();
        let v0 = reg.query_slots().version;
        reg.register(&descriptor("a1", 2), 0).unwrap();
        let unit = UnitRef::new("task-1.1", 0);
        reg.assign("a1", 0, &unit).unwrap();
        reg.release("a1", 0, &unit);
        let snap = reg.query_slots();
        assert_eq!(snap.version, v0 + 3);
        assert_eq!(snap.agents.len(), 1);
    }

    #[test]
    fn agent_capacity_counts_slots_of_kind() {
        let mut reg = registry();
        reg.register(&descriptor("a1", 4), 0).unwrap();
        let agent = reg.get("a1").unwrap();
        assert_eq!(agent.capacity(DeviceKind::Gpu), 4);
        assert_eq!(agent.capacity(DeviceKind::Cpu), 0);
    }
}
