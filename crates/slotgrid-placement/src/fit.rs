//! Free-slot inventory and the gang-fit heuristic.
//!
//! A gang needs `units` groups of `slots_per_unit` slots, each group on a
//! single agent. The heuristic uses as few agents as possible by taking
//! the largest agents first (ties by agent id) and finishes with the
//! best-fit agent: the smallest one that still covers what is left. Within
//! an agent the lowest-indexed free slots are used.

use std::collections::{BTreeMap, BTreeSet};

use slotgrid_core::{AgentId, DeviceKind, UnitBinding};
use slotgrid_registry::Snapshot;

use crate::queue::GangDemand;

/// Working copy of the free, healthy slots on schedulable agents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inventory {
    agents: BTreeMap<AgentId, BTreeMap<DeviceKind, BTreeSet<u32>>>,
}

impl Inventory {
    /// Connected agents only; unhealthy and assigned slots are left out.
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let mut inventory = Self::default();
        for agent in snapshot.agents.iter().filter(|a| a.is_schedulable()) {
            let entry = inventory.agents.entry(agent.id.clone()).or_default();
            for slot in agent.free_slots() {
                entry.entry(slot.device.kind).or_default().insert(slot.index);
            }
        }
        inventory
    }

    pub fn free_count(&self, agent_id: &str, kind: DeviceKind) -> u32 {
        self.agents
            .get(agent_id)
            .and_then(|kinds| kinds.get(&kind))
            .map(|slots| slots.len() as u32)
            .unwrap_or(0)
    }

    pub fn total_free(&self, kind: DeviceKind) -> u64 {
        self.agents
            .keys()
            .map(|id| u64::from(self.free_count(id, kind)))
            .sum()
    }

    /// Return slots to the inventory. Slots on agents that are not
    /// schedulable stay out.
    pub fn add(&mut self, bindings: &[UnitBinding], kind: DeviceKind) {
        for binding in bindings {
            if let Some(kinds) = self.agents.get_mut(&binding.agent_id) {
                kinds.entry(kind).or_default().extend(binding.slots.iter().copied());
            }
        }
    }

    /// Remove every bound slot from the inventory.
    pub fn claim(&mut self, bindings: &[UnitBinding], kind: DeviceKind) {
        for binding in bindings {
            if let Some(slots) = self
                .agents
                .get_mut(&binding.agent_id)
                .and_then(|kinds| kinds.get_mut(&kind))
            {
                for slot in &binding.slots {
                    slots.remove(slot);
                }
            }
        }
    }

    /// Whether every bound slot is currently free.
    pub fn covers(&self, bindings: &[UnitBinding], kind: DeviceKind) -> bool {
        bindings.iter().all(|b| {
            self.agents
                .get(&b.agent_id)
                .and_then(|kinds| kinds.get(&kind))
                .is_some_and(|free| b.slots.iter().all(|s| free.contains(s)))
        })
    }

    fn lowest(&self, agent_id: &str, kind: DeviceKind, count: usize) -> Vec<u32> {
        self.agents
            .get(agent_id)
            .and_then(|kinds| kinds.get(&kind))
            .map(|slots| slots.iter().copied().take(count).collect())
            .unwrap_or_default()
    }
}

/// Find bindings for every unit of the gang, or `None` if it does not fit.
pub fn fit_gang(inventory: &Inventory, demand: &GangDemand) -> Option<Vec<UnitBinding>> {
    if demand.units == 0 || demand.slots_per_unit == 0 {
        return None;
    }

    // (agent, units it can host), largest first, ties by id.
    let mut candidates: Vec<(&str, u32)> = inventory
        .agents
        .keys()
        .map(|id| {
            let units = inventory.free_count(id, demand.device) / demand.slots_per_unit;
            (id.as_str(), units)
        })
        .filter(|(_, units)| *units > 0)
        .collect();
    candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));

    let mut plan: Vec<(&str, u32)> = Vec::new();
    let mut remaining = demand.units;

    if demand.co_locate {
        let (agent, _) = best_fit(&candidates, remaining)?;
        plan.push((agent, remaining));
    } else {
        let mut pool = candidates;
        while remaining > 0 {
            if let Some((agent, _)) = best_fit(&pool, remaining) {
                plan.push((agent, remaining));
                remaining = 0;
            } else {
                if pool.is_empty() {
                    return None;
                }
                let (agent, units) = pool.remove(0);
                plan.push((agent, units));
                remaining -= units;
            }
        }
    }

    let spu = demand.slots_per_unit as usize;
    let mut bindings = Vec::with_capacity(demand.units as usize);
    let mut next_unit = 0u32;
    for (agent, units) in plan {
        let slots = inventory.lowest(agent, demand.device, units as usize * spu);
        for chunk in slots.chunks(spu) {
            bindings.push(UnitBinding {
                unit: next_unit,
                agent_id: agent.to_string(),
                slots: chunk.to_vec(),
            });
            next_unit += 1;
        }
    }
    Some(bindings)
}

/// Smallest candidate that can host `units`, ties by agent id.
fn best_fit<'a>(candidates: &[(&'a str, u32)], units: u32) -> Option<(&'a str, u32)> {
    candidates
        .iter()
        .filter(|(_, cap)| *cap >= units)
        .min_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(b.0)))
        .copied()
}

/// Whether a gang could ever fit, given per-agent slot capacities of its
/// device class. An empty pool has unknown capacity and accepts anything.
pub fn satisfiable(capacities: &[u32], demand: &GangDemand) -> bool {
    if capacities.is_empty() {
        return true;
    }
    if demand.slots_per_unit == 0 {
        return false;
    }
    let per_agent = capacities.iter().map(|c| c / demand.slots_per_unit);
    if demand.co_locate {
        per_agent.max().unwrap_or(0) >= demand.units
    } else {
        per_agent.map(u64::from).sum::<u64>() >= u64::from(demand.units)
    }
}
