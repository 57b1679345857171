//! One scheduling pass over a pool.
//!
//! The pass walks the ordered queue against a working copy of the free
//! inventory. A task that fits is allocated and its slots are claimed in
//! the working copy. A task that does not fit may preempt strictly
//! lower-priority preemptible allocations; its claim is then reserved
//! until the victims have released their slots, so later passes neither
//! hand those slots to lower-priority work nor preempt again.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use slotgrid_core::{AllocationId, DeviceKind, TaskId, UnitBinding};
use slotgrid_registry::Snapshot;
use tracing::{debug, info};

use crate::fit::{Inventory, fit_gang};
use crate::queue::QueuedTask;

/// An allocation currently holding slots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeldAllocation {
    pub allocation_id: AllocationId,
    pub task_id: TaskId,
    pub priority: u32,
    pub preemptible: bool,
    /// Epoch ms the allocation was created; older victims go first.
    pub started_at: u64,
    pub device: DeviceKind,
    pub bindings: Vec<UnitBinding>,
    /// Already tearing down: never a preemption candidate.
    pub terminating: bool,
}

/// Claim held for a task whose victims are still tearing down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub task_id: TaskId,
    pub victims: Vec<AllocationId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decision {
    /// Bind every unit of the task. Applied atomically.
    Allocate {
        task_id: TaskId,
        bindings: Vec<UnitBinding>,
    },
    /// Tear down `allocation_id` (of `task_id`) to make room for `for_task`.
    Preempt {
        allocation_id: AllocationId,
        task_id: TaskId,
        for_task: TaskId,
    },
}

/// Output of a pass, valid only against registry version `version`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PassPlan {
    pub version: u64,
    pub decisions: Vec<Decision>,
    pub reservations: BTreeMap<TaskId, Reservation>,
}

impl PassPlan {
    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }
}

/// Run one pass. `queue` must already be in scheduling order.
pub fn plan_pass(
    snapshot: &Snapshot,
    queue: &[&QueuedTask],
    held: &[HeldAllocation],
    reservations: &BTreeMap<TaskId, Reservation>,
    now: u64,
) -> PassPlan {
    let mut inventory = Inventory::from_snapshot(snapshot);
    let mut plan = PassPlan {
        version: snapshot.version,
        ..PassPlan::default()
    };
    // Victims chosen in this pass.
    let mut taken: HashSet<AllocationId> = HashSet::new();

    for task in queue {
        if !task.is_ready(now) {
            continue;
        }
        let device = task.demand.device;

        // A reserved task that now fits on free slots stops waiting.
        if let Some(bindings) = fit_gang(&inventory, &task.demand) {
            inventory.claim(&bindings, device);
            if reservations.contains_key(&task.id) {
                debug!(task_id = %task.id, "reservation released, gang fits on free slots");
            }
            debug!(task_id = %task.id, units = bindings.len(), "gang fits");
            plan.decisions.push(Decision::Allocate {
                task_id: task.id.clone(),
                bindings,
            });
            continue;
        }

        if let Some(reservation) = reservations.get(&task.id) {
            let victims: Vec<&HeldAllocation> = reservation
                .victims
                .iter()
                .filter_map(|id| held.iter().find(|h| &h.allocation_id == id))
                .collect();
            if !victims.is_empty() {
                let mut projected = inventory.clone();
                for victim in &victims {
                    projected.add(&victim.bindings, victim.device);
                }
                if let Some(bindings) = fit_gang(&projected, &task.demand) {
                    inventory.claim(&bindings, device);
                    debug!(task_id = %task.id, victims = victims.len(), "claim reserved while victims tear down");
                    plan.reservations.insert(
                        task.id.clone(),
                        Reservation {
                            task_id: task.id.clone(),
                            victims: victims.iter().map(|v| v.allocation_id.clone()).collect(),
                        },
                    );
                    continue;
                }
            }
        }

        let mut candidates: Vec<&HeldAllocation> = held
            .iter()
            .filter(|h| {
                !h.terminating
                    && h.preemptible
                    && h.priority > task.priority
                    && h.device == device
                    && h.task_id != task.id
                    && !taken.contains(&h.allocation_id)
            })
            .collect();
        if candidates.is_empty() {
            continue;
        }
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.started_at.cmp(&b.started_at))
                .then(a.allocation_id.cmp(&b.allocation_id))
        });

        let Some(victims) = choose_victims(&inventory, task, &candidates) else {
            continue;
        };

        let mut projected = inventory.clone();
        for victim in &victims {
            projected.add(&victim.bindings, victim.device);
        }
        if let Some(bindings) = fit_gang(&projected, &task.demand) {
            inventory.claim(&bindings, device);
        }

        for victim in &victims {
            info!(
                victim = %victim.allocation_id,
                victim_priority = victim.priority,
                for_task = %task.id,
                priority = task.priority,
                "preempting allocation"
            );
            taken.insert(victim.allocation_id.clone());
            plan.decisions.push(Decision::Preempt {
                allocation_id: victim.allocation_id.clone(),
                task_id: victim.task_id.clone(),
                for_task: task.id.clone(),
            });
        }
        plan.reservations.insert(
            task.id.clone(),
            Reservation {
                task_id: task.id.clone(),
                victims: victims.iter().map(|v| v.allocation_id.clone()).collect(),
            },
        );
    }

    plan
}

/// Shortest prefix of `candidates` that makes the gang fit, with victims
/// the fit does not need pruned back out.
fn choose_victims<'a>(
    inventory: &Inventory,
    task: &QueuedTask,
    candidates: &[&'a HeldAllocation],
) -> Option<Vec<&'a HeldAllocation>> {
    let mut projected = inventory.clone();
    let mut chosen: Vec<&HeldAllocation> = Vec::new();
    let mut fits = false;
    for candidate in candidates {
        projected.add(&candidate.bindings, candidate.device);
        chosen.push(candidate);
        if fit_gang(&projected, &task.demand).is_some() {
            fits = true;
            break;
        }
    }
    if !fits {
        return None;
    }

    // Try to spare the more important victims first.
    let mut i = chosen.len();
    while i > 0 {
        i -= 1;
        if chosen.len() == 1 {
            break;
        }
        let mut without = inventory.clone();
        for (j, victim) in chosen.iter().enumerate() {
            if j != i {
                without.add(&victim.bindings, victim.device);
            }
        }
        if fit_gang(&without, &task.demand).is_some() {
            chosen.remove(i);
        }
    }
    Some(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::GangDemand;
    use slotgrid_core::{AgentDescriptor, DeviceDescriptor, UnitRef};
    use slotgrid_registry::AgentRegistry;

    fn registry(agents: &[(&str, usize)]) -> AgentRegistry {
        let mut reg = AgentRegistry::new("default");
        for (id, slots) in agents {
            reg.register(
                &AgentDescriptor {
                    id: id.to_string(),
                    pool: "default".to_string(),
                    address: String::new(),
                    slots: vec![DeviceDescriptor::gpu("A100"); *slots],
                    occupied: Vec::new(),
                },
                0,
            )
            .unwrap();
        }
        reg
    }

    fn task(id: &str, priority: u32, units: u32, seq: u64) -> QueuedTask {
        QueuedTask {
            id: id.to_string(),
            submitter: String::new(),
            priority,
            submitted_at: seq,
            seq,
            demand: GangDemand {
                units,
                slots_per_unit: 1,
                device: DeviceKind::Gpu,
                co_locate: false,
            },
            preemptible: true,
            not_before: None,
        }
    }

    /// Assign the bindings in the registry and describe them as held.
    fn hold(
        reg: &mut AgentRegistry,
        task_id: &str,
        priority: u32,
        preemptible: bool,
        bindings: Vec<UnitBinding>,
        started_at: u64,
    ) -> HeldAllocation {
        let allocation_id = format!("{task_id}.1");
        for b in &bindings {
            for s in &b.slots {
                reg.assign(&b.agent_id, *s, &UnitRef::new(&allocation_id, b.unit))
                    .unwrap();
            }
        }
        HeldAllocation {
            allocation_id,
            task_id: task_id.to_string(),
            priority,
            preemptible,
            started_at,
            device: DeviceKind::Gpu,
            bindings,
            terminating: false,
        }
    }

    fn binding(unit: u32, agent: &str, slots: &[u32]) -> UnitBinding {
        UnitBinding {
            unit,
            agent_id: agent.to_string(),
            slots: slots.to_vec(),
        }
    }

    fn allocated(plan: &PassPlan) -> Vec<String> {
        plan.decisions
            .iter()
            .filter_map(|d| match d {
                Decision::Allocate { task_id, .. } => Some(task_id.clone()),
                _ => None,
            })
            .collect()
    }

    fn preempted(plan: &PassPlan) -> Vec<String> {
        plan.decisions
            .iter()
            .filter_map(|d| match d {
                Decision::Preempt { allocation_id, .. } => Some(allocation_id.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn allocates_in_queue_order_until_full() {
        let reg = registry(&[("a", 4), ("b", 4)]);
        let t1 = task("t1", 1, 6, 1);
        let t2 = task("t2", 2, 4, 2);
        let t3 = task("t3", 3, 2, 3);
        let plan = plan_pass(&reg.query_slots(), &[&t1, &t2, &t3], &[], &BTreeMap::new(), 0);
        // t2 does not fit after t1; t3 still backfills the remaining 2 slots.
        assert_eq!(allocated(&plan), vec!["t1", "t3"]);
        assert_eq!(plan.version, reg.version());
    }

    #[test]
    fn skips_tasks_in_backoff() {
        let reg = registry(&[("a", 4)]);
        let mut t1 = task("t1", 1, 1, 1);
        t1.not_before = Some(10_000);
        let plan = plan_pass(&reg.query_slots(), &[&t1], &[], &BTreeMap::new(), 5_000);
        assert!(plan.is_empty());
        let plan = plan_pass(&reg.query_slots(), &[&t1], &[], &BTreeMap::new(), 10_000);
        assert_eq!(allocated(&plan), vec!["t1"]);
    }

    #[test]
    fn never_preempts_non_preemptible() {
        let mut reg = registry(&[("a", 4), ("b", 4)]);
        let a = hold(
            &mut reg,
            "A",
            5,
            false,
            vec![binding(0, "a", &[0, 1, 2, 3]), binding(1, "b", &[0, 1])],
            0,
        );
        let b = task("B", 1, 4, 2);
        let plan = plan_pass(&reg.query_slots(), &[&b], &[a], &BTreeMap::new(), 0);
        assert!(plan.is_empty());
        assert!(plan.reservations.is_empty());
    }

    #[test]
    fn never_preempts_equal_or_higher_priority() {
        let mut reg = registry(&[("a", 2)]);
        let held = hold(&mut reg, "A", 5, true, vec![binding(0, "a", &[0, 1])], 0);
        let same = task("S", 5, 2, 2);
        let plan = plan_pass(&reg.query_slots(), &[&same], &[held], &BTreeMap::new(), 0);
        assert!(plan.is_empty());
    }

    #[test]
    fn preempts_lower_priority_and_reserves() {
        let mut reg = registry(&[("a", 4), ("b", 4)]);
        let a = hold(
            &mut reg,
            "A",
            5,
            true,
            vec![
                binding(0, "a", &[0]),
                binding(1, "a", &[1]),
                binding(2, "a", &[2]),
                binding(3, "a", &[3]),
                binding(4, "b", &[0]),
                binding(5, "b", &[1]),
            ],
            0,
        );
        let c = task("C", 1, 8, 2);
        let low = task("L", 50, 2, 3);
        let plan = plan_pass(
            &reg.query_slots(),
            &[&c, &low],
            std::slice::from_ref(&a),
            &BTreeMap::new(),
            0,
        );
        assert_eq!(preempted(&plan), vec!["A.1"]);
        assert!(allocated(&plan).is_empty(), "free slots stay reserved for C");
        assert_eq!(plan.reservations["C"].victims, vec!["A.1"]);

        // While A tears down, the reservation keeps holding the claim.
        let mut terminating = a.clone();
        terminating.terminating = true;
        let plan2 = plan_pass(
            &reg.query_slots(),
            &[&c, &low],
            std::slice::from_ref(&terminating),
            &plan.reservations,
            0,
        );
        assert!(plan2.is_empty());
        assert!(plan2.reservations.contains_key("C"));

        // Once A has released its slots, C is allocated.
        for b in &a.bindings {
            for s in &b.slots {
                reg.release(&b.agent_id, *s, &UnitRef::new("A.1", b.unit));
            }
        }
        let plan3 = plan_pass(&reg.query_slots(), &[&c, &low], &[], &plan2.reservations, 0);
        assert_eq!(allocated(&plan3), vec!["C"]);
        assert!(plan3.reservations.is_empty());
    }

    #[test]
    fn reservation_dropped_when_free_capacity_suffices() {
        let mut reg = registry(&[("a", 4), ("b", 4)]);
        let a = hold(
            &mut reg,
            "A",
            5,
            true,
            vec![binding(0, "a", &[0, 1, 2, 3]), binding(1, "b", &[0, 1, 2, 3])],
            0,
        );
        let c = task("C", 1, 8, 2);
        let plan = plan_pass(
            &reg.query_slots(),
            &[&c],
            std::slice::from_ref(&a),
            &BTreeMap::new(),
            0,
        );
        assert_eq!(preempted(&plan), vec!["A.1"]);

        // A new agent joins while A is still tearing down.
        reg.register(
            &AgentDescriptor {
                id: "c".to_string(),
                pool: "default".to_string(),
                address: String::new(),
                slots: vec![DeviceDescriptor::gpu("A100"); 8],
                occupied: Vec::new(),
            },
            0,
        )
        .unwrap();
        let mut terminating = a;
        terminating.terminating = true;
        let plan2 = plan_pass(
            &reg.query_slots(),
            &[&c],
            &[terminating],
            &plan.reservations,
            0,
        );
        assert_eq!(allocated(&plan2), vec!["C"]);
        assert!(plan2.reservations.is_empty());
        match &plan2.decisions[0] {
            Decision::Allocate { bindings, .. } => {
                assert!(bindings.iter().all(|b| b.agent_id == "c"));
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn victims_ordered_least_important_then_oldest() {
        let mut reg = registry(&[("a", 3)]);
        let old = hold(&mut reg, "old", 20, true, vec![binding(0, "a", &[0])], 100);
        let young = hold(&mut reg, "young", 20, true, vec![binding(0, "a", &[1])], 200);
        let mid = hold(&mut reg, "mid", 10, true, vec![binding(0, "a", &[2])], 50);
        let t = task("T", 1, 1, 9);
        let plan = plan_pass(
            &reg.query_slots(),
            &[&t],
            &[young, mid, old],
            &BTreeMap::new(),
            0,
        );
        assert_eq!(preempted(&plan), vec!["old.1"]);
    }

    #[test]
    fn unneeded_victims_are_pruned() {
        let mut reg = registry(&[("a", 2), ("b", 4)]);
        // Least important first in candidate order, but too small on its own.
        let small = hold(&mut reg, "small", 30, true, vec![binding(0, "a", &[0, 1])], 0);
        let big = hold(
            &mut reg,
            "big",
            20,
            true,
            vec![binding(0, "b", &[0, 1, 2, 3])],
            0,
        );
        let mut t = task("T", 1, 1, 9);
        t.demand.slots_per_unit = 4;
        let plan = plan_pass(&reg.query_slots(), &[&t], &[small, big], &BTreeMap::new(), 0);
        assert_eq!(preempted(&plan), vec!["big.1"]);
    }

    #[test]
    fn terminating_allocations_are_not_candidates() {
        let mut reg = registry(&[("a", 2)]);
        let mut held = hold(&mut reg, "A", 9, true, vec![binding(0, "a", &[0, 1])], 0);
        held.terminating = true;
        let t = task("T", 1, 2, 1);
        let plan = plan_pass(&reg.query_slots(), &[&t], &[held], &BTreeMap::new(), 0);
        assert!(plan.is_empty());
    }

    #[test]
    fn no_slot_is_bound_twice_in_one_pass() {
        let reg = registry(&[("a", 4), ("b", 2)]);
        let tasks: Vec<QueuedTask> = (0..5).map(|i| task(&format!("t{i}"), 1, 2, i)).collect();
        let refs: Vec<&QueuedTask> = tasks.iter().collect();
        let plan = plan_pass(&reg.query_slots(), &refs, &[], &BTreeMap::new(), 0);

        let mut seen = HashSet::new();
        for decision in &plan.decisions {
            if let Decision::Allocate { bindings, .. } = decision {
                for b in bindings {
                    for s in &b.slots {
                        assert!(seen.insert((b.agent_id.clone(), *s)), "slot bound twice");
                    }
                }
            }
        }
        assert_eq!(allocated(&plan).len(), 3);
    }
}
