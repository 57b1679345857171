//! SlotGrid placement — pending-task queue and the fitting/preemption engine.
//!
//! This crate decides; it never talks to agents. A pass takes a registry
//! snapshot plus the ordered queue and produces a `PassPlan` of
//! `Allocate`/`Preempt` decisions that the lifecycle manager executes.
//!
//! # Components
//!
//! - **`queue`** — per-pool pending tasks with priority/fair-share ordering
//! - **`fairshare`** — decaying per-submitter usage
//! - **`fit`** — free-slot inventory and the gang-fit heuristic
//! - **`planner`** — one scheduling pass, including preemption and reservations

pub mod error;
pub mod fairshare;
pub mod fit;
pub mod planner;
pub mod queue;

pub use error::{QueueError, QueueResult};
pub use fairshare::UsageTracker;
pub use fit::{Inventory, fit_gang, satisfiable};
pub use planner::{Decision, HeldAllocation, PassPlan, Reservation, plan_pass};
pub use queue::{GangDemand, QueuedTask, TaskQueue};
