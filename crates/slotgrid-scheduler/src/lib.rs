//! slotgrid-scheduler — allocation lifecycle and the task control surface.
//!
//! Drives the placement engine for each resource pool and carries its
//! decisions out: gang start and teardown, preemption, failure handling
//! with retry budgets, and recovery after a restart.
//!
//! # Architecture
//!
//! ```text
//! Master (submit / cancel / reprioritize / status, agent protocol)
//!   ├── PoolHandle ──mpsc──> pool loop (one per pool)
//!   │                          └── PoolState
//!   │                               ├── AgentRegistry
//!   │                               ├── TaskQueue + UsageTracker
//!   │                               ├── plan_pass (fit / preempt)
//!   │                               └── Allocation lifecycles
//!   ├── CommandOutbox (commands delivered in heartbeat responses)
//!   ├── Journal (async transition writer)
//!   └── StateStore (tasks, decisions, transitions, metrics)
//! ```

pub mod backoff;
pub mod effect;
pub mod error;
pub mod journal;
pub mod lifecycle;
pub mod master;
pub mod outbox;
pub mod pool;
pub mod runtime;

pub use backoff::RetryBackoff;
pub use effect::{Effect, JournalEntry, TaskNotification, Timer};
pub use error::{SchedulerError, SchedulerResult};
pub use journal::Journal;
pub use lifecycle::Allocation;
pub use master::Master;
pub use outbox::{AgentTransport, CommandOutbox};
pub use pool::{AllocationSummary, PoolState, PoolSummary, TaskStatus};
pub use runtime::{PoolDeps, PoolHandle, spawn_pool};
