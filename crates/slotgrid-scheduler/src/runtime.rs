//! Pool decision loop.
//!
//! Each pool runs one task that owns its `PoolState`. Requests arrive on
//! a channel and are handled one at a time; a periodic tick drives agent
//! reaping and scheduling passes; armed timers come back through the same
//! channel. Effects are applied in order after each step.

use std::sync::Arc;

use slotgrid_core::{AgentDescriptor, AgentEvent, SlotReport, TaskSpec, epoch_millis};
use slotgrid_registry::Agent;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::effect::{Effect, TaskNotification, Timer};
use crate::error::{SchedulerError, SchedulerResult};
use crate::journal::Journal;
use crate::outbox::AgentTransport;
use crate::pool::{PoolState, PoolSummary, TaskStatus};

const CHANNEL_CAPACITY: usize = 1024;

type Reply<T> = oneshot::Sender<SchedulerResult<T>>;

enum PoolRequest {
    Submit {
        task_id: String,
        seq: u64,
        spec: TaskSpec,
        reply: Reply<()>,
    },
    Cancel {
        task_id: String,
        reply: Reply<()>,
    },
    Reprioritize {
        task_id: String,
        priority: u32,
        reply: Reply<()>,
    },
    Status {
        task_id: String,
        reply: oneshot::Sender<Option<TaskStatus>>,
    },
    Summary {
        reply: oneshot::Sender<PoolSummary>,
    },
    Agents {
        reply: oneshot::Sender<Vec<Agent>>,
    },
    Register {
        descriptor: AgentDescriptor,
        reply: Reply<()>,
    },
    Heartbeat {
        agent_id: String,
        reports: Vec<SlotReport>,
        reply: Reply<()>,
    },
    Event {
        agent_id: String,
        event: AgentEvent,
        reply: Reply<()>,
    },
    Drain {
        agent_id: String,
        reply: Reply<()>,
    },
    Disconnect {
        agent_id: String,
        reply: Reply<()>,
    },
    Timer(Timer),
}

/// Everything a pool loop needs besides its state.
#[derive(Clone)]
pub struct PoolDeps {
    pub transport: Arc<dyn AgentTransport>,
    pub journal: Journal,
    pub notifications: broadcast::Sender<TaskNotification>,
}

/// Cloneable handle to a running pool loop.
#[derive(Debug, Clone)]
pub struct PoolHandle {
    name: String,
    tx: mpsc::Sender<PoolRequest>,
}

impl std::fmt::Debug for PoolRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Submit { .. } => "submit",
            Self::Cancel { .. } => "cancel",
            Self::Reprioritize { .. } => "reprioritize",
            Self::Status { .. } => "status",
            Self::Summary { .. } => "summary",
            Self::Agents { .. } => "agents",
            Self::Register { .. } => "register",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Event { .. } => "event",
            Self::Drain { .. } => "drain",
            Self::Disconnect { .. } => "disconnect",
            Self::Timer(_) => "timer",
        };
        f.write_str(kind)
    }
}

impl PoolHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> PoolRequest,
    ) -> SchedulerResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| SchedulerError::PoolStopped(self.name.clone()))?;
        rx.await
            .map_err(|_| SchedulerError::PoolStopped(self.name.clone()))
    }

    pub async fn submit(&self, task_id: &str, seq: u64, spec: TaskSpec) -> SchedulerResult<()> {
        let task_id = task_id.to_string();
        self.call(|reply| PoolRequest::Submit {
            task_id,
            seq,
            spec,
            reply,
        })
        .await?
    }

    pub async fn cancel(&self, task_id: &str) -> SchedulerResult<()> {
        let task_id = task_id.to_string();
        self.call(|reply| PoolRequest::Cancel { task_id, reply }).await?
    }

    pub async fn reprioritize(&self, task_id: &str, priority: u32) -> SchedulerResult<()> {
        let task_id = task_id.to_string();
        self.call(|reply| PoolRequest::Reprioritize {
            task_id,
            priority,
            reply,
        })
        .await?
    }

    pub async fn status(&self, task_id: &str) -> SchedulerResult<Option<TaskStatus>> {
        let task_id = task_id.to_string();
        self.call(|reply| PoolRequest::Status { task_id, reply }).await
    }

    pub async fn summary(&self) -> SchedulerResult<PoolSummary> {
        self.call(|reply| PoolRequest::Summary { reply }).await
    }

    pub async fn agents(&self) -> SchedulerResult<Vec<Agent>> {
        self.call(|reply| PoolRequest::Agents { reply }).await
    }

    pub async fn register(&self, descriptor: AgentDescriptor) -> SchedulerResult<()> {
        self.call(|reply| PoolRequest::Register { descriptor, reply })
            .await?
    }

    pub async fn heartbeat(&self, agent_id: &str, reports: Vec<SlotReport>) -> SchedulerResult<()> {
        let agent_id = agent_id.to_string();
        self.call(|reply| PoolRequest::Heartbeat {
            agent_id,
            reports,
            reply,
        })
        .await?
    }

    pub async fn event(&self, agent_id: &str, event: AgentEvent) -> SchedulerResult<()> {
        let agent_id = agent_id.to_string();
        self.call(|reply| PoolRequest::Event {
            agent_id,
            event,
            reply,
        })
        .await?
    }

    pub async fn drain(&self, agent_id: &str) -> SchedulerResult<()> {
        let agent_id = agent_id.to_string();
        self.call(|reply| PoolRequest::Drain { agent_id, reply }).await?
    }

    pub async fn disconnect(&self, agent_id: &str) -> SchedulerResult<()> {
        let agent_id = agent_id.to_string();
        self.call(|reply| PoolRequest::Disconnect { agent_id, reply })
            .await?
    }
}

/// Start a pool loop. `initial` holds effects produced by recovery.
pub fn spawn_pool(
    state: PoolState,
    initial: Vec<Effect>,
    deps: PoolDeps,
    shutdown: watch::Receiver<bool>,
) -> (PoolHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let handle = PoolHandle {
        name: state.name().to_string(),
        tx: tx.clone(),
    };
    let timers = tx.downgrade();
    drop(tx);
    let join = tokio::spawn(run_pool(state, initial, deps, rx, timers, shutdown));
    (handle, join)
}

async fn run_pool(
    mut state: PoolState,
    initial: Vec<Effect>,
    deps: PoolDeps,
    mut rx: mpsc::Receiver<PoolRequest>,
    timers: mpsc::WeakSender<PoolRequest>,
    mut shutdown: watch::Receiver<bool>,
) {
    let pool = state.name().to_string();
    let mut ticker = tokio::time::interval(state.timings().interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(%pool, interval = ?state.timings().interval, "pool loop started");

    apply_effects(initial, &deps, &timers);
    loop {
        tokio::select! {
            request = rx.recv() => {
                let Some(request) = request else { break };
                debug!(%pool, request = ?request, "pool request");
                handle_request(&mut state, request, &deps, &timers);
            }
            _ = ticker.tick() => {
                let effects = state.tick(epoch_millis());
                apply_effects(effects, &deps, &timers);
            }
            _ = shutdown.changed() => {
                info!(%pool, "pool loop shutting down");
                break;
            }
        }
    }
}

/// Handle one request. Effects are applied before the caller is
/// answered, so commands are already queued when the reply arrives.
fn handle_request(
    state: &mut PoolState,
    request: PoolRequest,
    deps: &PoolDeps,
    timers: &mpsc::WeakSender<PoolRequest>,
) {
    let now = epoch_millis();
    let apply = |result: SchedulerResult<Vec<Effect>>, reply: Reply<()>| {
        let result = result.map(|effects| apply_effects(effects, deps, timers));
        let _ = reply.send(result);
    };
    match request {
        PoolRequest::Submit {
            task_id,
            seq,
            spec,
            reply,
        } => apply(state.submit(&task_id, seq, spec, now), reply),
        PoolRequest::Cancel { task_id, reply } => apply(state.cancel(&task_id, now), reply),
        PoolRequest::Reprioritize {
            task_id,
            priority,
            reply,
        } => apply(state.reprioritize(&task_id, priority, now), reply),
        PoolRequest::Status { task_id, reply } => {
            let _ = reply.send(state.status(&task_id));
        }
        PoolRequest::Summary { reply } => {
            let _ = reply.send(state.summary());
        }
        PoolRequest::Agents { reply } => {
            let _ = reply.send(state.agents());
        }
        PoolRequest::Register { descriptor, reply } => {
            apply(state.register_agent(&descriptor, now), reply)
        }
        PoolRequest::Heartbeat {
            agent_id,
            reports,
            reply,
        } => apply(state.heartbeat(&agent_id, &reports, now), reply),
        PoolRequest::Event {
            agent_id,
            event,
            reply,
        } => apply(state.agent_event(&agent_id, event, now), reply),
        PoolRequest::Drain { agent_id, reply } => {
            apply(state.drain_agent(&agent_id).map(|()| Vec::new()), reply)
        }
        PoolRequest::Disconnect { agent_id, reply } => {
            apply(state.disconnect_agent(&agent_id, now), reply)
        }
        PoolRequest::Timer(timer) => apply_effects(state.timer_fired(timer, now), deps, timers),
    }
}

fn apply_effects(effects: Vec<Effect>, deps: &PoolDeps, timers: &mpsc::WeakSender<PoolRequest>) {
    for effect in effects {
        match effect {
            Effect::Dispatch { agent_id, command } => deps.transport.send(&agent_id, command),
            Effect::Arm { after, timer } => {
                let timers = timers.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    if let Some(tx) = timers.upgrade() {
                        let _ = tx.send(PoolRequest::Timer(timer)).await;
                    }
                });
            }
            Effect::Journal(entry) => deps.journal.append(entry),
            Effect::Notify(notification) => {
                let _ = deps.notifications.send(notification);
            }
        }
    }
}
