//! Agent command delivery.
//!
//! Agents poll: every heartbeat response carries the commands queued for
//! that agent since its previous heartbeat. Commands to one agent are
//! delivered in the order they were queued.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use slotgrid_core::AgentCommand;
use tracing::debug;

/// Where the pool runtime sends agent commands.
pub trait AgentTransport: Send + Sync {
    fn send(&self, agent_id: &str, command: AgentCommand);
}

/// Per-agent FIFO of undelivered commands.
#[derive(Debug, Clone, Default)]
pub struct CommandOutbox {
    queues: Arc<Mutex<HashMap<String, VecDeque<AgentCommand>>>>,
}

impl CommandOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<AgentCommand>>> {
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take every queued command for an agent.
    pub fn drain(&self, agent_id: &str) -> Vec<AgentCommand> {
        self.lock()
            .remove(agent_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn pending(&self, agent_id: &str) -> usize {
        self.lock().get(agent_id).map(VecDeque::len).unwrap_or(0)
    }
}

impl AgentTransport for CommandOutbox {
    fn send(&self, agent_id: &str, command: AgentCommand) {
        debug!(%agent_id, allocation_id = %command.allocation_id(), "command queued");
        self.lock()
            .entry(agent_id.to_string())
            .or_default()
            .push_back(command);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stop(id: &str) -> AgentCommand {
        AgentCommand::Stop {
            allocation_id: id.to_string(),
        }
    }

    #[test]
    fn drain_returns_commands_in_order() {
        let outbox = CommandOutbox::new();
        outbox.send("a", stop("t.1"));
        outbox.send("a", stop("t.2"));
        outbox.send("b", stop("t.3"));
        assert_eq!(outbox.pending("a"), 2);
        assert_eq!(outbox.drain("a"), vec![stop("t.1"), stop("t.2")]);
        assert_eq!(outbox.pending("a"), 0);
        assert!(outbox.drain("a").is_empty());
        assert_eq!(outbox.drain("b").len(), 1);
    }

    #[test]
    fn clones_share_queues() {
        let outbox = CommandOutbox::new();
        let other = outbox.clone();
        other.send("a", stop("t.1"));
        assert_eq!(outbox.pending("a"), 1);
    }
}
