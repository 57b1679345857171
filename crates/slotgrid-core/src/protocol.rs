//! Agent protocol messages.
//!
//! Agents register with a descriptor, heartbeat with per-slot reports,
//! and receive `AgentCommand`s in heartbeat responses. Outcomes of those
//! commands come back as `AgentEvent`s.

use serde::{Deserialize, Serialize};

use crate::types::{AgentId, AllocationId, DeviceDescriptor, TaskId, UnitBinding, UnitRef};

/// Handshake sent by an agent when it (re)connects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: AgentId,
    pub pool: String,
    #[serde(default)]
    pub address: String,
    /// One entry per slot, indexed by position.
    pub slots: Vec<DeviceDescriptor>,
    /// Slots the agent believes are occupied (non-empty after a
    /// control-plane restart).
    #[serde(default)]
    pub occupied: Vec<SlotReport>,
}

/// Agent-side view of a single slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotReport {
    pub index: u32,
    #[serde(default = "default_healthy")]
    pub healthy: bool,
    #[serde(default)]
    pub unit: Option<UnitRef>,
}

fn default_healthy() -> bool {
    true
}

impl SlotReport {
    pub fn healthy(index: u32) -> Self {
        Self {
            index,
            healthy: true,
            unit: None,
        }
    }

    pub fn unhealthy(index: u32) -> Self {
        Self {
            index,
            healthy: false,
            unit: None,
        }
    }

    pub fn occupied(index: u32, unit: UnitRef) -> Self {
        Self {
            index,
            healthy: true,
            unit: Some(unit),
        }
    }
}

/// Command queued for an agent and delivered with its next heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentCommand {
    /// Launch the units of an allocation bound to this agent.
    Start {
        allocation_id: AllocationId,
        task_id: TaskId,
        units: Vec<UnitBinding>,
        #[serde(default)]
        payload: serde_json::Value,
    },
    /// Tear down every unit of the allocation on this agent.
    Stop { allocation_id: AllocationId },
}

impl AgentCommand {
    pub fn allocation_id(&self) -> &str {
        match self {
            Self::Start { allocation_id, .. } | Self::Stop { allocation_id } => allocation_id,
        }
    }
}

/// Outcome reported by an agent for a previously issued command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    StartAck {
        allocation_id: AllocationId,
    },
    StartFailed {
        allocation_id: AllocationId,
        message: String,
    },
    /// A unit finished on its own (completion signal).
    UnitExited {
        allocation_id: AllocationId,
        unit: u32,
        success: bool,
        #[serde(default)]
        message: String,
    },
    StopAck {
        allocation_id: AllocationId,
    },
}

impl AgentEvent {
    pub fn allocation_id(&self) -> &str {
        match self {
            Self::StartAck { allocation_id }
            | Self::StartFailed { allocation_id, .. }
            | Self::UnitExited { allocation_id, .. }
            | Self::StopAck { allocation_id } => allocation_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_format_is_tagged() {
        let cmd = AgentCommand::Stop {
            allocation_id: "task-1.1".to_string(),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "stop");
        assert_eq!(json["allocation_id"], "task-1.1");
    }

    #[test]
    fn event_parses_with_defaults() {
        let event: AgentEvent = serde_json::from_str(
            r#"{"type": "unit_exited", "allocation_id": "task-1.1", "unit": 0, "success": true}"#,
        )
        .unwrap();
        assert_eq!(event.allocation_id(), "task-1.1");
        match event {
            AgentEvent::UnitExited { message, .. } => assert!(message.is_empty()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn slot_report_defaults_to_healthy() {
        let report: SlotReport = serde_json::from_str(r#"{"index": 3}"#).unwrap();
        assert!(report.healthy);
        assert!(report.unit.is_none());
    }
}
