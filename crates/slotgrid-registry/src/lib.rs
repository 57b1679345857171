//! slotgrid-registry — per-pool view of agents and their slots.
//!
//! One `AgentRegistry` exists per resource pool and is owned by that
//! pool's decision loop. It tracks agent connectivity, slot health and
//! which task unit holds each slot, and hands out versioned snapshots to
//! the fitting engine.

pub mod error;
pub mod registry;

pub use error::{RegistryError, RegistryResult};
pub use registry::{
    Agent, AgentRegistry, AgentStatus, HeartbeatAck, LossCause, RegisterAck, Slot, SlotLost,
    SlotState, Snapshot,
};
