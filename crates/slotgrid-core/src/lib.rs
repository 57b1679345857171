//! slotgrid-core — shared types for the SlotGrid control plane.
//!
//! Task specs, allocation lifecycle states, the agent wire protocol,
//! `slotgrid.toml` parsing and the submission validator.

pub mod config;
pub mod protocol;
pub mod types;
pub mod validate;

pub use config::{
    ConfigError, FairShareConfig, ListenConfig, MasterConfig, PoolConfig, PoolPolicy,
    SchedulerConfig, SchedulerTimings, parse_duration,
};
pub use protocol::*;
pub use types::*;
pub use validate::{BasicValidator, SpecValidator, ValidationError};
