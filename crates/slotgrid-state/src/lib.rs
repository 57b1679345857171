//! slotgrid-state — embedded state store for SlotGrid.
//!
//! Backed by [redb](https://docs.rs/redb). Holds task records, scheduler
//! decisions, the allocation transition journal, ingested training
//! metrics and checkpoint records.
//!
//! # Architecture
//!
//! Values are JSON-serialized into `&[u8]` columns. Composite keys
//! (`{allocation_id}/{state}`, `{trial_id}:{start}-{end}`) keep related
//! records adjacent for prefix scans. `StateStore` is `Clone` and backed
//! by `Arc<Database>`, so pool loops, the journal writer and HTTP
//! handlers share one handle.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
