//! redb table definitions for the SlotGrid state store.
//!
//! Every table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// Task records keyed by `{task_id}`.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Scheduler decisions keyed by `{allocation_id}/{kind}`.
pub const DECISIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("decisions");

/// Allocation lifecycle journal keyed by `{allocation_id}/{state}`.
pub const TRANSITIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("transitions");

/// Training metrics keyed by `{trial_id}:{start_batch}-{end_batch}` (zero padded).
pub const TRAINING_METRICS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("training_metrics");

/// Validation metrics keyed by `{trial_id}:{total_batches}` (zero padded).
pub const VALIDATION_METRICS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("validation_metrics");

/// Checkpoints keyed by `{trial_id}:{batch_number}` (zero padded).
pub const CHECKPOINTS: TableDefinition<&str, &[u8]> = TableDefinition::new("checkpoints");

/// Counters and other singletons.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// META key of the task id counter.
pub const TASK_SEQ_KEY: &str = "task_seq";
