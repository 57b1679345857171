//! StateStore — redb-backed persistence for SlotGrid.
//!
//! Typed operations over tasks, decisions, lifecycle transitions,
//! metrics and checkpoints. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use slotgrid_core::AllocationState;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

const TERMINAL_STATES: [AllocationState; 4] = [
    AllocationState::Completed,
    AllocationState::Failed,
    AllocationState::Preempted,
    AllocationState::Canceled,
];

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for def in [
            TASKS,
            DECISIONS,
            TRANSITIONS,
            TRAINING_METRICS,
            VALIDATION_METRICS,
            CHECKPOINTS,
        ] {
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON helpers ───────────────────────────────────────

    fn put_json<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Every value whose key starts with `prefix`, in key order.
    fn scan_json<T: DeserializeOwned>(&self, def: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let record =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(record);
            }
        }
        Ok(results)
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Allocate the next task sequence number. Never returns the same
    /// value twice, including across restarts.
    pub fn next_task_seq(&self) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let next;
        {
            let mut table = txn.open_table(META).map_err(map_err!(Table))?;
            let current = table
                .get(TASK_SEQ_KEY)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0);
            next = current + 1;
            table.insert(TASK_SEQ_KEY, next).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(next)
    }

    /// Insert or update a task record.
    pub fn put_task(&self, task: &TaskRecord) -> StateResult<()> {
        let key = task.table_key();
        self.put_json(TASKS, &key, task)?;
        debug!(%key, state = ?task.state, "task stored");
        Ok(())
    }

    pub fn get_task(&self, task_id: &str) -> StateResult<Option<TaskRecord>> {
        self.get_json(TASKS, task_id)
    }

    pub fn list_tasks(&self) -> StateResult<Vec<TaskRecord>> {
        self.scan_json(TASKS, "")
    }

    /// Tasks that have not reached a terminal state, in submission order.
    pub fn list_open_tasks(&self) -> StateResult<Vec<TaskRecord>> {
        let mut tasks: Vec<TaskRecord> = self
            .list_tasks()?
            .into_iter()
            .filter(|t| !t.state.is_terminal())
            .collect();
        tasks.sort_by_key(|t| t.seq);
        Ok(tasks)
    }

    // ── Decisions ──────────────────────────────────────────────────

    /// Durably record a decision. Must complete before the decision is
    /// acted on.
    pub fn put_decision(&self, decision: &DecisionRecord) -> StateResult<()> {
        let key = decision.table_key();
        self.put_json(DECISIONS, &key, decision)?;
        debug!(%key, "decision recorded");
        Ok(())
    }

    pub fn get_decision(&self, key: &str) -> StateResult<Option<DecisionRecord>> {
        self.get_json(DECISIONS, key)
    }

    pub fn list_decisions(&self) -> StateResult<Vec<DecisionRecord>> {
        self.scan_json(DECISIONS, "")
    }

    /// Allocate decisions with no terminal transition in the journal,
    /// grouped with their recorded transitions.
    pub fn live_allocations(&self) -> StateResult<Vec<LiveAllocation>> {
        let mut allocations: BTreeMap<String, LiveAllocation> = BTreeMap::new();
        let mut preemptions: BTreeMap<String, String> = BTreeMap::new();

        for decision in self.list_decisions()? {
            match &decision.decision {
                DecisionKind::Allocate { .. } => {
                    allocations.insert(
                        decision.allocation_id.clone(),
                        LiveAllocation {
                            decision,
                            transitions: Vec::new(),
                            preempted_for: None,
                        },
                    );
                }
                DecisionKind::Preempt { for_task } => {
                    preemptions.insert(decision.allocation_id.clone(), for_task.clone());
                }
            }
        }

        let mut live = Vec::new();
        for (id, mut allocation) in allocations {
            let transitions = self.transitions_for(&id)?;
            if transitions
                .iter()
                .any(|t| TERMINAL_STATES.contains(&t.state))
            {
                continue;
            }
            allocation.transitions = transitions;
            allocation.preempted_for = preemptions.remove(&id);
            live.push(allocation);
        }
        Ok(live)
    }

    // ── Transitions ────────────────────────────────────────────────

    /// Journal a lifecycle transition. Returns `false` when the same
    /// `allocation_id/state` key was already present (replay).
    pub fn put_transition(&self, transition: &TransitionRecord) -> StateResult<bool> {
        let key = transition.table_key();
        let value = serde_json::to_vec(transition).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let inserted;
        {
            let mut table = txn.open_table(TRANSITIONS).map_err(map_err!(Table))?;
            let exists = table.get(key.as_str()).map_err(map_err!(Read))?.is_some();
            if !exists {
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            inserted = !exists;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, inserted, "transition journaled");
        Ok(inserted)
    }

    pub fn transitions_for(&self, allocation_id: &str) -> StateResult<Vec<TransitionRecord>> {
        self.scan_json(TRANSITIONS, &format!("{allocation_id}/"))
    }

    // ── Metrics ────────────────────────────────────────────────────

    /// Create or update a training metrics record keyed by its batch range.
    pub fn upsert_training_metrics(&self, record: &TrainingMetrics) -> StateResult<UpsertOutcome> {
        self.upsert_metrics(TRAINING_METRICS, &record.table_key(), record, |m: &TrainingMetrics| {
            m.state.is_terminal()
        })
    }

    pub fn get_training_metrics(
        &self,
        trial_id: &str,
        start_batch: u64,
        end_batch: u64,
    ) -> StateResult<Option<TrainingMetrics>> {
        self.get_json(
            TRAINING_METRICS,
            &format!("{trial_id}:{start_batch:020}-{end_batch:020}"),
        )
    }

    pub fn list_training_metrics(&self, trial_id: &str) -> StateResult<Vec<TrainingMetrics>> {
        self.scan_json(TRAINING_METRICS, &format!("{trial_id}:"))
    }

    /// Create or update a validation metrics record keyed by `total_batches`.
    pub fn upsert_validation_metrics(
        &self,
        record: &ValidationMetrics,
    ) -> StateResult<UpsertOutcome> {
        self.upsert_metrics(VALIDATION_METRICS, &record.table_key(), record, |m: &ValidationMetrics| {
            m.state.is_terminal()
        })
    }

    pub fn get_validation_metrics(
        &self,
        trial_id: &str,
        total_batches: u64,
    ) -> StateResult<Option<ValidationMetrics>> {
        self.get_json(VALIDATION_METRICS, &format!("{trial_id}:{total_batches:020}"))
    }

    pub fn list_validation_metrics(&self, trial_id: &str) -> StateResult<Vec<ValidationMetrics>> {
        self.scan_json(VALIDATION_METRICS, &format!("{trial_id}:"))
    }

    // ── Checkpoints ────────────────────────────────────────────────

    /// Create or update a checkpoint keyed by `batch_number`.
    pub fn upsert_checkpoint(&self, record: &CheckpointRecord) -> StateResult<UpsertOutcome> {
        self.upsert_metrics(CHECKPOINTS, &record.table_key(), record, |c: &CheckpointRecord| {
            c.state.is_terminal()
        })
    }

    pub fn get_checkpoint(
        &self,
        trial_id: &str,
        batch_number: u64,
    ) -> StateResult<Option<CheckpointRecord>> {
        self.get_json(CHECKPOINTS, &format!("{trial_id}:{batch_number:020}"))
    }

    pub fn list_checkpoints(&self, trial_id: &str) -> StateResult<Vec<CheckpointRecord>> {
        self.scan_json(CHECKPOINTS, &format!("{trial_id}:"))
    }

    /// Read-compare-write in one transaction. Terminal records only accept
    /// identical replays.
    fn upsert_metrics<T>(
        &self,
        def: JsonTable,
        key: &str,
        record: &T,
        is_terminal: impl Fn(&T) -> bool,
    ) -> StateResult<UpsertOutcome>
    where
        T: Serialize + DeserializeOwned + PartialEq,
    {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let existing: Option<T> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };
            outcome = match existing {
                Some(existing) if existing == *record => UpsertOutcome::Unchanged,
                Some(existing) if is_terminal(&existing) => {
                    return Err(StateError::Conflict(format!(
                        "record {key} is final and cannot be changed"
                    )));
                }
                Some(_) => UpsertOutcome::Updated,
                None => UpsertOutcome::Created,
            };
            if outcome != UpsertOutcome::Unchanged {
                table.insert(key, value.as_slice()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, ?outcome, "record upserted");
        Ok(outcome)
    }
}
