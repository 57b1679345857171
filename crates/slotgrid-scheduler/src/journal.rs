//! Asynchronous journal writer.
//!
//! Allocation transitions and non-terminal task updates are written off
//! the decision path by a single background task. Writes are retried with
//! backoff until they succeed, so every entry lands at least once.
//! Transition writes are idempotent; a task update never overwrites a
//! task that has already reached a terminal state.

use std::time::Duration;

use slotgrid_state::{StateResult, StateStore};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::effect::JournalEntry;

const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_MAX: Duration = Duration::from_secs(5);

/// Handle for appending journal entries.
#[derive(Debug, Clone)]
pub struct Journal {
    tx: mpsc::UnboundedSender<JournalEntry>,
}

impl Journal {
    /// Start the writer. It drains what is queued and exits on shutdown.
    pub fn spawn(store: StateStore, shutdown: watch::Receiver<bool>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_journal(store, rx, shutdown));
        (Self { tx }, handle)
    }

    pub fn append(&self, entry: JournalEntry) {
        if self.tx.send(entry).is_err() {
            warn!("journal writer stopped, entry dropped");
        }
    }
}

async fn run_journal(
    store: StateStore,
    mut rx: mpsc::UnboundedReceiver<JournalEntry>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("journal writer started");
    loop {
        tokio::select! {
            entry = rx.recv() => match entry {
                Some(entry) => write_with_retry(&store, &entry, &shutdown).await,
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }

    let mut flushed = 0usize;
    while let Ok(entry) = rx.try_recv() {
        match write_entry(&store, &entry) {
            Ok(()) => flushed += 1,
            Err(err) => error!(error = %err, "journal entry lost at shutdown"),
        }
    }
    info!(flushed, "journal writer stopped");
}

async fn write_with_retry(
    store: &StateStore,
    entry: &JournalEntry,
    shutdown: &watch::Receiver<bool>,
) {
    let mut delay = RETRY_BASE;
    loop {
        match write_entry(store, entry) {
            Ok(()) => return,
            Err(err) => {
                if *shutdown.borrow() {
                    error!(error = %err, "journal entry lost at shutdown");
                    return;
                }
                warn!(error = %err, retry_in_ms = delay.as_millis() as u64, "journal write failed");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_MAX);
            }
        }
    }
}

/// Apply one entry to the store.
pub fn write_entry(store: &StateStore, entry: &JournalEntry) -> StateResult<()> {
    match entry {
        JournalEntry::Transition(transition) => {
            if !store.put_transition(transition)? {
                debug!(
                    allocation_id = %transition.allocation_id,
                    state = transition.state.as_str(),
                    "transition already journaled"
                );
            }
            Ok(())
        }
        JournalEntry::Task(record) => {
            if !record.state.is_terminal() {
                let finished = store
                    .get_task(&record.id)?
                    .is_some_and(|existing| existing.state.is_terminal());
                if finished {
                    debug!(task_id = %record.id, "late update for finished task skipped");
                    return Ok(());
                }
            }
            store.put_task(record)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotgrid_core::{AllocationState, TaskSpec, TaskState};
    use slotgrid_state::{TaskRecord, TransitionRecord};

    fn record(state: TaskState) -> TaskRecord {
        TaskRecord {
            id: "task-1".to_string(),
            spec: TaskSpec::new("train", "default", 2),
            state,
            seq: 1,
            submitted_at: 1_000,
            attempts: 1,
            failures: 0,
            last_reason: None,
            updated_at: 1_000,
        }
    }

    #[test]
    fn late_update_never_reopens_finished_task() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_task(&record(TaskState::Completed)).unwrap();
        write_entry(&store, &JournalEntry::Task(record(TaskState::Running))).unwrap();
        assert_eq!(
            store.get_task("task-1").unwrap().unwrap().state,
            TaskState::Completed
        );
    }

    #[test]
    fn replayed_transition_is_harmless() {
        let store = StateStore::open_in_memory().unwrap();
        let entry = JournalEntry::Transition(TransitionRecord {
            allocation_id: "task-1.1".to_string(),
            task_id: "task-1".to_string(),
            state: AllocationState::Starting,
            reason: None,
            at: 1_000,
        });
        write_entry(&store, &entry).unwrap();
        write_entry(&store, &entry).unwrap();
        assert_eq!(store.transitions_for("task-1.1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn queued_entries_flush_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(&dir.path().join("journal.redb")).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (journal, handle) = Journal::spawn(store.clone(), shutdown_rx);

        journal.append(JournalEntry::Task(record(TaskState::Queued)));
        journal.append(JournalEntry::Task(record(TaskState::Running)));
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(
            store.get_task("task-1").unwrap().unwrap().state,
            TaskState::Running
        );
    }
}
