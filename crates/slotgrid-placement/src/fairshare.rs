//! Decaying per-submitter usage for fair-share pools.
//!
//! Usage is measured in slot-seconds and halves every `half_life`.

use std::collections::HashMap;
use std::time::Duration;

/// Decayed usage below this many slot-seconds is forgotten.
const NEGLIGIBLE_USAGE: f64 = 1e-3;

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: f64,
    /// Epoch ms at which `value` was last decayed.
    as_of: u64,
}

#[derive(Debug, Clone)]
pub struct UsageTracker {
    half_life: Duration,
    entries: HashMap<String, Entry>,
}

impl UsageTracker {
    pub fn new(half_life: Duration) -> Self {
        Self {
            half_life,
            entries: HashMap::new(),
        }
    }

    fn decay(&self, entry: Entry, now: u64) -> f64 {
        decayed(self.half_life, entry, now)
    }

    /// Add `slot_seconds` of consumption for a submitter. Submitters whose
    /// usage has decayed to nothing are dropped.
    pub fn charge(&mut self, submitter: &str, slot_seconds: f64, now: u64) {
        let current = self.usage(submitter, now);
        let half_life = self.half_life;
        self.entries
            .retain(|_, e| decayed(half_life, *e, now) >= NEGLIGIBLE_USAGE);
        self.entries.insert(
            submitter.to_string(),
            Entry {
                value: current + slot_seconds,
                as_of: now,
            },
        );
    }

    pub fn usage(&self, submitter: &str, now: u64) -> f64 {
        self.entries
            .get(submitter)
            .map(|e| self.decay(*e, now))
            .unwrap_or(0.0)
    }

    /// Decayed usage of every known submitter.
    pub fn snapshot(&self, now: u64) -> HashMap<String, f64> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), self.decay(*e, now)))
            .collect()
    }
}

fn decayed(half_life: Duration, entry: Entry, now: u64) -> f64 {
    let half_life_ms = half_life.as_millis() as f64;
    if half_life_ms <= 0.0 {
        return entry.value;
    }
    let elapsed = now.saturating_sub(entry.as_of) as f64;
    entry.value * 0.5_f64.powf(elapsed / half_life_ms)
}
