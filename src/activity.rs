//! Last-seen bookkeeping for tenant instances

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// When an instance was last routed to or kept alive
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivityRecord {
    /// Monotonic time used for idle computations
    pub last_seen: Instant,
    /// Wall-clock time for display
    pub last_seen_at: DateTime<Utc>,
}

/// Concurrent map of instance id to last activity.
///
/// Each update happens under the owning shard's lock, so a touch that
/// completes before a sweep takes its snapshot is visible to that sweep.
#[derive(Default)]
pub struct ActivityTracker {
    records: DashMap<String, ActivityRecord>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record activity for `id` now
    pub fn touch(&self, id: &str) {
        self.touch_at(id, Instant::now());
    }

    /// Record activity at `now`. The stored time never moves backwards.
    pub fn touch_at(&self, id: &str, now: Instant) {
        let record = ActivityRecord {
            last_seen: now,
            last_seen_at: Utc::now(),
        };
        self.records
            .entry(id.to_string())
            .and_modify(|existing| {
                if record.last_seen >= existing.last_seen {
                    *existing = record;
                }
            })
            .or_insert(record);
    }

    /// Forget `id`; a no-op if it is not tracked
    pub fn remove(&self, id: &str) {
        self.records.remove(id);
    }

    pub fn get(&self, id: &str) -> Option<ActivityRecord> {
        self.records.get(id).map(|r| *r)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Copy of all records, so callers can iterate without holding locks
    pub fn snapshot(&self) -> HashMap<String, ActivityRecord> {
        self.records
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Whether `id` has been idle for at least `threshold` as of `now`.
    /// Untracked ids are not idle; they are handled separately.
    pub fn is_idle(&self, id: &str, now: Instant, threshold: Duration) -> bool {
        self.get(id)
            .map(|r| now.saturating_duration_since(r.last_seen) >= threshold)
            .unwrap_or(false)
    }
}
