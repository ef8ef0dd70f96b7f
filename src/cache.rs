use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use crate::snapshot::{StatField, StatsSnapshot, StatsView};

// Key the pipeline stores its one canonical snapshot under
pub const SYSTEM_STATS_KEY: &str = "system_stats";

// Cache entry with capture timestamp
#[derive(Clone)]
pub struct CacheEntry {
    pub snapshot: Arc<StatsSnapshot>,
    pub captured_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.captured_at) <= ttl
    }
}

/// TTL-bound snapshot store.
///
/// Entries are whole `Arc<StatsSnapshot>` values swapped in under the map's
/// lock, so a reader sees either the previous snapshot or the new one.
pub struct StatCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl StatCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &str, fields: Option<&[StatField]>) -> Option<StatsView> {
        self.get_at(key, fields, Instant::now())
    }

    /// Fresh snapshot for `key`, projected to `fields` when given.
    ///
    /// Stale and absent entries are both a miss. A zero TTL always misses.
    pub fn get_at(
        &self,
        key: &str,
        fields: Option<&[StatField]>,
        now: Instant,
    ) -> Option<StatsView> {
        if self.ttl.is_zero() {
            return None;
        }

        // clone the Arc out so projection happens outside the shard lock
        let snapshot = {
            let entry = self.entries.get(key)?;
            if !entry.is_fresh(now, self.ttl) {
                return None;
            }
            Arc::clone(&entry.snapshot)
        };

        Some(StatsView::of(snapshot, fields))
    }

    pub fn set(&self, key: &str, snapshot: Arc<StatsSnapshot>) {
        self.set_at(key, snapshot, Instant::now());
    }

    pub fn set_at(&self, key: &str, snapshot: Arc<StatsSnapshot>, now: Instant) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                snapshot,
                captured_at: now,
            },
        );
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
