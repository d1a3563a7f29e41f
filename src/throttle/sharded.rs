//! Event store with per-key locking.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::clock::{Clock, SystemClock};
use super::store::{count_in_window, evict_before, EventStore};
use crate::error::Result;

/// In-memory event store sharded by key.
///
/// Same contract as [`MemoryEventStore`](super::MemoryEventStore), but only
/// operations on keys that hash to the same shard contend with each other.
#[derive(Debug)]
pub struct ShardedEventStore {
    logs: DashMap<String, Vec<Instant>>,
    clock: Arc<dyn Clock>,
}

impl ShardedEventStore {
    /// Create an empty store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    /// Create an empty store evaluating windows against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            logs: DashMap::new(),
            clock,
        }
    }

    /// Number of keys that currently hold a log.
    pub fn key_count(&self) -> usize {
        self.logs.len()
    }

    /// Raw number of retained events for the key.
    pub fn log_len(&self, key: &str) -> usize {
        self.logs.get(key).map(|log| log.len()).unwrap_or(0)
    }
}

impl Default for ShardedEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for ShardedEventStore {
    async fn append_event(&self, key: &str, at: Instant) -> Result<()> {
        self.logs.entry(key.to_string()).or_default().push(at);
        Ok(())
    }

    async fn events_in_duration(&self, key: &str, window: Duration) -> Result<u64> {
        let now = self.clock.now();
        let count = self
            .logs
            .get(key)
            .map(|log| count_in_window(&log, now, window))
            .unwrap_or(0);

        trace!(key = %key, window = ?window, count = count, "Counted events in window");
        Ok(count)
    }

    async fn clean(&self, key: &str, cutoff: Instant) -> Result<()> {
        let emptied = match self.logs.get_mut(key) {
            Some(mut log) => {
                let evicted = evict_before(&mut log, cutoff);
                trace!(key = %key, evicted = evicted, retained = log.len(), "Cleaned event log");
                log.is_empty()
            }
            None => false,
        };

        // The shard guard is released above; an append may have raced in since.
        if emptied {
            self.logs.remove_if(key, |_, log| log.is_empty());
        }
        Ok(())
    }
}
