//! Event storage contract and the in-memory reference backend.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::trace;

use super::clock::{Clock, SystemClock};
use crate::error::Result;

/// Storage backend for timestamped throttling events.
///
/// Implementations must be safe to call concurrently from many request
/// handlers, for the same key as well as for different keys. Callers never
/// add locking of their own.
#[async_trait]
pub trait EventStore: Send + Sync + Debug {
    /// Append one event to the key's log, creating the log if needed.
    async fn append_event(&self, key: &str, at: Instant) -> Result<()>;

    /// Count the key's events strictly after `now - window`, with `now`
    /// read at call time. Unknown keys count zero.
    async fn events_in_duration(&self, key: &str, window: Duration) -> Result<u64>;

    /// Evict the key's events strictly older than `cutoff`. Events at or
    /// after the cutoff keep their relative order.
    async fn clean(&self, key: &str, cutoff: Instant) -> Result<()>;
}

/// Count events strictly after `now - window`.
pub(crate) fn count_in_window(log: &[Instant], now: Instant, window: Duration) -> u64 {
    match now.checked_sub(window) {
        Some(start) => log.iter().filter(|t| **t > start).count() as u64,
        // Window reaches back past anything the clock can represent.
        None => log.len() as u64,
    }
}

/// Drop every event strictly older than `cutoff`.
///
/// Timestamps are taken before the store lock, so concurrent appends can land
/// slightly out of order; filter instead of truncating a prefix.
pub(crate) fn evict_before(log: &mut Vec<Instant>, cutoff: Instant) -> usize {
    let before = log.len();
    log.retain(|t| *t >= cutoff);
    before - log.len()
}

/// In-memory event store guarded by a single reader/writer lock.
///
/// Every key shares the one lock, so operations on unrelated keys serialize.
/// See [`ShardedEventStore`](super::ShardedEventStore) for per-key locking.
#[derive(Debug)]
pub struct MemoryEventStore {
    logs: RwLock<HashMap<String, Vec<Instant>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryEventStore {
    /// Create an empty store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    /// Create an empty store evaluating windows against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Number of keys that currently hold a log.
    pub fn key_count(&self) -> usize {
        self.logs.read().len()
    }

    /// Raw number of retained events for the key, evicted or not yet.
    pub fn log_len(&self, key: &str) -> usize {
        self.logs.read().get(key).map(Vec::len).unwrap_or(0)
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append_event(&self, key: &str, at: Instant) -> Result<()> {
        let mut logs = self.logs.write();
        logs.entry(key.to_string()).or_default().push(at);
        Ok(())
    }

    async fn events_in_duration(&self, key: &str, window: Duration) -> Result<u64> {
        let now = self.clock.now();
        let logs = self.logs.read();
        let count = logs
            .get(key)
            .map(|log| count_in_window(log, now, window))
            .unwrap_or(0);

        trace!(key = %key, window = ?window, count = count, "Counted events in window");
        Ok(count)
    }

    async fn clean(&self, key: &str, cutoff: Instant) -> Result<()> {
        let mut logs = self.logs.write();
        if let Some(log) = logs.get_mut(key) {
            let evicted = evict_before(log, cutoff);
            trace!(key = %key, evicted = evicted, retained = log.len(), "Cleaned event log");
            if log.is_empty() {
                logs.remove(key);
            }
        }
        Ok(())
    }
}
