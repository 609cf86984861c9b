//! In-memory storage backend.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::clock::{add_duration, Clock, SystemClock};
use crate::error::StorageError;

use super::key::RateKey;
use super::storage::{BlockStatus, RateStorage};

/// A fixed-window counter and the instant it lapses.
#[derive(Debug, Clone, Copy)]
struct CounterRecord {
    count: u64,
    expires_at: DateTime<Utc>,
}

impl CounterRecord {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Process-local storage backed by concurrent maps.
///
/// Each key lives in one map shard, and increment runs entirely under that
/// shard's lock, so concurrent increments on a key never lose updates and
/// requests for unrelated keys rarely contend. Expired records are ignored on
/// read and physically removed by [`purge_expired`](Self::purge_expired).
#[derive(Debug)]
pub struct MemoryStorage {
    counters: DashMap<RateKey, CounterRecord>,
    blocks: DashMap<RateKey, DateTime<Utc>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStorage {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            blocks: DashMap::new(),
            clock,
        }
    }

    /// Drop every counter and block marker that has expired.
    pub fn purge_expired(&self) {
        let now = self.clock.now();

        self.counters.retain(|_, record| record.is_live(now));
        self.blocks.retain(|_, until| now < *until);

        debug!(
            counters = self.counters.len(),
            blocks = self.blocks.len(),
            "memory storage cleanup complete"
        );
    }

    /// Spawn a task that calls [`purge_expired`](Self::purge_expired) every
    /// `interval`. The task ends once the store is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => store.purge_expired(),
                    None => break,
                }
                trace!("memory storage cleanup tick completed");
            }
        })
    }

    /// Number of counter records held, live or not.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    /// Number of block records held, live or not.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateStorage for MemoryStorage {
    async fn increment(&self, key: &RateKey, window: Duration) -> Result<u64, StorageError> {
        let now = self.clock.now();
        let expires_at = add_duration(now, window);

        let mut entry = self
            .counters
            .entry(key.clone())
            .or_insert(CounterRecord { count: 0, expires_at });
        let record = entry.value_mut();

        if !record.is_live(now) {
            record.count = 0;
        }
        record.count = record.count.saturating_add(1);
        record.expires_at = expires_at;

        Ok(record.count)
    }

    async fn get_count(&self, key: &RateKey) -> Result<u64, StorageError> {
        let now = self.clock.now();

        Ok(self
            .counters
            .get(key)
            .filter(|record| record.is_live(now))
            .map(|record| record.count)
            .unwrap_or(0))
    }

    async fn block(&self, key: &RateKey, duration: Duration) -> Result<DateTime<Utc>, StorageError> {
        let until = add_duration(self.clock.now(), duration);
        self.blocks.insert(key.clone(), until);
        Ok(until)
    }

    async fn is_blocked(&self, key: &RateKey) -> Result<BlockStatus, StorageError> {
        let now = self.clock.now();

        Ok(match self.blocks.get(key).map(|until| *until) {
            Some(until) if now < until => BlockStatus::Blocked { until },
            _ => BlockStatus::Clear,
        })
    }

    async fn reset(&self, key: &RateKey) -> Result<(), StorageError> {
        self.counters.remove(key);
        self.blocks.remove(key);
        Ok(())
    }
}
