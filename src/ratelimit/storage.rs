//! Storage trait for abstracting the memory and Redis backends.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;

use super::key::RateKey;

/// Outcome of a block-marker lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// No live block marker.
    Clear,
    /// Denied until the given instant.
    Blocked { until: DateTime<Utc> },
}

impl BlockStatus {
    pub fn is_blocked(&self) -> bool {
        matches!(self, BlockStatus::Blocked { .. })
    }
}

/// Trait for rate limit storage backends.
///
/// Counters and block markers are separate records with independent
/// expiries. Every backend failure must come back as an error; a backend
/// never reports "count 0" or "not blocked" because it could not find out.
#[async_trait]
pub trait RateStorage: Send + Sync {
    /// Add one to the counter for `key` and set its expiry to `window` from
    /// now, as a single atomic step. A missing or expired counter starts at 1.
    ///
    /// Returns the new count.
    async fn increment(&self, key: &RateKey, window: Duration) -> Result<u64, StorageError>;

    /// Current count for `key`, or 0 if there is no live counter.
    async fn get_count(&self, key: &RateKey) -> Result<u64, StorageError>;

    /// Mark `key` blocked for `duration`. The record stores the absolute
    /// expiry instant, which is also returned.
    async fn block(&self, key: &RateKey, duration: Duration) -> Result<DateTime<Utc>, StorageError>;

    /// Whether `key` carries a live block marker.
    ///
    /// A marker whose stored instant is not in the future is reported as
    /// [`BlockStatus::Clear`] even if the backend still holds it.
    async fn is_blocked(&self, key: &RateKey) -> Result<BlockStatus, StorageError>;

    /// Remove both the counter and the block marker for `key`.
    async fn reset(&self, key: &RateKey) -> Result<(), StorageError>;
}
