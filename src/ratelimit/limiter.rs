//! Core rate limiter implementation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use crate::error::StorageError;

use super::key::RateKey;
use super::policy::Policy;
use super::storage::{BlockStatus, RateStorage};

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed.
    Allow,
    /// The key is blocked until the given instant.
    Deny { until: DateTime<Utc> },
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    /// When a denied key becomes eligible again.
    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Decision::Allow => None,
            Decision::Deny { until } => Some(*until),
        }
    }
}

/// Fixed-window limiter with block-on-exceed.
///
/// The limiter keeps no state of its own; every call is evaluated against
/// storage, so one instance can be shared across all request tasks. Time is
/// read by the storage, which stamps block markers and expires records.
pub struct RateLimiter<S: RateStorage> {
    storage: Arc<S>,
}

impl<S: RateStorage> Clone for RateLimiter<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}

impl<S: RateStorage> RateLimiter<S> {
    /// Create a limiter over `storage`.
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Decide whether one request for `key` may proceed under `policy`.
    ///
    /// A live block wins over everything and leaves the counter untouched.
    /// Otherwise the request is counted; the count that first passes
    /// `policy.limit()` blocks the key for `policy.block_duration()`.
    ///
    /// Any storage error is returned as-is and must be treated as a denial.
    pub async fn allow(&self, key: &RateKey, policy: &Policy) -> Result<Decision, StorageError> {
        trace!(key = %key, limit = policy.limit(), "Checking rate limit");

        let status = self.storage.is_blocked(key).await.map_err(|e| {
            warn!(key = %key, error = %e, "Block lookup failed, denying");
            e
        })?;
        if let BlockStatus::Blocked { until } = status {
            debug!(key = %key, until = %until, "Key is blocked");
            return Ok(Decision::Deny { until });
        }

        let count = self
            .storage
            .increment(key, policy.window())
            .await
            .map_err(|e| {
                warn!(key = %key, error = %e, "Increment failed, denying");
                e
            })?;

        if count > policy.limit() {
            // Two racing requests may both get here; the second block write
            // only moves the end by the gap between them.
            // Report the instant storage recorded, so later denials carry
            // the same value.
            let until = self
                .storage
                .block(key, policy.block_duration())
                .await
                .map_err(|e| {
                    warn!(key = %key, error = %e, "Block write failed, denying");
                    e
                })?;

            debug!(
                key = %key,
                count = count,
                limit = policy.limit(),
                until = %until,
                "Rate limit exceeded, key blocked"
            );
            return Ok(Decision::Deny { until });
        }

        Ok(Decision::Allow)
    }

    /// Clear all state for `key`, as if it had never been seen.
    pub async fn reset(&self, key: &RateKey) -> Result<(), StorageError> {
        self.storage.reset(key).await
    }

    /// Get the storage backend.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }
}
