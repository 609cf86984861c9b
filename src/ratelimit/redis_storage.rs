//! Redis storage backend.
//!
//! Records are plain Redis strings:
//! - `count:<key>` holds the window count, expiring with the window.
//! - `block:<key>` holds the block's end as Unix epoch milliseconds,
//!   expiring with the block.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{info, warn};

use crate::clock::{add_duration, Clock, SystemClock};
use crate::error::StorageError;

use super::key::RateKey;
use super::storage::{BlockStatus, RateStorage};

/// Storage shared through a Redis server.
///
/// The connection manager reconnects on its own; a command issued while the
/// server is down fails with [`StorageError::Unavailable`]. Every command is
/// also bounded by `command_timeout`.
#[derive(Clone)]
pub struct RedisStorage {
    conn: ConnectionManager,
    command_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStorage")
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisStorage {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str, command_timeout: Duration) -> Result<Self, StorageError> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(command_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                StorageError::Unavailable(format!(
                    "connecting to {} timed out after {:?}",
                    url, command_timeout
                ))
            })??;

        info!(url = %url, "Connected to Redis");

        Ok(Self {
            conn,
            command_timeout,
            clock: Arc::new(SystemClock),
        })
    }

    /// Read "now" from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run one Redis round trip under the command timeout.
    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, StorageError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(op, error = %e, "Redis command failed");
                Err(e.into())
            }
            Err(_) => {
                warn!(op, timeout = ?self.command_timeout, "Redis command timed out");
                Err(StorageError::Unavailable(format!(
                    "{} timed out after {:?}",
                    op, self.command_timeout
                )))
            }
        }
    }
}

/// Milliseconds for a PEXPIRE/PX argument. Redis rejects zero.
fn expiry_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX).max(1)
}

/// End of a block starting at `now`, at the millisecond precision it is
/// stored with.
fn block_until(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    let until = add_duration(now, duration);
    DateTime::<Utc>::from_timestamp_millis(until.timestamp_millis()).unwrap_or(until)
}

fn parse_count(record: &str, value: &str) -> Result<u64, StorageError> {
    value.parse::<u64>().map_err(|_| StorageError::MalformedRecord {
        key: record.to_string(),
        value: value.to_string(),
    })
}

fn parse_block_until(record: &str, value: &str) -> Result<DateTime<Utc>, StorageError> {
    value
        .parse::<i64>()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .ok_or_else(|| StorageError::MalformedRecord {
            key: record.to_string(),
            value: value.to_string(),
        })
}

#[async_trait]
impl RateStorage for RedisStorage {
    async fn increment(&self, key: &RateKey, window: Duration) -> Result<u64, StorageError> {
        let record = key.count_record();
        let mut conn = self.conn.clone();

        // MULTI/EXEC: no reader sees the new count without the new expiry.
        let mut pipe = redis::pipe();
        pipe.atomic()
            .incr(&record, 1u64)
            .cmd("PEXPIRE")
            .arg(&record)
            .arg(expiry_millis(window))
            .ignore();

        let (count,): (u64,) = self
            .bounded("increment", pipe.query_async(&mut conn))
            .await?;
        Ok(count)
    }

    async fn get_count(&self, key: &RateKey) -> Result<u64, StorageError> {
        let record = key.count_record();
        let mut conn = self.conn.clone();

        let value: Option<String> = self.bounded("get_count", conn.get(&record)).await?;
        match value {
            Some(value) => parse_count(&record, &value),
            None => Ok(0),
        }
    }

    async fn block(&self, key: &RateKey, duration: Duration) -> Result<DateTime<Utc>, StorageError> {
        let record = key.block_record();
        let until = block_until(self.clock.now(), duration);
        let mut conn = self.conn.clone();

        let mut cmd = redis::cmd("SET");
        cmd.arg(&record)
            .arg(until.timestamp_millis())
            .arg("PX")
            .arg(expiry_millis(duration));

        let _: () = self.bounded("block", cmd.query_async(&mut conn)).await?;
        Ok(until)
    }

    async fn is_blocked(&self, key: &RateKey) -> Result<BlockStatus, StorageError> {
        let record = key.block_record();
        let mut conn = self.conn.clone();

        let value: Option<String> = self.bounded("is_blocked", conn.get(&record)).await?;
        let Some(value) = value else {
            return Ok(BlockStatus::Clear);
        };

        let until = parse_block_until(&record, &value)?;
        // Redis expiry can lag the stored instant; the instant is authoritative.
        if self.clock.now() < until {
            Ok(BlockStatus::Blocked { until })
        } else {
            Ok(BlockStatus::Clear)
        }
    }

    async fn reset(&self, key: &RateKey) -> Result<(), StorageError> {
        let records = [key.count_record(), key.block_record()];
        let mut conn = self.conn.clone();

        let _: () = self.bounded("reset", conn.del(records.as_slice())).await?;
        Ok(())
    }
}
