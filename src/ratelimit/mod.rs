//! Rate limiting logic and the storage it runs on.

mod key;
mod limiter;
mod memory;
mod policy;
mod redis_storage;
mod storage;

pub use key::{RateKey, IP_NAMESPACE, TOKEN_NAMESPACE};
pub use limiter::{Decision, RateLimiter};
pub use memory::MemoryStorage;
pub use policy::{Policy, PolicyTable, MAX_DURATION};
pub use redis_storage::RedisStorage;
pub use storage::{BlockStatus, RateStorage};
