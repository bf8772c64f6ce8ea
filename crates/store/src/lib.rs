// crates/store/src/lib.rs
//! Key-value state store used by the backup API.
//!
//! Provides:
//! - `StateStore`: the async primitives the job subsystem and listing cache need
//! - `RedisStore`: production backend over a Redis connection manager
//! - `MemoryStore`: in-process backend for tests and single-node setups

pub mod error;
pub mod memory;
pub mod redis_store;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use std::time::Duration;

use async_trait::async_trait;

/// Async key-value primitives with per-key expiry.
///
/// Index arguments for list and sorted-set ranges follow Redis semantics:
/// both ends are inclusive and negative values count from the end.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Check that the backend is reachable.
    async fn ping(&self) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set a string value that expires after `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Delete keys of any type. Returns how many existed.
    async fn del(&self, keys: &[String]) -> StoreResult<u64>;

    /// Append to a list, creating it when missing. Returns the new length.
    async fn rpush(&self, key: &str, value: &str) -> StoreResult<u64>;

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>>;

    /// Reset the expiry of an existing key. Returns false when the key is missing.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Add or re-score a sorted-set member.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;

    /// Members by descending score.
    async fn zrevrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>>;

    /// Members with `min <= score <= max`, ascending.
    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>>;

    /// Remove members with `min <= score <= max`. Returns how many were removed.
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> StoreResult<u64>;

    /// Delete every key matching a glob pattern such as `rclone_lsjson:*`.
    async fn delete_matching(&self, pattern: &str) -> StoreResult<u64>;
}

/// Resolve an inclusive Redis-style `[start, stop]` range against a length.
///
/// Returns `None` when the range selects nothing.
pub(crate) fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    if len == 0 {
        return None;
    }
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}
