//! Key-value cache target family

mod memory;
mod redis;
pub mod resp;

pub use memory::MemoryCache;
pub use redis::RedisCache;

use crate::error::ProjectionResult;
use async_trait::async_trait;
use serde_json::Value;

/// Minimal capability set of a key-value store with sets and sorted sets
#[async_trait]
pub trait CacheStore: Send + Sync {
    fn describe(&self) -> String;

    async fn ping(&self) -> ProjectionResult<()>;

    /// Store a JSON value under a key, replacing what was there
    async fn set_json(&self, key: &str, value: &Value) -> ProjectionResult<()>;

    async fn get_json(&self, key: &str) -> ProjectionResult<Option<Value>>;

    /// Add members to a set; returns how many were new
    async fn set_add(&self, key: &str, members: &[String]) -> ProjectionResult<u64>;

    /// Members of a set, sorted
    async fn set_members(&self, key: &str) -> ProjectionResult<Vec<String>>;

    /// Add or re-score one member of a sorted set
    async fn sorted_add(&self, key: &str, score: f64, member: &str) -> ProjectionResult<()>;

    /// Members with `min <= score <= max`, ascending by score
    async fn sorted_range(&self, key: &str, min: f64, max: f64) -> ProjectionResult<Vec<(String, f64)>>;

    /// Every key matching a glob pattern, sorted
    async fn scan(&self, pattern: &str) -> ProjectionResult<Vec<String>>;

    /// Delete keys; returns how many existed
    async fn delete(&self, keys: &[String]) -> ProjectionResult<u64>;

    async fn exists(&self, key: &str) -> ProjectionResult<bool>;
}
