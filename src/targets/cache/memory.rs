//! In-process key-value cache

use super::CacheStore;
use crate::error::{ProjectionError, ProjectionResult};
use crate::targets::glob_match;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
enum Entry {
    Text(String),
    Set(BTreeSet<String>),
    /// member → score
    Sorted(BTreeMap<String, f64>),
}

fn wrong_type(key: &str) -> ProjectionError {
    ProjectionError::WriteRejected(format!(
        "WRONGTYPE key '{}' holds the wrong kind of value",
        key
    ))
}

/// Cache held in memory
pub struct MemoryCache {
    entries: RwLock<BTreeMap<String, Entry>>,
    available: AtomicBool,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    #[cfg(test)]
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Store a raw string, as another writer sharing the cache would
    #[cfg(test)]
    pub async fn set_raw(&self, key: &str, value: &str) {
        self.entries
            .write()
            .await
            .insert(key.to_string(), Entry::Text(value.to_string()));
    }

    #[cfg(test)]
    pub async fn key_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// sha256 over every key and its contents
    #[cfg(test)]
    pub async fn fingerprint(&self) -> String {
        let entries = self.entries.read().await;
        let lines = entries.iter().map(|(key, entry)| match entry {
            Entry::Text(v) => format!("text|{}|{}", key, v),
            Entry::Set(members) => format!(
                "set|{}|{}",
                key,
                members.iter().cloned().collect::<Vec<_>>().join(",")
            ),
            Entry::Sorted(members) => {
                let mut ordered: Vec<(&String, &f64)> = members.iter().collect();
                ordered.sort_by(|a, b| a.1.total_cmp(b.1).then_with(|| a.0.cmp(b.0)));
                format!(
                    "zset|{}|{}",
                    key,
                    ordered
                        .iter()
                        .map(|(m, s)| format!("{}@{}", m, s))
                        .collect::<Vec<_>>()
                        .join(",")
                )
            }
        });
        crate::targets::fingerprint_lines(lines)
    }

    fn check_available(&self) -> ProjectionResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProjectionError::TargetUnavailable(
                "in-memory cache is offline".to_string(),
            ))
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    fn describe(&self) -> String {
        "memory cache".to_string()
    }

    async fn ping(&self) -> ProjectionResult<()> {
        self.check_available()
    }

    async fn set_json(&self, key: &str, value: &Value) -> ProjectionResult<()> {
        self.check_available()?;
        self.entries
            .write()
            .await
            .insert(key.to_string(), Entry::Text(value.to_string()));
        Ok(())
    }

    async fn get_json(&self, key: &str) -> ProjectionResult<Option<Value>> {
        self.check_available()?;
        match self.entries.read().await.get(key) {
            None => Ok(None),
            Some(Entry::Text(raw)) => serde_json::from_str(raw).map(Some).map_err(|e| {
                ProjectionError::TargetUnavailable(format!("key '{}' is not JSON: {}", key, e))
            }),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set_add(&self, key: &str, members: &[String]) -> ProjectionResult<u64> {
        self.check_available()?;
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Set(BTreeSet::new()));
        match entry {
            Entry::Set(set) => Ok(members.iter().filter(|m| set.insert((*m).clone())).count() as u64),
            _ => Err(wrong_type(key)),
        }
    }

    async fn set_members(&self, key: &str) -> ProjectionResult<Vec<String>> {
        self.check_available()?;
        match self.entries.read().await.get(key) {
            None => Ok(Vec::new()),
            Some(Entry::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn sorted_add(&self, key: &str, score: f64, member: &str) -> ProjectionResult<()> {
        self.check_available()?;
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Sorted(BTreeMap::new()));
        match entry {
            Entry::Sorted(members) => {
                members.insert(member.to_string(), score);
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn sorted_range(&self, key: &str, min: f64, max: f64) -> ProjectionResult<Vec<(String, f64)>> {
        self.check_available()?;
        match self.entries.read().await.get(key) {
            None => Ok(Vec::new()),
            Some(Entry::Sorted(members)) => {
                let mut range: Vec<(String, f64)> = members
                    .iter()
                    .filter(|(_, s)| **s >= min && **s <= max)
                    .map(|(m, s)| (m.clone(), *s))
                    .collect();
                range.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                Ok(range)
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn scan(&self, pattern: &str) -> ProjectionResult<Vec<String>> {
        self.check_available()?;
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect())
    }

    async fn delete(&self, keys: &[String]) -> ProjectionResult<u64> {
        self.check_available()?;
        let mut entries = self.entries.write().await;
        Ok(keys.iter().filter(|k| entries.remove(*k).is_some()).count() as u64)
    }

    async fn exists(&self, key: &str) -> ProjectionResult<bool> {
        self.check_available()?;
        Ok(self.entries.read().await.contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_sorted_range_is_inclusive_and_ordered() {
        let cache = MemoryCache::new();
        cache.sorted_add("student:1:visits", 300.0, "c").await.unwrap();
        cache.sorted_add("student:1:visits", 100.0, "a").await.unwrap();
        cache.sorted_add("student:1:visits", 200.0, "b").await.unwrap();

        let range = cache.sorted_range("student:1:visits", 100.0, 200.0).await.unwrap();
        assert_eq!(range, vec![("a".to_string(), 100.0), ("b".to_string(), 200.0)]);
    }

    #[tokio::test]
    async fn test_wrong_type_is_rejected() {
        let cache = MemoryCache::new();
        cache.set_json("students:all", &json!({})).await.unwrap();
        let result = cache.set_add("students:all", &["1".to_string()]).await;
        assert!(matches!(result, Err(ProjectionError::WriteRejected(_))));
    }

    #[tokio::test]
    async fn test_scan_and_delete() {
        let cache = MemoryCache::new();
        cache.set_json("student:1", &json!({"id": 1})).await.unwrap();
        cache.set_json("student:2", &json!({"id": 2})).await.unwrap();
        cache.set_add("students:all", &["1".to_string(), "2".to_string()]).await.unwrap();

        let keys = cache.scan("student:*").await.unwrap();
        assert_eq!(keys, vec!["student:1", "student:2"]);
        assert_eq!(cache.delete(&keys).await.unwrap(), 2);
        assert_eq!(cache.key_count().await, 1);
    }

    #[tokio::test]
    async fn test_set_add_counts_new_members() {
        let cache = MemoryCache::new();
        let members = vec!["1".to_string(), "2".to_string()];
        assert_eq!(cache.set_add("group:1:students", &members).await.unwrap(), 2);
        assert_eq!(cache.set_add("group:1:students", &members).await.unwrap(), 0);
    }
}
