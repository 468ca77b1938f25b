//! In-process document store

use super::{values_at, CollectionInventory, DocumentStore, IndexSpec};
use crate::error::{ProjectionError, ProjectionResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Collection {
    documents: Vec<Value>,
    indexes: BTreeMap<String, IndexSpec>,
}

impl Collection {
    /// First unique index the document would violate
    fn violation(&self, document: &Value) -> Option<String> {
        self.indexes.values().filter(|i| i.unique).find_map(|index| {
            let incoming = values_at(document, &index.path);
            let clash = self.documents.iter().any(|existing| {
                values_at(existing, &index.path)
                    .iter()
                    .any(|v| incoming.contains(v))
            });
            clash.then(|| index.name.clone())
        })
    }
}

/// Document store held in memory
pub struct MemoryDocuments {
    collections: RwLock<BTreeMap<String, Collection>>,
    available: AtomicBool,
    /// Index builds fail as if the server dropped the connection
    index_outage: AtomicBool,
}

impl Default for MemoryDocuments {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocuments {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
            index_outage: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn fail_index_builds(&self) {
        self.index_outage.store(true, Ordering::SeqCst);
    }

    /// sha256 over every collection, document and index
    #[cfg(test)]
    pub async fn fingerprint(&self) -> String {
        let collections = self.collections.read().await;
        let mut lines = Vec::new();
        for (name, collection) in collections.iter() {
            lines.push(format!("collection|{}", name));
            lines.extend(collection.documents.iter().map(|d| format!("doc|{}", d)));
            lines.extend(collection.indexes.values().map(|i| {
                format!("index|{}|{}|{}", i.name, i.path, i.unique)
            }));
        }
        crate::targets::fingerprint_lines(lines)
    }

    fn check_available(&self) -> ProjectionResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProjectionError::TargetUnavailable(
                "in-memory document store is offline".to_string(),
            ))
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocuments {
    fn describe(&self) -> String {
        "memory documents".to_string()
    }

    async fn ping(&self) -> ProjectionResult<()> {
        self.check_available()
    }

    async fn drop_collection(&self, collection: &str) -> ProjectionResult<bool> {
        self.check_available()?;
        Ok(self.collections.write().await.remove(collection).is_some())
    }

    async fn create_collection(&self, collection: &str) -> ProjectionResult<()> {
        self.check_available()?;
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default();
        Ok(())
    }

    async fn insert(&self, collection: &str, document: &Value) -> ProjectionResult<()> {
        self.check_available()?;
        let mut collections = self.collections.write().await;
        let target = collections.entry(collection.to_string()).or_default();

        if let Some(index) = target.violation(document) {
            return Err(ProjectionError::WriteRejected(format!(
                "duplicate key on index '{}' in '{}'",
                index, collection
            )));
        }
        target.documents.push(document.clone());
        Ok(())
    }

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> ProjectionResult<()> {
        self.check_available()?;
        if self.index_outage.load(Ordering::SeqCst) {
            return Err(ProjectionError::TargetUnavailable(format!(
                "connection lost while building index '{}'",
                index.name
            )));
        }
        let mut collections = self.collections.write().await;
        let target = collections.entry(collection.to_string()).or_default();

        if index.unique {
            let mut seen = Vec::new();
            for document in &target.documents {
                for value in values_at(document, &index.path) {
                    if seen.contains(&value) {
                        return Err(ProjectionError::ConstraintUnsupported(format!(
                            "unique index '{}' conflicts with existing value {}",
                            index.name, value
                        )));
                    }
                    seen.push(value);
                }
            }
        }

        target.indexes.insert(index.name.clone(), index.clone());
        Ok(())
    }

    async fn delete_all(&self, collection: &str) -> ProjectionResult<u64> {
        self.check_available()?;
        let mut collections = self.collections.write().await;
        Ok(collections
            .get_mut(collection)
            .map(|c| std::mem::take(&mut c.documents).len() as u64)
            .unwrap_or(0))
    }

    async fn inventory(&self, collection: &str) -> ProjectionResult<CollectionInventory> {
        self.check_available()?;
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|c| CollectionInventory {
                exists: true,
                documents: c.documents.len() as u64,
                indexes: c.indexes.keys().cloned().collect(),
            })
            .unwrap_or_default())
    }

    async fn find_all(&self, collection: &str) -> ProjectionResult<Vec<Value>> {
        self.check_available()?;
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|c| c.documents.clone())
            .unwrap_or_default())
    }

    async fn find(&self, collection: &str, path: &str, value: &Value) -> ProjectionResult<Vec<Value>> {
        self.check_available()?;
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|c| {
                c.documents
                    .iter()
                    .filter(|d| values_at(d, path).contains(&value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_unique_index_rejects_duplicates() {
        let store = MemoryDocuments::new();
        store.create_collection("groups").await.unwrap();
        store
            .create_index("groups", &IndexSpec::new("groups_id", "id", true))
            .await
            .unwrap();

        store.insert("groups", &json!({"id": 1})).await.unwrap();
        assert!(matches!(
            store.insert("groups", &json!({"id": 1})).await,
            Err(ProjectionError::WriteRejected(_))
        ));
        assert_eq!(store.inventory("groups").await.unwrap().documents, 1);
    }

    #[tokio::test]
    async fn test_unique_index_over_duplicates_is_refused() {
        let store = MemoryDocuments::new();
        store.insert("groups", &json!({"id": 1})).await.unwrap();
        store.insert("groups", &json!({"id": 1})).await.unwrap();

        let result = store
            .create_index("groups", &IndexSpec::new("groups_id", "id", true))
            .await;
        assert!(matches!(result, Err(ProjectionError::ConstraintUnsupported(_))));
    }

    #[tokio::test]
    async fn test_find_by_embedded_path() {
        let store = MemoryDocuments::new();
        store
            .insert("groups", &json!({"id": 1, "students": [{"id": 10}, {"id": 11}]}))
            .await
            .unwrap();
        store
            .insert("groups", &json!({"id": 2, "students": [{"id": 12}]}))
            .await
            .unwrap();

        let found = store.find("groups", "students.id", &json!(11)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["id"], json!(1));
    }

    #[tokio::test]
    async fn test_delete_all_keeps_indexes() {
        let store = MemoryDocuments::new();
        store.insert("groups", &json!({"id": 1, "name": "A"})).await.unwrap();
        store
            .create_index("groups", &IndexSpec::new("groups_name", "name", false))
            .await
            .unwrap();

        assert_eq!(store.delete_all("groups").await.unwrap(), 1);
        let inventory = store.inventory("groups").await.unwrap();
        assert!(inventory.exists);
        assert_eq!(inventory.documents, 0);
        assert_eq!(inventory.indexes, vec!["groups_name".to_string()]);
    }
}
