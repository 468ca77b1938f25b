//! Document target family

mod memory;
mod postgres;

pub use memory::MemoryDocuments;
pub use postgres::PgDocuments;

use crate::error::ProjectionResult;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// A secondary index over a dotted document path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexSpec {
    pub name: String,
    /// Dotted path, descending into arrays (`students.id`)
    pub path: String,
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, path: impl Into<String>, unique: bool) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            unique,
        }
    }
}

/// Batch read-back of one collection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionInventory {
    pub exists: bool,
    pub documents: u64,
    pub indexes: Vec<String>,
}

/// Minimal capability set of a document store
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn describe(&self) -> String;

    async fn ping(&self) -> ProjectionResult<()>;

    /// Drop a collection with its indexes; `false` when it did not exist
    async fn drop_collection(&self, collection: &str) -> ProjectionResult<bool>;

    async fn create_collection(&self, collection: &str) -> ProjectionResult<()>;

    /// Insert one document. `WriteRejected` on a unique index violation.
    async fn insert(&self, collection: &str, document: &Value) -> ProjectionResult<()>;

    /// `ConstraintUnsupported` when the store rejects the declaration
    async fn create_index(&self, collection: &str, index: &IndexSpec) -> ProjectionResult<()>;

    /// Remove every document, keeping the collection and its indexes
    async fn delete_all(&self, collection: &str) -> ProjectionResult<u64>;

    async fn inventory(&self, collection: &str) -> ProjectionResult<CollectionInventory>;

    /// Every document in insertion order
    async fn find_all(&self, collection: &str) -> ProjectionResult<Vec<Value>>;

    /// Documents whose `path` holds `value`, in insertion order
    async fn find(&self, collection: &str, path: &str, value: &Value) -> ProjectionResult<Vec<Value>>;
}

/// Every value found at a dotted path, descending into arrays
pub(crate) fn values_at<'a>(document: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current = vec![document];
    for segment in path.split('.') {
        let mut next = Vec::new();
        for value in current {
            match value {
                Value::Object(map) => {
                    if let Some(v) = map.get(segment) {
                        next.push(v);
                    }
                }
                Value::Array(items) => {
                    next.extend(items.iter().filter_map(|item| item.get(segment)));
                }
                _ => {}
            }
        }
        current = next;
    }

    // A path ending on an array yields its elements
    current
        .into_iter()
        .flat_map(|v| match v {
            Value::Array(items) => items.iter().collect::<Vec<_>>(),
            other => vec![other],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_values_at_descends_into_arrays() {
        let doc = json!({
            "id": 1,
            "department": {"name": "D"},
            "students": [{"id": 4}, {"id": 9}]
        });

        assert_eq!(values_at(&doc, "id"), vec![&json!(1)]);
        assert_eq!(values_at(&doc, "department.name"), vec![&json!("D")]);
        assert_eq!(values_at(&doc, "students.id"), vec![&json!(4), &json!(9)]);
        assert!(values_at(&doc, "missing.path").is_empty());
    }
}
