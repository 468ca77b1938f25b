//! Full-text search target family

mod elastic;
mod memory;

pub use elastic::ElasticSearch;
pub use memory::MemorySearch;

use crate::error::ProjectionResult;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// How a field is stored in the index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    /// Analyzed text, matched by queries with the field's weight
    Text,
    Keyword,
    Date,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    /// Query-time boost, only meaningful for text fields
    pub weight: u32,
}

impl FieldSpec {
    pub fn text(name: &str, weight: u32) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Text,
            weight,
        }
    }

    pub fn keyword(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Keyword,
            weight: 0,
        }
    }

    pub fn date(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Date,
            weight: 0,
        }
    }
}

/// Analyzer language plus the field list of an index
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexDefinition {
    pub language: String,
    pub fields: Vec<FieldSpec>,
}

impl IndexDefinition {
    /// Text fields with their boosts, `name^3` style
    pub fn boosted_fields(&self) -> Vec<String> {
        self.text_fields()
            .map(|f| format!("{}^{}", f.name, f.weight))
            .collect()
    }

    pub fn text_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.kind == FieldKind::Text)
    }
}

/// One ranked result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
    pub source: Value,
}

/// Batch read-back of one index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexInventory {
    pub exists: bool,
    pub documents: u64,
    /// Mapped field names; empty for a mapping-less index
    pub fields: Vec<String>,
}

/// Minimal capability set of a search engine
#[async_trait]
pub trait SearchStore: Send + Sync {
    fn describe(&self) -> String;

    async fn ping(&self) -> ProjectionResult<()>;

    /// `false` when the index did not exist
    async fn delete_index(&self, index: &str) -> ProjectionResult<bool>;

    /// Create an index with analyzers and a field mapping.
    /// `ConstraintUnsupported` when the store rejects the mapping.
    async fn create_index(&self, index: &str, definition: &IndexDefinition) -> ProjectionResult<()>;

    /// Create an index with dynamic mapping only
    async fn create_plain_index(&self, index: &str) -> ProjectionResult<()>;

    /// Index a document under an explicit id, replacing any previous version
    async fn index_document(&self, index: &str, id: &str, document: &Value) -> ProjectionResult<()>;

    /// Make every indexed document visible to search
    async fn refresh(&self, index: &str) -> ProjectionResult<()>;

    async fn delete_all_documents(&self, index: &str) -> ProjectionResult<u64>;

    async fn inventory(&self, index: &str) -> ProjectionResult<IndexInventory>;

    /// Weighted multi-field match over the definition's text fields
    async fn search(
        &self,
        index: &str,
        definition: &IndexDefinition,
        query: &str,
        size: usize,
    ) -> ProjectionResult<Vec<SearchHit>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boosted_fields_skip_keywords() {
        let definition = IndexDefinition {
            language: "russian".to_string(),
            fields: vec![
                FieldSpec::keyword("id"),
                FieldSpec::text("name", 3),
                FieldSpec::text("content", 2),
                FieldSpec::date("created_at"),
            ],
        };
        assert_eq!(definition.boosted_fields(), vec!["name^3", "content^2"]);
    }
}
