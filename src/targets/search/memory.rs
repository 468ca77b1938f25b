//! In-process search index with tokenized, weighted matching
//!
//! Writes land in a pending buffer and only become searchable after
//! `refresh`, like a near-real-time engine.

use super::{IndexDefinition, IndexInventory, SearchHit, SearchStore};
use crate::error::{ProjectionError, ProjectionResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Fields stamped at build time, left out of fingerprints
const BUILD_TIME_FIELDS: &[&str] = &["created_at"];

const RUSSIAN_STOP_WORDS: &[&str] = &[
    "и", "в", "во", "не", "что", "он", "на", "я", "с", "со", "как", "а", "то", "все", "она", "так",
    "его", "но", "да", "ты", "к", "у", "же", "вы", "за", "бы", "по", "только", "ее", "мне", "было",
    "вот", "от", "меня", "еще", "нет", "о", "из", "ему", "для", "при", "это",
];

const ENGLISH_STOP_WORDS: &[&str] = &[
    "a", "an", "and", "the", "of", "to", "in", "on", "for", "with", "is", "are", "by", "at",
];

// Longest first
const RUSSIAN_ENDINGS: &[&str] = &[
    "ыми", "ими", "ого", "его", "ому", "ему", "ая", "яя", "ое", "ее", "ые", "ие", "ый", "ий", "ой",
    "ам", "ям", "ах", "ях", "ом", "ем", "ов", "ев", "ей", "ия", "ии", "ию", "а", "я", "о", "е", "ы",
    "и", "у", "ю", "ь",
];

const ENGLISH_ENDINGS: &[&str] = &["ing", "ed", "es", "s"];

/// Lowercase, split on non-alphanumerics, drop stop words, strip one ending
pub fn analyze(text: &str, language: &str) -> Vec<String> {
    let (stop, endings): (&[&str], &[&str]) = match language {
        "english" => (ENGLISH_STOP_WORDS, ENGLISH_ENDINGS),
        _ => (RUSSIAN_STOP_WORDS, RUSSIAN_ENDINGS),
    };

    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty() && !stop.contains(t))
        .map(|token| {
            let chars = token.chars().count();
            endings
                .iter()
                .find(|e| token.ends_with(*e) && chars - e.chars().count() >= 3)
                .map(|e| token[..token.len() - e.len()].to_string())
                .unwrap_or_else(|| token.to_string())
        })
        .collect()
}

#[derive(Debug, Default)]
struct MemoryIndex {
    definition: Option<IndexDefinition>,
    visible: BTreeMap<String, Value>,
    pending: BTreeMap<String, Value>,
}

/// Search engine held in memory
pub struct MemorySearch {
    indexes: RwLock<BTreeMap<String, MemoryIndex>>,
    rejected: RwLock<BTreeSet<String>>,
    available: AtomicBool,
    mappings_supported: bool,
}

impl Default for MemorySearch {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySearch {
    pub fn new() -> Self {
        Self {
            indexes: RwLock::new(BTreeMap::new()),
            rejected: RwLock::new(BTreeSet::new()),
            available: AtomicBool::new(true),
            mappings_supported: true,
        }
    }

    /// An engine that refuses custom analyzers and mappings
    #[cfg(test)]
    pub fn without_mappings() -> Self {
        Self {
            mappings_supported: false,
            ..Self::new()
        }
    }

    #[cfg(test)]
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Refuse every future write of this document id
    #[cfg(test)]
    pub async fn reject_id(&self, id: &str) {
        self.rejected.write().await.insert(id.to_string());
    }

    /// sha256 over definitions and visible documents, minus build-time fields
    #[cfg(test)]
    pub async fn fingerprint(&self) -> String {
        let indexes = self.indexes.read().await;
        let mut lines = Vec::new();
        for (name, index) in indexes.iter() {
            let definition = index
                .definition
                .as_ref()
                .and_then(|d| serde_json::to_string(d).ok())
                .unwrap_or_default();
            lines.push(format!("index|{}|{}", name, definition));
            for (id, document) in &index.visible {
                let mut stable = document.clone();
                if let Value::Object(map) = &mut stable {
                    for field in BUILD_TIME_FIELDS {
                        map.remove(*field);
                    }
                }
                lines.push(format!("doc|{}|{}", id, stable));
            }
        }
        crate::targets::fingerprint_lines(lines)
    }

    fn check_available(&self) -> ProjectionResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProjectionError::TargetUnavailable(
                "in-memory search engine is offline".to_string(),
            ))
        }
    }
}

#[async_trait]
impl SearchStore for MemorySearch {
    fn describe(&self) -> String {
        "memory search".to_string()
    }

    async fn ping(&self) -> ProjectionResult<()> {
        self.check_available()
    }

    async fn delete_index(&self, index: &str) -> ProjectionResult<bool> {
        self.check_available()?;
        Ok(self.indexes.write().await.remove(index).is_some())
    }

    async fn create_index(&self, index: &str, definition: &IndexDefinition) -> ProjectionResult<()> {
        self.check_available()?;
        if !self.mappings_supported {
            return Err(ProjectionError::ConstraintUnsupported(format!(
                "custom analyzer for '{}' rejected",
                definition.language
            )));
        }
        let mut indexes = self.indexes.write().await;
        if indexes.contains_key(index) {
            return Err(ProjectionError::ConstraintUnsupported(format!(
                "index '{}' already exists",
                index
            )));
        }
        indexes.insert(
            index.to_string(),
            MemoryIndex {
                definition: Some(definition.clone()),
                ..MemoryIndex::default()
            },
        );
        Ok(())
    }

    async fn create_plain_index(&self, index: &str) -> ProjectionResult<()> {
        self.check_available()?;
        self.indexes
            .write()
            .await
            .entry(index.to_string())
            .or_default();
        Ok(())
    }

    async fn index_document(&self, index: &str, id: &str, document: &Value) -> ProjectionResult<()> {
        self.check_available()?;
        if !document.is_object() {
            return Err(ProjectionError::WriteRejected(format!(
                "document {} is not an object",
                id
            )));
        }
        if self.rejected.read().await.contains(id) {
            return Err(ProjectionError::WriteRejected(format!(
                "document {} failed to parse",
                id
            )));
        }
        self.indexes
            .write()
            .await
            .entry(index.to_string())
            .or_default()
            .pending
            .insert(id.to_string(), document.clone());
        Ok(())
    }

    async fn refresh(&self, index: &str) -> ProjectionResult<()> {
        self.check_available()?;
        let mut indexes = self.indexes.write().await;
        let target = indexes.get_mut(index).ok_or_else(|| {
            ProjectionError::TargetUnavailable(format!("no such index '{}'", index))
        })?;
        let pending = std::mem::take(&mut target.pending);
        target.visible.extend(pending);
        Ok(())
    }

    async fn delete_all_documents(&self, index: &str) -> ProjectionResult<u64> {
        self.check_available()?;
        let mut indexes = self.indexes.write().await;
        Ok(indexes
            .get_mut(index)
            .map(|i| {
                i.pending.clear();
                std::mem::take(&mut i.visible).len() as u64
            })
            .unwrap_or(0))
    }

    async fn inventory(&self, index: &str) -> ProjectionResult<IndexInventory> {
        self.check_available()?;
        let indexes = self.indexes.read().await;
        Ok(indexes
            .get(index)
            .map(|i| IndexInventory {
                exists: true,
                documents: i.visible.len() as u64,
                fields: i
                    .definition
                    .as_ref()
                    .map(|d| d.fields.iter().map(|f| f.name.clone()).collect())
                    .unwrap_or_default(),
            })
            .unwrap_or_default())
    }

    async fn search(
        &self,
        index: &str,
        definition: &IndexDefinition,
        query: &str,
        size: usize,
    ) -> ProjectionResult<Vec<SearchHit>> {
        self.check_available()?;
        let terms = analyze(query, &definition.language);
        let indexes = self.indexes.read().await;
        let Some(target) = indexes.get(index) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<SearchHit> = target
            .visible
            .iter()
            .filter_map(|(id, document)| {
                let score: f64 = definition
                    .text_fields()
                    .map(|field| {
                        let tokens = document
                            .get(&field.name)
                            .and_then(Value::as_str)
                            .map(|text| analyze(text, &definition.language))
                            .unwrap_or_default();
                        let matches = terms.iter().filter(|t| tokens.contains(t)).count();
                        f64::from(field.weight) * matches as f64
                    })
                    .sum();
                (score > 0.0).then(|| SearchHit {
                    id: id.clone(),
                    score,
                    source: document.clone(),
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(size);
        Ok(hits)
    }
}
