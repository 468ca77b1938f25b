//! Full-text projection: one weighted document per material

use super::{canonical_ids, log_stage, BuildContext, Granularity, ProjectionStats, Projector, TargetInventory};
use crate::error::{ProjectionError, ProjectionResult};
use crate::schema::EntityKind;
use crate::source::{CanonicalRow, Extractor, JoinSpec, Snapshot};
use crate::targets::{FieldSpec, IndexDefinition, SearchHit, SearchStore, TargetKind};
use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

const DOCUMENTS: &str = "documents";

/// Material index layout. The material's own name weighs most, then its
/// content, then the names of its lecture, course and department.
pub fn material_index(language: &str) -> IndexDefinition {
    IndexDefinition {
        language: language.to_string(),
        fields: vec![
            FieldSpec::keyword("id"),
            FieldSpec::text("name", 3),
            FieldSpec::text("content", 2),
            FieldSpec::text("lecture_name", 1),
            FieldSpec::text("course_name", 1),
            FieldSpec::text("department_name", 1),
            FieldSpec::keyword("lecture_id"),
            FieldSpec::keyword("course_id"),
            FieldSpec::keyword("department_id"),
            FieldSpec::date("created_at"),
        ],
    }
}

pub struct SearchProjector {
    store: Arc<dyn SearchStore>,
    index: String,
    definition: IndexDefinition,
}

impl SearchProjector {
    pub fn new(store: Arc<dyn SearchStore>, index: impl Into<String>, language: &str) -> Self {
        Self {
            store,
            index: index.into(),
            definition: material_index(language),
        }
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    /// Weighted match over every text field
    pub async fn search(&self, query: &str, size: usize) -> ProjectionResult<Vec<SearchHit>> {
        self.store.search(&self.index, &self.definition, query, size).await
    }

    fn document(row: &CanonicalRow, ctx: &BuildContext) -> ProjectionResult<Value> {
        let name = row.text("name")?.unwrap_or_default();
        let content = match row.text("content")? {
            Some(content) => content.to_string(),
            None => format!("Material {}", name),
        };

        Ok(json!({
            "id": row.id,
            "name": name,
            "content": content,
            "lecture_name": row.value("lecture_name")?,
            "course_name": row.value("course_name")?,
            "department_name": row.value("department_name")?,
            "lecture_id": row.value("lecture_id")?,
            "course_id": row.value("course_id")?,
            "department_id": row.value("department_id")?,
            "created_at": ctx.started_at.timestamp(),
        }))
    }

    async fn project(&self, snapshot: &Snapshot<'_>, ctx: &BuildContext, stats: &mut ProjectionStats) -> ProjectionResult<()> {
        ctx.check("search index")?;
        log_stage(TargetKind::Search, "index");
        if self.store.delete_index(&self.index).await? {
            stats.removed += 1;
        }
        match self.store.create_index(&self.index, &self.definition).await {
            Ok(()) => {}
            Err(e) if e.is_degradable() => {
                warn!(index = %self.index, error = %e, "Falling back to an index without mappings");
                stats.warnings.push(e);
                self.store.create_plain_index(&self.index).await?;
            }
            Err(e) => return Err(e),
        }

        ctx.check("search documents")?;
        log_stage(TargetKind::Search, "documents");
        let mut unresolved = canonical_ids(snapshot, EntityKind::Material).await?;
        let rows = snapshot.rows(
            JoinSpec::of(EntityKind::Material)
                .up(EntityKind::Lecture)
                .up(EntityKind::Course)
                .up(EntityKind::Department),
        )?;
        let mut stream = rows.stream();
        while let Some(row) = stream.try_next().await? {
            stats.extracted(EntityKind::Material);
            unresolved.remove(&row.id);
            let document = Self::document(&row, ctx)?;
            let written = self
                .store
                .index_document(&self.index, &row.id.to_string(), &document)
                .await;
            stats.absorb(DOCUMENTS, written)?;
        }
        for id in unresolved {
            stats.gap(EntityKind::Material, id, "does not resolve to a lecture, course and department");
        }

        ctx.check("search refresh")?;
        self.store.refresh(&self.index).await?;

        info!(
            index = %self.index,
            count = stats.written.get(DOCUMENTS).copied().unwrap_or(0),
            skipped = stats.skipped,
            "Indexed materials"
        );
        Ok(())
    }
}

#[async_trait]
impl Projector for SearchProjector {
    fn target(&self) -> TargetKind {
        TargetKind::Search
    }

    fn describe(&self) -> String {
        self.store.describe()
    }

    async fn ping(&self) -> ProjectionResult<()> {
        self.store.ping().await
    }

    async fn build(&self, extractor: &Extractor, ctx: &BuildContext, stats: &mut ProjectionStats) -> ProjectionResult<()> {
        let snapshot = extractor.snapshot().await?;
        let result = self.project(&snapshot, ctx, stats).await;
        snapshot.close().await;
        result
    }

    async fn inventory(&self) -> ProjectionResult<TargetInventory> {
        let inventory = self.store.inventory(&self.index).await?;
        Ok(TargetInventory {
            target: TargetKind::Search,
            units: inventory.documents,
            structures: if inventory.exists {
                vec![self.index.clone()]
            } else {
                Vec::new()
            },
            detail: serde_json::to_value(&inventory).unwrap_or_default(),
        })
    }

    async fn teardown(&self, granularity: Granularity, ctx: &BuildContext, stats: &mut ProjectionStats) -> ProjectionResult<()> {
        ctx.check("search teardown")?;

        match granularity {
            Granularity::Data => {
                stats.removed += self.store.delete_all_documents(&self.index).await?;
            }
            Granularity::Structure => {
                let documents = self.store.inventory(&self.index).await?.documents;
                if self.store.delete_index(&self.index).await? {
                    stats.removed += documents;
                } else {
                    return Err(ProjectionError::TargetUnavailable(format!(
                        "index '{}' vanished during teardown",
                        self.index
                    )));
                }
            }
        }

        info!(index = %self.index, removed = stats.removed, granularity = ?granularity, "Cleared search index");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::CancelToken;
    use crate::projection::fixtures;
    use crate::targets::MemorySearch;
    use pretty_assertions::assert_eq;

    fn ctx() -> BuildContext {
        BuildContext::new(CancelToken::new())
    }

    #[tokio::test]
    async fn test_materials_are_indexed_and_ranked() {
        let (extractor, _) = fixtures::seeded().await;
        let search = SearchProjector::new(Arc::new(MemorySearch::new()), "materials", "russian");

        let stats = fixtures::build(&search, &extractor, &ctx()).await.unwrap();
        assert_eq!(stats.written.get(DOCUMENTS), Some(&5));
        assert_eq!(search.inventory().await.unwrap().units, 5);

        let hits = search.search("алгоритмы", 10).await.unwrap();
        assert!(!hits.is_empty());
        // The material named after algorithms outranks one that only mentions them
        assert_eq!(hits[0].id, "1");
    }

    #[tokio::test]
    async fn test_rejected_document_is_skipped() {
        let (extractor, _) = fixtures::seeded().await;
        let store = Arc::new(MemorySearch::new());
        store.reject_id("3").await;
        let search = SearchProjector::new(store, "materials", "russian");

        let stats = fixtures::build(&search, &extractor, &ctx()).await.unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.written.get(DOCUMENTS), Some(&4));
        assert!(stats.errors.is_empty());
    }

    #[tokio::test]
    async fn test_material_of_missing_lecture_fails_target() {
        let mut dataset = fixtures::reference();
        dataset.push(
            EntityKind::Material,
            vec![
                ("id_lect", Value::from(99)),
                ("name", Value::from("Сироты")),
                ("content", Value::Null),
            ],
        );
        let (extractor, _) = fixtures::seeded_with(dataset).await;
        let search = SearchProjector::new(Arc::new(MemorySearch::new()), "materials", "russian");

        let stats = fixtures::build(&search, &extractor, &ctx()).await.unwrap();
        assert_eq!(stats.errors.len(), 1);
        assert!(matches!(stats.errors[0], ProjectionError::ReferentialGap(ref m) if m.contains("material row 6")));
        assert_eq!(stats.written.get(DOCUMENTS), Some(&5));
        assert_eq!(search.inventory().await.unwrap().units, 5);
        assert!(search.search("Сироты", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_build() {
        let (extractor, _) = fixtures::seeded().await;
        let store = Arc::new(MemorySearch::new());
        store.set_available(false);
        let search = SearchProjector::new(store, "materials", "russian");

        let result = fixtures::build(&search, &extractor, &ctx()).await;
        assert!(matches!(result, Err(ProjectionError::TargetUnavailable(_))));
    }

    #[tokio::test]
    async fn test_rejected_mapping_degrades() {
        let (extractor, _) = fixtures::seeded().await;
        let search = SearchProjector::new(Arc::new(MemorySearch::without_mappings()), "materials", "russian");

        let stats = fixtures::build(&search, &extractor, &ctx()).await.unwrap();
        assert_eq!(stats.warnings.len(), 1);
        assert_eq!(search.inventory().await.unwrap().units, 5);
    }

    #[tokio::test]
    async fn test_rebuild_ignores_build_time() {
        let (extractor, _) = fixtures::seeded().await;
        let store = Arc::new(MemorySearch::new());
        let search = SearchProjector::new(store.clone(), "materials", "russian");

        fixtures::build(&search, &extractor, &ctx()).await.unwrap();
        let first = store.fingerprint().await;
        let mut later = ctx();
        later.started_at += chrono::Duration::hours(1);
        fixtures::build(&search, &extractor, &later).await.unwrap();
        assert_eq!(store.fingerprint().await, first);
    }

    #[tokio::test]
    async fn test_teardown_granularity() {
        let (extractor, _) = fixtures::seeded().await;
        let search = SearchProjector::new(Arc::new(MemorySearch::new()), "materials", "russian");
        fixtures::build(&search, &extractor, &ctx()).await.unwrap();

        fixtures::teardown(&search, Granularity::Data, &ctx()).await.unwrap();
        let inventory = search.inventory().await.unwrap();
        assert_eq!(inventory.units, 0);
        assert_eq!(inventory.structures, vec!["materials"]);

        fixtures::teardown(&search, Granularity::Structure, &ctx()).await.unwrap();
        assert!(search.inventory().await.unwrap().is_empty(Granularity::Structure));
    }
}
