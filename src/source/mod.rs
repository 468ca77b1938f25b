//! Source Extractor
//!
//! Reads canonical rows from the source-of-truth store. Every projector run
//! works on one [`Snapshot`], a point-in-time read-only view; a [`RowSet`]
//! taken from it can be streamed any number of times.

#[cfg(test)]
mod memory;
mod plan;
mod postgres;
mod queries;
pub mod seed;

#[cfg(test)]
pub use memory::MemorySource;
pub use plan::{CanonicalRow, JoinSpec, QueryPlan};
pub use postgres::PostgresSource;
pub use queries::SqlBuilder;
pub use seed::CanonicalDataset;

use crate::error::ProjectionResult;
use crate::introspection::SchemaSnapshot;
use crate::schema::SchemaRegistry;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// A canonical store backend
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Short backend name for logs and reports
    fn name(&self) -> &'static str;

    /// Fails with `SourceUnavailable` when the store cannot be reached
    async fn ping(&self) -> ProjectionResult<()>;

    /// Live catalog of the store
    async fn introspect(&self) -> ProjectionResult<SchemaSnapshot>;

    /// Open a point-in-time read-only session
    async fn open(&self) -> ProjectionResult<Box<dyn SourceSession>>;

    /// Create the canonical tables and load a dataset; returns rows written
    async fn provision(
        &self,
        registry: &SchemaRegistry,
        dataset: &CanonicalDataset,
    ) -> ProjectionResult<usize>;

    /// Drop the canonical tables in teardown order; returns tables dropped
    async fn reset(&self, registry: &SchemaRegistry) -> ProjectionResult<usize>;
}

/// One read-only snapshot of the source
#[async_trait]
pub trait SourceSession: Send + Sync {
    /// Lazily evaluate a plan. Each call starts a fresh sequence.
    fn stream<'a>(&'a self, plan: &'a QueryPlan) -> BoxStream<'a, ProjectionResult<CanonicalRow>>;

    /// Release the snapshot
    async fn close(&self);
}

/// Outcome of checking the live store against the registry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceVerification {
    pub backend: &'static str,
    pub checksum: String,
    pub table_count: usize,
    pub mismatches: Vec<String>,
    pub matches: bool,
}

/// Registry-aware front of a [`SourceStore`]
#[derive(Clone)]
pub struct Extractor {
    registry: Arc<SchemaRegistry>,
    store: Arc<dyn SourceStore>,
}

impl Extractor {
    pub fn new(registry: Arc<SchemaRegistry>, store: Arc<dyn SourceStore>) -> Self {
        Self { registry, store }
    }

    pub fn store(&self) -> &dyn SourceStore {
        self.store.as_ref()
    }

    pub async fn ping(&self) -> ProjectionResult<()> {
        self.store.ping().await
    }

    /// Introspect the store and list every registry mismatch
    pub async fn verify(&self) -> ProjectionResult<SourceVerification> {
        let snapshot = self.store.introspect().await?;
        let mismatches = self.registry.check_snapshot(&snapshot);

        info!(
            backend = self.store.name(),
            checksum = %snapshot.checksum,
            mismatches = mismatches.len(),
            "Verified canonical store"
        );

        Ok(SourceVerification {
            backend: self.store.name(),
            checksum: snapshot.checksum,
            table_count: snapshot.tables.len(),
            matches: mismatches.is_empty(),
            mismatches,
        })
    }

    /// Open a snapshot for one projector run. Callers must `close` it.
    pub async fn snapshot(&self) -> ProjectionResult<Snapshot<'_>> {
        let session = self.store.open().await?;
        debug!(backend = self.store.name(), "Opened source snapshot");
        Ok(Snapshot {
            registry: &self.registry,
            session,
        })
    }
}

/// A point-in-time view of the source
pub struct Snapshot<'a> {
    registry: &'a SchemaRegistry,
    session: Box<dyn SourceSession>,
}

impl<'a> Snapshot<'a> {
    /// Resolve a join spec into a restartable row set
    pub fn rows(&self, spec: JoinSpec) -> ProjectionResult<RowSet<'_>> {
        let plan = QueryPlan::build(self.registry, &spec)?;
        Ok(RowSet {
            session: self.session.as_ref(),
            plan,
        })
    }

    pub async fn close(self) {
        self.session.close().await;
    }
}

/// Lazy, finite, restartable sequence of canonical rows
pub struct RowSet<'a> {
    session: &'a dyn SourceSession,
    plan: QueryPlan,
}

impl<'a> RowSet<'a> {
    pub fn stream(&self) -> BoxStream<'_, ProjectionResult<CanonicalRow>> {
        self.session.stream(&self.plan)
    }

    pub async fn collect(&self) -> ProjectionResult<Vec<CanonicalRow>> {
        self.stream().try_collect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProjectionError;
    use crate::schema::{university_registry, EntityKind};
    use futures::StreamExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    async fn seeded() -> (Extractor, Arc<MemorySource>) {
        let registry = Arc::new(university_registry().unwrap());
        let source = Arc::new(MemorySource::new());
        let dataset = CanonicalDataset::reference(&mut StdRng::seed_from_u64(42));
        source.provision(&registry, &dataset).await.unwrap();
        (Extractor::new(registry, source.clone()), source)
    }

    #[tokio::test]
    async fn test_row_set_is_restartable() {
        let (extractor, _) = seeded().await;
        let snapshot = extractor.snapshot().await.unwrap();
        let rows = snapshot.rows(JoinSpec::of(EntityKind::Student)).unwrap();

        let first: Vec<_> = rows.stream().collect().await;
        let second = rows.collect().await.unwrap();
        snapshot.close().await;

        assert_eq!(first.len(), 19);
        assert_eq!(second.len(), 19);
        assert_eq!(first[0].as_ref().unwrap(), &second[0]);
    }

    #[tokio::test]
    async fn test_material_rows_carry_ancestor_names() {
        let (extractor, _) = seeded().await;
        let snapshot = extractor.snapshot().await.unwrap();
        let rows = snapshot
            .rows(
                JoinSpec::of(EntityKind::Material)
                    .up(EntityKind::Lecture)
                    .up(EntityKind::Course)
                    .up(EntityKind::Department),
            )
            .unwrap()
            .collect()
            .await
            .unwrap();
        snapshot.close().await;

        assert_eq!(rows.len(), 5);
        let first = &rows[0];
        assert_eq!(first.text("lecture_name").unwrap(), Some("Введение в алгоритмы"));
        assert_eq!(first.text("course_name").unwrap(), Some("Введение в программирование"));
        assert_eq!(first.text("department_name").unwrap(), Some("Кафедра программной инженерии"));
    }

    #[tokio::test]
    async fn test_unavailable_source_fails_snapshot() {
        let (extractor, memory) = seeded().await;
        tokio_test::assert_ok!(extractor.ping().await);

        memory.set_available(false);
        tokio_test::assert_err!(extractor.ping().await);
        assert!(matches!(
            extractor.snapshot().await.err(),
            Some(ProjectionError::SourceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_verify_reports_missing_columns() {
        let (extractor, memory) = seeded().await;

        assert!(extractor.verify().await.unwrap().matches);

        memory.drop_column("students", "fio").await;
        let report = extractor.verify().await.unwrap();
        assert!(!report.matches);
        assert_eq!(report.mismatches, vec!["missing column 'students.fio'".to_string()]);
    }
}
