//! In-process canonical store
//!
//! Evaluates plans with inner-join semantics: a row whose ancestor is missing
//! is dropped, the same as the SQL the PostgreSQL backend generates.

use super::plan::{CanonicalRow, QueryPlan};
use super::seed::{CanonicalDataset, SourceRecord};
use super::{SourceSession, SourceStore};
use crate::error::{ProjectionError, ProjectionResult};
use crate::introspection::{Column, SchemaSnapshot, Table};
use crate::schema::SchemaRegistry;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    /// (column, data type) in declaration order, `id` first
    columns: Vec<(String, String)>,
    rows: Vec<SourceRecord>,
}

impl MemoryTable {
    fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|(c, _)| c == name)
    }
}

type Tables = BTreeMap<String, MemoryTable>;

/// Canonical store held in memory
pub struct MemorySource {
    tables: RwLock<Tables>,
    available: AtomicBool,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store going away or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Remove a column from a table, as if the store had evolved
    pub async fn drop_column(&self, table: &str, column: &str) {
        if let Some(t) = self.tables.write().await.get_mut(table) {
            t.columns.retain(|(c, _)| c != column);
            for row in &mut t.rows {
                row.columns.remove(column);
            }
        }
    }

    fn check_available(&self) -> ProjectionResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProjectionError::SourceUnavailable(
                "in-memory source is offline".to_string(),
            ))
        }
    }
}

#[async_trait]
impl SourceStore for MemorySource {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> ProjectionResult<()> {
        self.check_available()
    }

    async fn introspect(&self) -> ProjectionResult<SchemaSnapshot> {
        self.check_available()?;
        let tables = self.tables.read().await;

        let catalog = tables
            .iter()
            .map(|(name, t)| Table {
                name: name.clone(),
                columns: t
                    .columns
                    .iter()
                    .enumerate()
                    .map(|(i, (c, ty))| Column {
                        name: c.clone(),
                        data_type: ty.clone(),
                        nullable: c != "id",
                        ordinal_position: i as i32 + 1,
                    })
                    .collect(),
            })
            .collect();

        Ok(SchemaSnapshot::new("memory", catalog, Vec::new()))
    }

    async fn open(&self) -> ProjectionResult<Box<dyn SourceSession>> {
        self.check_available()?;
        let tables = self.tables.read().await.clone();
        Ok(Box::new(MemorySession {
            tables: Arc::new(tables),
        }))
    }

    async fn provision(
        &self,
        registry: &SchemaRegistry,
        dataset: &CanonicalDataset,
    ) -> ProjectionResult<usize> {
        self.check_available()?;
        dataset.validate(registry)?;

        let mut tables = self.tables.write().await;
        let mut written = 0;

        for kind in registry.creation_order() {
            let def = registry.entity(*kind)?;
            let mut columns = vec![("id".to_string(), "integer".to_string())];
            columns.extend(
                def.attributes
                    .iter()
                    .map(|a| (a.column.to_string(), a.kind.sql_type().to_lowercase())),
            );
            columns.extend(
                registry
                    .parents(*kind)
                    .into_iter()
                    .map(|r| (r.column.to_string(), "integer".to_string())),
            );

            let rows = dataset.rows(*kind).to_vec();
            written += rows.len();
            tables.insert(def.table.to_string(), MemoryTable { columns, rows });
        }

        debug!(rows = written, "Provisioned in-memory canonical store");
        Ok(written)
    }

    async fn reset(&self, registry: &SchemaRegistry) -> ProjectionResult<usize> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        let mut dropped = 0;
        for kind in registry.teardown_order() {
            if tables.remove(registry.entity(kind)?.table).is_some() {
                dropped += 1;
            }
        }
        Ok(dropped)
    }
}

struct MemorySession {
    tables: Arc<Tables>,
}

impl MemorySession {
    fn table(&self, name: &str) -> ProjectionResult<&MemoryTable> {
        self.tables.get(name).ok_or_else(|| {
            ProjectionError::SchemaMismatch(format!("relation \"{}\" does not exist", name))
        })
    }

    fn evaluate(&self, plan: &QueryPlan) -> ProjectionResult<Vec<CanonicalRow>> {
        let steps: Vec<&MemoryTable> = plan
            .steps
            .iter()
            .map(|s| self.table(s.table))
            .collect::<ProjectionResult<_>>()?;

        for field in &plan.fields {
            if !steps[field.step].has_column(field.column) {
                return Err(ProjectionError::SchemaMismatch(format!(
                    "column {}.{} does not exist",
                    plan.steps[field.step].table, field.column
                )));
            }
        }

        let indexes: Vec<HashMap<i64, &SourceRecord>> = steps
            .iter()
            .map(|t| t.rows.iter().map(|r| (r.id, r)).collect())
            .collect();

        let mut base: Vec<&SourceRecord> = steps[0].rows.iter().collect();
        base.sort_by_key(|r| r.id);

        let mut out = Vec::with_capacity(base.len());
        'rows: for record in base {
            let mut chain = vec![record];
            for (i, step) in plan.steps.iter().enumerate().skip(1) {
                let Some(via) = step.via else { continue 'rows };
                let parent = chain[i - 1]
                    .columns
                    .get(via.column)
                    .and_then(Value::as_i64)
                    .and_then(|id| indexes[i].get(&id).copied());
                match parent {
                    Some(p) => chain.push(p),
                    None => continue 'rows,
                }
            }

            let fields = plan
                .fields
                .iter()
                .map(|f| {
                    let source = chain[f.step];
                    let value = if f.column == "id" {
                        Value::from(source.id)
                    } else {
                        source.columns.get(f.column).cloned().unwrap_or(Value::Null)
                    };
                    (f.name.clone(), value)
                })
                .collect();

            out.push(CanonicalRow {
                kind: plan.base(),
                id: record.id,
                fields,
            });
        }

        Ok(out)
    }
}

#[async_trait]
impl SourceSession for MemorySession {
    fn stream<'a>(&'a self, plan: &'a QueryPlan) -> BoxStream<'a, ProjectionResult<CanonicalRow>> {
        stream::once(async move { self.evaluate(plan) })
            .map_ok(|rows| stream::iter(rows.into_iter().map(Ok::<_, ProjectionError>)))
            .try_flatten()
            .boxed()
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{university_registry, EntityKind};
    use crate::source::plan::JoinSpec;

    fn dataset() -> CanonicalDataset {
        let mut data = CanonicalDataset::new();
        data.push(EntityKind::University, vec![("name", "U".into())]);
        data.push(EntityKind::Institute, vec![("id_univer", 1.into()), ("name", "I".into())]);
        data.push(
            EntityKind::Department,
            vec![("id_institutes", 1.into()), ("name", "D".into())],
        );
        data.push(
            EntityKind::Group,
            vec![
                ("id_kafedr_a", 1.into()),
                ("name", "G".into()),
                ("startyear", "2020-09-01".into()),
                ("endyear", "2024-06-30".into()),
            ],
        );
        // dangling parent reference
        data.push(
            EntityKind::Group,
            vec![
                ("id_kafedr_a", 9.into()),
                ("name", "Orphan".into()),
                ("startyear", Value::Null),
                ("endyear", Value::Null),
            ],
        );
        data
    }

    #[tokio::test]
    async fn test_inner_join_drops_rows_with_missing_ancestors() {
        let registry = university_registry().unwrap();
        let source = MemorySource::new();
        source.provision(&registry, &dataset()).await.unwrap();

        let session = source.open().await.unwrap();
        let plain = QueryPlan::build(&registry, &JoinSpec::of(EntityKind::Group)).unwrap();
        let joined = QueryPlan::build(
            &registry,
            &JoinSpec::of(EntityKind::Group).up(EntityKind::Department),
        )
        .unwrap();

        let all: Vec<_> = session.stream(&plain).try_collect().await.unwrap();
        let with_parent: Vec<CanonicalRow> = session.stream(&joined).try_collect().await.unwrap();

        assert_eq!(all.len(), 2);
        assert_eq!(with_parent.len(), 1);
        assert_eq!(with_parent[0].text("department_name").unwrap(), Some("D"));
    }

    #[tokio::test]
    async fn test_missing_table_is_schema_mismatch() {
        let registry = university_registry().unwrap();
        let source = MemorySource::new();
        let session = source.open().await.unwrap();
        let plan = QueryPlan::build(&registry, &JoinSpec::of(EntityKind::Student)).unwrap();

        let result: ProjectionResult<Vec<CanonicalRow>> = session.stream(&plan).try_collect().await;
        assert!(matches!(result, Err(ProjectionError::SchemaMismatch(_))));
    }

    #[tokio::test]
    async fn test_snapshot_is_isolated_from_later_writes() {
        let registry = university_registry().unwrap();
        let source = MemorySource::new();
        source.provision(&registry, &dataset()).await.unwrap();

        let session = source.open().await.unwrap();
        source.reset(&registry).await.unwrap();

        let plan = QueryPlan::build(&registry, &JoinSpec::of(EntityKind::University)).unwrap();
        let rows: Vec<CanonicalRow> = session.stream(&plan).try_collect().await.unwrap();
        assert_eq!(rows.len(), 1);
    }
}
