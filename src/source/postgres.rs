//! PostgreSQL canonical store
//!
//! A session is one pooled client inside a `REPEATABLE READ READ ONLY`
//! transaction, so every row set taken from it sees the same snapshot.

use super::plan::{CanonicalRow, QueryPlan, ValueKind};
use super::queries::SqlBuilder;
use super::seed::{sql_param, CanonicalDataset};
use super::{SourceSession, SourceStore};
use crate::error::{ProjectionError, ProjectionResult};
use crate::introspection::{PostgresIntrospector, SchemaSnapshot};
use crate::schema::{AttrKind, SchemaRegistry};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use deadpool_postgres::{Object, Pool};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use postgres_types::ToSql;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_postgres::error::SqlState;
use tokio_postgres::Row;
use tracing::{debug, info, warn};

const CANONICAL_SCHEMA: &str = "public";

/// Map a driver error onto the projection taxonomy
pub fn classify(e: tokio_postgres::Error) -> ProjectionError {
    match e.code() {
        Some(code)
            if *code == SqlState::UNDEFINED_TABLE
                || *code == SqlState::UNDEFINED_COLUMN
                || *code == SqlState::DATATYPE_MISMATCH =>
        {
            ProjectionError::SchemaMismatch(e.to_string())
        }
        _ => ProjectionError::SourceUnavailable(e.to_string()),
    }
}

/// Canonical store on PostgreSQL
pub struct PostgresSource {
    pool: Pool,
}

impl PostgresSource {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn client(&self) -> ProjectionResult<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| ProjectionError::SourceUnavailable(e.to_string()))
    }
}

#[async_trait]
impl SourceStore for PostgresSource {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> ProjectionResult<()> {
        crate::db::ping(&self.pool)
            .await
            .map_err(ProjectionError::SourceUnavailable)
    }

    async fn introspect(&self) -> ProjectionResult<SchemaSnapshot> {
        PostgresIntrospector::introspect(&self.pool, CANONICAL_SCHEMA).await
    }

    async fn open(&self) -> ProjectionResult<Box<dyn SourceSession>> {
        let client = self.client().await?;
        client
            .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .await
            .map_err(classify)?;

        Ok(Box::new(PgSession {
            client: Some(client),
            closed: AtomicBool::new(false),
        }))
    }

    async fn provision(
        &self,
        registry: &SchemaRegistry,
        dataset: &CanonicalDataset,
    ) -> ProjectionResult<usize> {
        dataset.validate(registry)?;

        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(classify)?;

        for kind in registry.teardown_order() {
            let def = registry.entity(kind)?;
            tx.batch_execute(&SqlBuilder::drop_table(def.table))
                .await
                .map_err(classify)?;
        }

        let mut written = 0;
        for kind in registry.creation_order() {
            let def = registry.entity(*kind)?;
            tx.batch_execute(&SqlBuilder::create_table(registry, def)?)
                .await
                .map_err(classify)?;

            // (column, kind) with `None` for foreign keys
            let mut columns: Vec<(&str, Option<AttrKind>)> =
                def.attributes.iter().map(|a| (a.column, Some(a.kind))).collect();
            columns.extend(registry.parents(*kind).into_iter().map(|r| (r.column, None)));

            let names: Vec<&str> = columns.iter().map(|(c, _)| *c).collect();
            let statement = tx
                .prepare(&SqlBuilder::insert(def.table, &names))
                .await
                .map_err(classify)?;

            for row in dataset.rows(*kind) {
                let mut params: Vec<Box<dyn ToSql + Sync + Send>> =
                    vec![sql_param(&Value::from(row.id), None)?];
                for (column, attr) in &columns {
                    let value = row.columns.get(*column).unwrap_or(&Value::Null);
                    params.push(sql_param(value, *attr)?);
                }
                let refs: Vec<&(dyn ToSql + Sync)> =
                    params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();

                tx.execute(&statement, &refs).await.map_err(classify)?;
                written += 1;
            }

            let resync = SqlBuilder::resync_sequence(def.table);
            tx.query_one(resync.as_str(), &[]).await.map_err(classify)?;
            debug!(entity = %kind, rows = dataset.count(*kind), "Loaded canonical table");
        }

        tx.commit().await.map_err(classify)?;
        info!(rows = written, "Provisioned canonical store");
        Ok(written)
    }

    async fn reset(&self, registry: &SchemaRegistry) -> ProjectionResult<usize> {
        let client = self.client().await?;
        let mut dropped = 0;
        for kind in registry.teardown_order() {
            let def = registry.entity(kind)?;
            client
                .batch_execute(&SqlBuilder::drop_table(def.table))
                .await
                .map_err(classify)?;
            dropped += 1;
        }
        info!(tables = dropped, "Dropped canonical tables");
        Ok(dropped)
    }
}

struct PgSession {
    client: Option<Object>,
    closed: AtomicBool,
}

impl PgSession {
    fn decode(plan: &QueryPlan, row: &Row) -> ProjectionResult<CanonicalRow> {
        let mut fields = BTreeMap::new();

        for (i, field) in plan.fields.iter().enumerate() {
            let mismatch = |e: tokio_postgres::Error| {
                ProjectionError::SchemaMismatch(format!("field '{}': {}", field.name, e))
            };

            let value = match field.value {
                ValueKind::Id => row
                    .try_get::<_, Option<i32>>(i)
                    .map_err(mismatch)?
                    .map(Value::from),
                ValueKind::Attr(AttrKind::Text) => row
                    .try_get::<_, Option<String>>(i)
                    .map_err(mismatch)?
                    .map(Value::from),
                ValueKind::Attr(AttrKind::Date) => row
                    .try_get::<_, Option<NaiveDate>>(i)
                    .map_err(mismatch)?
                    .map(|d| Value::from(d.format("%Y-%m-%d").to_string())),
                ValueKind::Attr(AttrKind::Timestamp) => row
                    .try_get::<_, Option<DateTime<Utc>>>(i)
                    .map_err(mismatch)?
                    .map(|t| Value::from(t.to_rfc3339())),
                ValueKind::Attr(AttrKind::Bool) => row
                    .try_get::<_, Option<bool>>(i)
                    .map_err(mismatch)?
                    .map(Value::from),
            };

            fields.insert(field.name.clone(), value.unwrap_or(Value::Null));
        }

        let id = fields.get("id").and_then(Value::as_i64).ok_or_else(|| {
            ProjectionError::SchemaMismatch(format!("{} row without id", plan.base()))
        })?;

        Ok(CanonicalRow {
            kind: plan.base(),
            id,
            fields,
        })
    }
}

#[async_trait]
impl SourceSession for PgSession {
    fn stream<'a>(&'a self, plan: &'a QueryPlan) -> BoxStream<'a, ProjectionResult<CanonicalRow>> {
        let query = async move {
            let client = self.client.as_ref().ok_or_else(|| {
                ProjectionError::SourceUnavailable("source session already closed".to_string())
            })?;
            let sql = SqlBuilder::select(plan)?;
            let rows = client
                .query_raw(sql.as_str(), Vec::<String>::new())
                .await
                .map_err(classify)?;
            Ok::<_, ProjectionError>(
                rows.map(move |row| row.map_err(classify).and_then(|r| Self::decode(plan, &r))),
            )
        };

        stream::once(query).try_flatten().boxed()
    }

    async fn close(&self) {
        if let Some(client) = self.client.as_ref() {
            match client.batch_execute("ROLLBACK").await {
                Ok(()) => self.closed.store(true, Ordering::SeqCst),
                Err(e) => warn!("Failed to end source snapshot: {}", e),
            }
        }
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        // A client still inside the snapshot transaction must not go back to the pool
        if !self.closed.load(Ordering::SeqCst) {
            if let Some(client) = self.client.take() {
                drop(Object::take(client));
            }
        }
    }
}
