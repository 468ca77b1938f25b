//! Document collections as JSONB tables on PostgreSQL
//!
//! Each collection is a table `docstore."<collection>"` holding one JSONB
//! body per row. Scalar paths get expression indexes, paths that cross an
//! embedded array get a GIN `jsonb_path_ops` index.

use super::{CollectionInventory, DocumentStore, IndexSpec};
use crate::db;
use crate::error::{ProjectionError, ProjectionResult};
use crate::source::SqlBuilder;
use async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use serde_json::{Map, Value};
use tokio_postgres::error::SqlState;
use tracing::{debug, info};

const DOC_SCHEMA: &str = "docstore";

/// JSONB needs 9.4
const MIN_SERVER_VERSION: i32 = 90400;

/// Map a driver error: integrity and data errors are per-record, anything
/// without a SQLSTATE is the connection going away.
fn classify(e: tokio_postgres::Error) -> ProjectionError {
    match e.code() {
        Some(code) if *code == SqlState::UNIQUE_VIOLATION => ProjectionError::WriteRejected(e.to_string()),
        Some(code) if code.code().starts_with("22") || code.code().starts_with("23") => {
            ProjectionError::WriteRejected(e.to_string())
        }
        _ => ProjectionError::TargetUnavailable(e.to_string()),
    }
}

fn table(collection: &str) -> ProjectionResult<String> {
    SqlBuilder::check_ident(collection)?;
    Ok(format!("{}.{}", DOC_SCHEMA, SqlBuilder::quote_ident(collection)))
}

/// Index DDL for a dotted path
pub fn index_sql(collection: &str, index: &IndexSpec) -> ProjectionResult<String> {
    SqlBuilder::check_ident(&index.name)?;
    let segments: Vec<&str> = index.path.split('.').collect();
    for segment in &segments {
        SqlBuilder::check_ident(segment)?;
    }

    let target = table(collection)?;
    let name = SqlBuilder::quote_ident(&index.name);

    if segments.len() > 1 {
        if index.unique {
            return Err(ProjectionError::ConstraintUnsupported(format!(
                "unique index over embedded path '{}'",
                index.path
            )));
        }
        return Ok(format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} USING GIN ((body->'{}') jsonb_path_ops)",
            name, target, segments[0]
        ));
    }

    Ok(format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {} ((body->'{}'))",
        if index.unique { "UNIQUE " } else { "" },
        name,
        target,
        segments[0]
    ))
}

/// Containment filter for `path = value`: `students.id = 5` becomes
/// `{"students": [{"id": 5}]}`
pub fn containment(path: &str, value: &Value, array_root: bool) -> Value {
    let segments: Vec<&str> = path.split('.').collect();
    let mut filter = value.clone();

    for (depth, segment) in segments.iter().enumerate().rev() {
        let inner = if depth == 0 && array_root && segments.len() > 1 {
            Value::Array(vec![filter])
        } else {
            filter
        };
        let mut object = Map::new();
        object.insert(segment.to_string(), inner);
        filter = Value::Object(object);
    }
    filter
}

/// Document store backed by PostgreSQL JSONB
pub struct PgDocuments {
    pool: Pool,
}

impl PgDocuments {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn client(&self) -> ProjectionResult<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| ProjectionError::TargetUnavailable(e.to_string()))
    }

    async fn exists(&self, client: &Object, collection: &str) -> ProjectionResult<bool> {
        let row = client
            .query_one(
                "SELECT to_regclass($1) IS NOT NULL",
                &[&format!("{}.{}", DOC_SCHEMA, collection)],
            )
            .await
            .map_err(classify)?;
        Ok(row.get(0))
    }
}

#[async_trait]
impl DocumentStore for PgDocuments {
    fn describe(&self) -> String {
        "postgres jsonb documents".to_string()
    }

    async fn ping(&self) -> ProjectionResult<()> {
        let version = db::server_version_num(&self.pool)
            .await
            .map_err(ProjectionError::TargetUnavailable)?;
        if version < MIN_SERVER_VERSION {
            return Err(ProjectionError::TargetUnavailable(format!(
                "server version {} has no JSONB support",
                version
            )));
        }
        info!(version, "Connected to PostgreSQL document store");
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> ProjectionResult<bool> {
        let client = self.client().await?;
        let existed = self.exists(&client, collection).await?;
        client
            .batch_execute(&format!("DROP TABLE IF EXISTS {}", table(collection)?))
            .await
            .map_err(classify)?;
        Ok(existed)
    }

    async fn create_collection(&self, collection: &str) -> ProjectionResult<()> {
        let client = self.client().await?;
        client
            .batch_execute(&format!(
                "CREATE SCHEMA IF NOT EXISTS {}; \
                 CREATE TABLE IF NOT EXISTS {} (seq BIGSERIAL PRIMARY KEY, body JSONB NOT NULL)",
                DOC_SCHEMA,
                table(collection)?
            ))
            .await
            .map_err(classify)
    }

    async fn insert(&self, collection: &str, document: &Value) -> ProjectionResult<()> {
        let client = self.client().await?;
        client
            .execute(
                format!("INSERT INTO {} (body) VALUES ($1)", table(collection)?).as_str(),
                &[&document],
            )
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> ProjectionResult<()> {
        let sql = index_sql(collection, index)?;
        debug!(sql = %sql, "Creating document index");
        let client = self.client().await?;
        client.batch_execute(&sql).await.map_err(|e| match e.code() {
            Some(_) => ProjectionError::ConstraintUnsupported(e.to_string()),
            None => ProjectionError::TargetUnavailable(e.to_string()),
        })
    }

    async fn delete_all(&self, collection: &str) -> ProjectionResult<u64> {
        let client = self.client().await?;
        if !self.exists(&client, collection).await? {
            return Ok(0);
        }
        client
            .execute(format!("DELETE FROM {}", table(collection)?).as_str(), &[])
            .await
            .map_err(classify)
    }

    async fn inventory(&self, collection: &str) -> ProjectionResult<CollectionInventory> {
        let client = self.client().await?;
        if !self.exists(&client, collection).await? {
            return Ok(CollectionInventory::default());
        }

        let count: i64 = client
            .query_one(format!("SELECT COUNT(*) FROM {}", table(collection)?).as_str(), &[])
            .await
            .map_err(classify)?
            .get(0);

        let indexes = client
            .query(
                "SELECT indexname FROM pg_indexes \
                 WHERE schemaname = $1 AND tablename = $2 AND indexname NOT LIKE '%_pkey' \
                 ORDER BY indexname",
                &[&DOC_SCHEMA, &collection],
            )
            .await
            .map_err(classify)?
            .iter()
            .map(|row| row.get::<_, String>(0))
            .collect();

        Ok(CollectionInventory {
            exists: true,
            documents: count as u64,
            indexes,
        })
    }

    async fn find_all(&self, collection: &str) -> ProjectionResult<Vec<Value>> {
        let client = self.client().await?;
        if !self.exists(&client, collection).await? {
            return Ok(Vec::new());
        }
        let rows = client
            .query(format!("SELECT body FROM {} ORDER BY seq", table(collection)?).as_str(), &[])
            .await
            .map_err(classify)?;
        Ok(rows.iter().map(|row| row.get::<_, Value>(0)).collect())
    }

    async fn find(&self, collection: &str, path: &str, value: &Value) -> ProjectionResult<Vec<Value>> {
        let client = self.client().await?;
        if !self.exists(&client, collection).await? {
            return Ok(Vec::new());
        }
        // Embedded lists are the only arrays in projected documents
        let filter = containment(path, value, path.contains('.'));
        let rows = client
            .query(
                format!("SELECT body FROM {} WHERE body @> $1 ORDER BY seq", table(collection)?).as_str(),
                &[&filter],
            )
            .await
            .map_err(classify)?;
        Ok(rows.iter().map(|row| row.get::<_, Value>(0)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_scalar_index_uses_expression() {
        let sql = index_sql("groups", &IndexSpec::new("groups_id_unique", "id", true)).unwrap();
        assert_eq!(
            sql,
            "CREATE UNIQUE INDEX IF NOT EXISTS \"groups_id_unique\" ON docstore.\"groups\" ((body->'id'))"
        );
    }

    #[test]
    fn test_embedded_index_uses_gin() {
        let sql = index_sql("groups", &IndexSpec::new("groups_students_id", "students.id", false)).unwrap();
        assert!(sql.contains("USING GIN ((body->'students') jsonb_path_ops)"));
    }

    #[test]
    fn test_containment_filter() {
        assert_eq!(
            containment("students.id", &json!(5), true),
            json!({"students": [{"id": 5}]})
        );
        assert_eq!(containment("name", &json!("A"), false), json!({"name": "A"}));
    }

    #[test]
    fn test_collection_name_is_checked() {
        assert!(table("groups").is_ok());
        assert!(table("groups\"; DROP SCHEMA docstore; --").is_err());
    }
}
