//! Schema Introspection Module
//!
//! Reads the live catalog of the canonical store so it can be checked against
//! the schema registry before anything is extracted.

use crate::error::{ProjectionError, ProjectionResult};
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Catalog of one schema at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSnapshot {
    pub schema: String,
    pub captured_at: DateTime<Utc>,
    pub tables: Vec<Table>,
    pub foreign_keys: Vec<ForeignKey>,
    pub checksum: String,
}

impl SchemaSnapshot {
    pub fn new(schema: impl Into<String>, tables: Vec<Table>, foreign_keys: Vec<ForeignKey>) -> Self {
        let checksum = Self::compute_checksum(&tables, &foreign_keys);
        Self {
            schema: schema.into(),
            captured_at: Utc::now(),
            tables,
            foreign_keys,
            checksum,
        }
    }

    /// Compute checksum from schema content
    pub fn compute_checksum(tables: &[Table], foreign_keys: &[ForeignKey]) -> String {
        let mut hasher = Sha256::new();

        // Sorted so catalog ordering never changes the digest
        let mut table_strs: Vec<String> = tables
            .iter()
            .flat_map(|t| {
                std::iter::once(t.name.clone()).chain(
                    t.columns
                        .iter()
                        .map(move |c| format!("{}.{}:{}", t.name, c.name, c.data_type)),
                )
            })
            .collect();
        table_strs.sort();

        for t in &table_strs {
            hasher.update(t.as_bytes());
        }

        let mut fk_strs: Vec<String> = foreign_keys
            .iter()
            .map(|fk| {
                format!(
                    "FK:{}.{}->{}.{}",
                    fk.source_table, fk.source_column, fk.referenced_table, fk.referenced_column
                )
            })
            .collect();
        fk_strs.sort();

        for fk in &fk_strs {
            hasher.update(fk.as_bytes());
        }

        format!("{:x}", hasher.finalize())
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }
}

/// Table representation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
}

impl Table {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }
}

/// Column representation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub ordinal_position: i32,
}

/// Foreign key relationship (single-column keys only)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKey {
    pub constraint_name: String,
    pub source_table: String,
    pub source_column: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

/// Schema introspector for PostgreSQL
pub struct PostgresIntrospector;

impl PostgresIntrospector {
    /// Introspect tables, columns and foreign keys of one schema
    pub async fn introspect(pool: &Pool, schema: &str) -> ProjectionResult<SchemaSnapshot> {
        let client = pool
            .get()
            .await
            .map_err(|e| ProjectionError::SourceUnavailable(e.to_string()))?;

        let tables = Self::get_tables(&client, schema).await?;
        let foreign_keys = Self::get_foreign_keys(&client, schema).await?;
        let snapshot = SchemaSnapshot::new(schema, tables, foreign_keys);

        debug!(
            "Introspected schema '{}' with {} tables, {} FKs",
            schema,
            snapshot.tables.len(),
            snapshot.foreign_keys.len()
        );

        Ok(snapshot)
    }

    /// Get all base tables with their columns
    async fn get_tables(
        client: &deadpool_postgres::Client,
        schema: &str,
    ) -> ProjectionResult<Vec<Table>> {
        let query = r#"
            SELECT
                c.table_name,
                c.column_name,
                c.data_type,
                c.is_nullable,
                c.ordinal_position
            FROM information_schema.columns c
            JOIN information_schema.tables t
                ON t.table_schema = c.table_schema
                AND t.table_name = c.table_name
            WHERE c.table_schema = $1
              AND t.table_type = 'BASE TABLE'
            ORDER BY c.table_name, c.ordinal_position
        "#;

        let rows = client
            .query(query, &[&schema])
            .await
            .map_err(|e| ProjectionError::SourceUnavailable(e.to_string()))?;

        let mut tables: Vec<Table> = Vec::new();
        for row in rows {
            let table_name: String = row.get("table_name");
            let column = Column {
                name: row.get("column_name"),
                data_type: row.get("data_type"),
                nullable: row.get::<_, String>("is_nullable") == "YES",
                ordinal_position: row.get("ordinal_position"),
            };

            match tables.last_mut() {
                Some(table) if table.name == table_name => table.columns.push(column),
                _ => tables.push(Table {
                    name: table_name,
                    columns: vec![column],
                }),
            }
        }

        Ok(tables)
    }

    /// Get all single-column foreign keys
    async fn get_foreign_keys(
        client: &deadpool_postgres::Client,
        schema: &str,
    ) -> ProjectionResult<Vec<ForeignKey>> {
        let query = r#"
            SELECT
                tc.constraint_name,
                tc.table_name AS source_table,
                kcu.column_name AS source_column,
                ccu.table_name AS referenced_table,
                ccu.column_name AS referenced_column
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
            JOIN information_schema.constraint_column_usage ccu
                ON tc.constraint_name = ccu.constraint_name
                AND tc.table_schema = ccu.constraint_schema
            WHERE tc.constraint_type = 'FOREIGN KEY'
              AND tc.table_schema = $1
            ORDER BY tc.table_name, tc.constraint_name
        "#;

        let rows = client
            .query(query, &[&schema])
            .await
            .map_err(|e| ProjectionError::SourceUnavailable(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|row| ForeignKey {
                constraint_name: row.get("constraint_name"),
                source_table: row.get("source_table"),
                source_column: row.get("source_column"),
                referenced_table: row.get("referenced_table"),
                referenced_column: row.get("referenced_column"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str, columns: &[(&str, &str)]) -> Table {
        Table {
            name: name.to_string(),
            columns: columns
                .iter()
                .enumerate()
                .map(|(i, (n, t))| Column {
                    name: n.to_string(),
                    data_type: t.to_string(),
                    nullable: false,
                    ordinal_position: i as i32 + 1,
                })
                .collect(),
        }
    }

    #[test]
    fn test_checksum_ignores_catalog_order() {
        let a = table("groups", &[("id", "integer"), ("name", "text")]);
        let b = table("students", &[("id", "integer"), ("fio", "text")]);

        let first = SchemaSnapshot::compute_checksum(&[a.clone(), b.clone()], &[]);
        let second = SchemaSnapshot::compute_checksum(&[b, a], &[]);

        assert_eq!(first, second);
    }

    #[test]
    fn test_checksum_tracks_column_types() {
        let before = SchemaSnapshot::compute_checksum(&[table("groups", &[("name", "text")])], &[]);
        let after = SchemaSnapshot::compute_checksum(
            &[table("groups", &[("name", "character varying")])],
            &[],
        );
        assert_ne!(before, after);
    }
}
