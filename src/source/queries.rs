//! SQL builders for the canonical store

use super::plan::QueryPlan;
use crate::error::{ProjectionError, ProjectionResult};
use crate::schema::{EntityDef, SchemaRegistry};
use once_cell::sync::Lazy;
use regex::Regex;

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_]*$").expect("identifier pattern is valid"));

/// SQL builder for the canonical store
pub struct SqlBuilder;

impl SqlBuilder {
    /// Quote an identifier (table/column name) safely
    pub fn quote_ident(ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Reject identifiers outside the plain lower-case shape
    pub fn check_ident(ident: &str) -> ProjectionResult<()> {
        if IDENTIFIER.is_match(ident) {
            Ok(())
        } else {
            Err(ProjectionError::Config(format!("Invalid identifier '{}'", ident)))
        }
    }

    /// Build the SELECT for a plan: inner joins up the chain, ordered by id
    pub fn select(plan: &QueryPlan) -> ProjectionResult<String> {
        let mut columns = Vec::with_capacity(plan.fields.len());
        for field in &plan.fields {
            Self::check_ident(field.column)?;
            columns.push(format!(
                "t{}.{} AS {}",
                field.step,
                Self::quote_ident(field.column),
                Self::quote_ident(&field.name)
            ));
        }

        let mut sql = format!(
            "SELECT {} FROM {} t0",
            columns.join(", "),
            Self::quote_ident(plan.steps[0].table)
        );

        for (i, step) in plan.steps.iter().enumerate().skip(1) {
            Self::check_ident(step.table)?;
            let via = step.via.ok_or_else(|| {
                ProjectionError::Config(format!("Join step '{}' has no relation", step.kind))
            })?;
            sql.push_str(&format!(
                " JOIN {} t{} ON t{}.\"id\" = t{}.{}",
                Self::quote_ident(step.table),
                i,
                i,
                i - 1,
                Self::quote_ident(via.column)
            ));
        }

        sql.push_str(" ORDER BY t0.\"id\"");
        Ok(sql)
    }

    /// Build CREATE TABLE for an entity, with its foreign keys
    pub fn create_table(registry: &SchemaRegistry, def: &EntityDef) -> ProjectionResult<String> {
        Self::check_ident(def.table)?;
        let mut columns = vec!["\"id\" SERIAL PRIMARY KEY".to_string()];

        for attr in &def.attributes {
            Self::check_ident(attr.column)?;
            columns.push(format!(
                "{} {}",
                Self::quote_ident(attr.column),
                attr.kind.sql_type()
            ));
        }

        for rel in registry.parents(def.kind) {
            Self::check_ident(rel.column)?;
            let parent = registry.entity(rel.parent)?;
            columns.push(format!(
                "{} INTEGER REFERENCES {}(\"id\")",
                Self::quote_ident(rel.column),
                Self::quote_ident(parent.table)
            ));
        }

        Ok(format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            Self::quote_ident(def.table),
            columns.join(", ")
        ))
    }

    /// Build DROP TABLE ... CASCADE
    pub fn drop_table(table: &str) -> String {
        format!("DROP TABLE IF EXISTS {} CASCADE", Self::quote_ident(table))
    }

    /// Build a parameterized INSERT with an explicit id
    pub fn insert(table: &str, columns: &[&str]) -> String {
        let quoted: Vec<String> = std::iter::once("id")
            .chain(columns.iter().copied())
            .map(Self::quote_ident)
            .collect();
        let params: Vec<String> = (1..=quoted.len()).map(|i| format!("${}", i)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            Self::quote_ident(table),
            quoted.join(", "),
            params.join(", ")
        )
    }

    /// Move the id sequence past explicitly inserted ids
    pub fn resync_sequence(table: &str) -> String {
        format!(
            "SELECT setval(pg_get_serial_sequence('{}', 'id'), COALESCE(MAX(\"id\"), 1)) FROM {}",
            table,
            Self::quote_ident(table)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{university_registry, EntityKind};
    use crate::source::plan::JoinSpec;

    #[test]
    fn test_select_joins_up_the_chain() {
        let registry = university_registry().unwrap();
        let plan = QueryPlan::build(
            &registry,
            &JoinSpec::of(EntityKind::Student).up(EntityKind::Group),
        )
        .unwrap();

        let sql = SqlBuilder::select(&plan).unwrap();
        assert!(sql.starts_with("SELECT t0.\"id\" AS \"id\", t0.\"fio\" AS \"full_name\""));
        assert!(sql.contains("FROM \"students\" t0 JOIN \"groups\" t1 ON t1.\"id\" = t0.\"id_group\""));
        assert!(sql.contains("t1.\"startyear\" AS \"group_start_date\""));
        assert!(sql.ends_with("ORDER BY t0.\"id\""));
    }

    #[test]
    fn test_create_table_references_parents() {
        let registry = university_registry().unwrap();
        let def = registry.entity(EntityKind::VisitRecord).unwrap();
        let sql = SqlBuilder::create_table(&registry, def).unwrap();

        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"visits\""));
        assert!(sql.contains("\"visittime\" TIMESTAMPTZ"));
        assert!(sql.contains("\"id_student\" INTEGER REFERENCES \"students\"(\"id\")"));
        assert!(sql.contains("\"id_rasp\" INTEGER REFERENCES \"schedule\"(\"id\")"));
    }

    #[test]
    fn test_insert_numbers_parameters() {
        assert_eq!(
            SqlBuilder::insert("specialties", &["name", "code"]),
            "INSERT INTO \"specialties\" (\"id\", \"name\", \"code\") VALUES ($1, $2, $3)"
        );
    }

    #[test]
    fn test_identifier_check() {
        assert!(SqlBuilder::check_ident("id_kafedr_a").is_ok());
        assert!(SqlBuilder::check_ident("groups; DROP TABLE x").is_err());
    }
}
