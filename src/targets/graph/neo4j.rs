//! Neo4j over the HTTP transactional endpoint
//!
//! The server version is read once by [`Neo4jGraph::ping`]; every statement
//! afterwards is rendered for that [`Dialect`].

use super::{EdgeRef, GraphInventory, GraphStore};
use crate::error::{ProjectionError, ProjectionResult};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use url::Url;

static LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("label pattern is valid"));

/// Cypher dialect chosen by the server's major version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `FOR … REQUIRE`, named constraints, `SHOW CONSTRAINTS`
    V5,
    /// `ON … ASSERT` with names and `IF NOT EXISTS`
    V4,
    /// Legacy endpoint, unnamed `ON … ASSERT`
    V3,
}

impl Dialect {
    /// Pick the dialect from a `x.y.z` version string
    pub fn from_version(version: &str) -> ProjectionResult<Self> {
        let major: u32 = version
            .split('.')
            .next()
            .and_then(|m| m.trim().parse().ok())
            .ok_or_else(|| {
                ProjectionError::TargetUnavailable(format!("Unreadable Neo4j version '{}'", version))
            })?;
        Ok(match major {
            0..=3 => Dialect::V3,
            4 => Dialect::V4,
            _ => Dialect::V5,
        })
    }

    fn constraint_name(label: &str, key: &str) -> String {
        format!("{}_{}_unique", label.to_lowercase(), key)
    }

    pub fn create_unique(&self, label: &str, key: &str) -> String {
        let name = Self::constraint_name(label, key);
        match self {
            Dialect::V5 => format!(
                "CREATE CONSTRAINT {} IF NOT EXISTS FOR (n:`{}`) REQUIRE n.`{}` IS UNIQUE",
                name, label, key
            ),
            Dialect::V4 => format!(
                "CREATE CONSTRAINT {} IF NOT EXISTS ON (n:`{}`) ASSERT n.`{}` IS UNIQUE",
                name, label, key
            ),
            Dialect::V3 => format!("CREATE CONSTRAINT ON (n:`{}`) ASSERT n.`{}` IS UNIQUE", label, key),
        }
    }

    pub fn drop_unique(&self, label: &str, key: &str) -> String {
        match self {
            Dialect::V5 | Dialect::V4 => {
                format!("DROP CONSTRAINT {} IF EXISTS", Self::constraint_name(label, key))
            }
            Dialect::V3 => format!("DROP CONSTRAINT ON (n:`{}`) ASSERT n.`{}` IS UNIQUE", label, key),
        }
    }

    pub fn list_constraints(&self) -> &'static str {
        match self {
            Dialect::V5 => "SHOW CONSTRAINTS YIELD name RETURN name",
            Dialect::V4 | Dialect::V3 => "CALL db.constraints() YIELD description RETURN description",
        }
    }

    /// Path of the commit endpoint below the server root
    pub fn commit_path(&self, database: &str) -> String {
        match self {
            Dialect::V3 => "db/data/transaction/commit".to_string(),
            Dialect::V4 | Dialect::V5 => format!("db/{}/tx/commit", database),
        }
    }
}

fn check_label(label: &str) -> ProjectionResult<()> {
    if LABEL.is_match(label) {
        Ok(())
    } else {
        Err(ProjectionError::Config(format!("Invalid graph identifier '{}'", label)))
    }
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    #[serde(default)]
    results: Vec<TxResult>,
    #[serde(default)]
    errors: Vec<TxError>,
}

#[derive(Debug, Deserialize)]
struct TxResult {
    #[serde(default)]
    data: Vec<TxRow>,
}

#[derive(Debug, Deserialize)]
struct TxRow {
    row: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct TxError {
    code: String,
    message: String,
}

/// Map a Neo4j status code onto the projection taxonomy
fn classify(error: &TxError, schema_statement: bool) -> ProjectionError {
    let detail = format!("{}: {}", error.code, error.message);
    if error.code.starts_with("Neo.ClientError.Security")
        || error.code.starts_with("Neo.TransientError")
        || error.code.starts_with("Neo.DatabaseError")
    {
        ProjectionError::TargetUnavailable(detail)
    } else if schema_statement {
        ProjectionError::ConstraintUnsupported(detail)
    } else {
        ProjectionError::WriteRejected(detail)
    }
}

/// Graph store backed by a Neo4j server
pub struct Neo4jGraph {
    base: Url,
    user: String,
    password: String,
    database: String,
    client: Client,
    dialect: OnceCell<Dialect>,
}

impl Neo4jGraph {
    pub fn new(
        base: Url,
        user: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
        timeout: Duration,
    ) -> ProjectionResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProjectionError::Config(format!("Neo4j client: {}", e)))?;
        Ok(Self {
            base,
            user: user.into(),
            password: password.into(),
            database: database.into(),
            client,
            dialect: OnceCell::new(),
        })
    }

    fn url(&self, path: &str) -> ProjectionResult<Url> {
        self.base
            .join(path)
            .map_err(|e| ProjectionError::Config(format!("Neo4j URL '{}': {}", path, e)))
    }

    async fn get_json(&self, path: &str) -> ProjectionResult<Value> {
        let response = self
            .client
            .get(self.url(path)?)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(|e| ProjectionError::TargetUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ProjectionError::TargetUnavailable(format!(
                "Neo4j {} returned {}",
                path,
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ProjectionError::TargetUnavailable(e.to_string()))
    }

    async fn discover(&self) -> ProjectionResult<Dialect> {
        let root = self.get_json("").await?;
        let version = match root.get("neo4j_version").and_then(Value::as_str) {
            Some(v) => v.to_string(),
            // 3.x only advertises its version below the legacy data root
            None => self
                .get_json("db/data/")
                .await?
                .get("neo4j_version")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    ProjectionError::TargetUnavailable("Neo4j did not report a version".to_string())
                })?,
        };
        let dialect = Dialect::from_version(&version)?;
        info!(version = %version, dialect = ?dialect, "Connected to Neo4j");
        Ok(dialect)
    }

    async fn dialect(&self) -> ProjectionResult<Dialect> {
        self.dialect.get_or_try_init(|| self.discover()).await.copied()
    }

    /// Run one statement in its own transaction and return its rows
    async fn run(&self, statement: &str, parameters: Value, schema: bool) -> ProjectionResult<Vec<Vec<Value>>> {
        let dialect = self.dialect().await?;
        let body = json!({
            "statements": [{ "statement": statement, "parameters": parameters }]
        });
        debug!(statement, "Cypher");

        let response = self
            .client
            .post(self.url(&dialect.commit_path(&self.database))?)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProjectionError::TargetUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ProjectionError::TargetUnavailable(format!(
                "Neo4j returned {}",
                response.status()
            )));
        }

        let tx: TxResponse = response
            .json()
            .await
            .map_err(|e| ProjectionError::TargetUnavailable(e.to_string()))?;

        if let Some(error) = tx.errors.first() {
            return Err(classify(error, schema));
        }

        Ok(tx
            .results
            .into_iter()
            .next()
            .map(|r| r.data.into_iter().map(|d| d.row).collect())
            .unwrap_or_default())
    }

    async fn count(&self, statement: &str, parameters: Value) -> ProjectionResult<u64> {
        let rows = self.run(statement, parameters, false).await?;
        Ok(rows
            .first()
            .and_then(|r| r.first())
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }
}

#[async_trait]
impl GraphStore for Neo4jGraph {
    fn describe(&self) -> String {
        match self.dialect.get() {
            Some(d) => format!("neo4j {:?} at {}", d, self.base),
            None => format!("neo4j at {}", self.base),
        }
    }

    async fn ping(&self) -> ProjectionResult<()> {
        self.dialect().await.map(|_| ())
    }

    async fn ensure_unique(&self, label: &str, key: &str) -> ProjectionResult<()> {
        check_label(label)?;
        check_label(key)?;
        let statement = self.dialect().await?.create_unique(label, key);
        self.run(&statement, json!({}), true).await.map(|_| ())
    }

    async fn drop_unique(&self, label: &str, key: &str) -> ProjectionResult<()> {
        check_label(label)?;
        check_label(key)?;
        let statement = self.dialect().await?.drop_unique(label, key);
        match self.run(&statement, json!({}), true).await {
            // 3.x has no IF EXISTS; a missing constraint is already dropped
            Err(ProjectionError::ConstraintUnsupported(detail)) => {
                debug!(label, key, "Constraint not dropped: {}", detail);
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    async fn merge_node(&self, label: &str, id: i64, props: &Map<String, Value>) -> ProjectionResult<()> {
        check_label(label)?;
        let statement = format!("MERGE (n:`{}` {{id: $id}}) SET n += $props", label);
        self.run(&statement, json!({ "id": id, "props": props }), false)
            .await
            .map(|_| ())
    }

    async fn merge_edge(&self, edge: &EdgeRef<'_>) -> ProjectionResult<()> {
        check_label(edge.from_label)?;
        check_label(edge.to_label)?;
        check_label(edge.edge_type)?;
        let statement = format!(
            "MATCH (a:`{}` {{id: $from}}) MATCH (b:`{}` {{id: $to}}) \
             MERGE (a)-[r:`{}`]->(b) RETURN count(r)",
            edge.from_label, edge.to_label, edge.edge_type
        );
        let merged = self
            .count(&statement, json!({ "from": edge.from_id, "to": edge.to_id }))
            .await?;

        if merged == 0 {
            return Err(ProjectionError::ReferentialGap(format!(
                "{}:{} -[{}]-> {}:{}: endpoint missing",
                edge.from_label, edge.from_id, edge.edge_type, edge.to_label, edge.to_id
            )));
        }
        Ok(())
    }

    async fn delete_edges(&self, edge_type: &str) -> ProjectionResult<u64> {
        check_label(edge_type)?;
        let statement = format!("MATCH ()-[r:`{}`]->() DELETE r RETURN count(r)", edge_type);
        self.count(&statement, json!({})).await
    }

    async fn delete_nodes(&self, label: &str) -> ProjectionResult<u64> {
        check_label(label)?;
        let statement = format!("MATCH (n:`{}`) DETACH DELETE n RETURN count(n)", label);
        self.count(&statement, json!({})).await
    }

    async fn inventory(&self) -> ProjectionResult<GraphInventory> {
        let dialect = self.dialect().await?;
        let mut inventory = GraphInventory::default();

        let nodes = self
            .run(
                "MATCH (n) UNWIND labels(n) AS label RETURN label, count(*)",
                json!({}),
                false,
            )
            .await?;
        for row in nodes {
            if let (Some(label), Some(count)) = (
                row.first().and_then(Value::as_str),
                row.get(1).and_then(Value::as_u64),
            ) {
                inventory.nodes.insert(label.to_string(), count);
            }
        }

        let edges = self
            .run("MATCH ()-[r]->() RETURN type(r), count(*)", json!({}), false)
            .await?;
        for row in edges {
            if let (Some(edge), Some(count)) = (
                row.first().and_then(Value::as_str),
                row.get(1).and_then(Value::as_u64),
            ) {
                inventory.edges.insert(edge.to_string(), count);
            }
        }

        inventory.constraints = self
            .run(dialect.list_constraints(), json!({}), false)
            .await?
            .into_iter()
            .filter_map(|row| row.first().and_then(Value::as_str).map(str::to_string))
            .collect();

        Ok(inventory)
    }

    async fn edge_pairs(&self, edge_type: &str) -> ProjectionResult<Vec<(i64, i64)>> {
        check_label(edge_type)?;
        let statement = format!(
            "MATCH (a)-[:`{}`]->(b) RETURN a.id, b.id ORDER BY a.id, b.id",
            edge_type
        );
        Ok(self
            .run(&statement, json!({}), false)
            .await?
            .into_iter()
            .filter_map(|row| Some((row.first()?.as_i64()?, row.get(1)?.as_i64()?)))
            .collect())
    }
}
