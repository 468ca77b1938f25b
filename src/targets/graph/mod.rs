//! Graph target family

mod memory;
mod neo4j;

pub use memory::MemoryGraph;
pub use neo4j::Neo4jGraph;

use crate::error::ProjectionResult;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A directed edge between two nodes addressed by label and id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeRef<'a> {
    pub from_label: &'a str,
    pub from_id: i64,
    pub edge_type: &'a str,
    pub to_label: &'a str,
    pub to_id: i64,
}

/// Batch read-back of a graph store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphInventory {
    pub nodes: BTreeMap<String, u64>,
    pub edges: BTreeMap<String, u64>,
    pub constraints: Vec<String>,
}

impl GraphInventory {
    pub fn node_total(&self) -> u64 {
        self.nodes.values().sum()
    }

    pub fn edge_total(&self) -> u64 {
        self.edges.values().sum()
    }
}

/// Minimal capability set of a property graph
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Backend and dialect, for logs and reports
    fn describe(&self) -> String;

    /// Reachability check; network adapters pick their dialect here
    async fn ping(&self) -> ProjectionResult<()>;

    /// Declare `label.key` unique. `ConstraintUnsupported` when the store
    /// rejects the declaration.
    async fn ensure_unique(&self, label: &str, key: &str) -> ProjectionResult<()>;

    async fn drop_unique(&self, label: &str, key: &str) -> ProjectionResult<()>;

    /// Upsert a node by `id` and overwrite the given properties
    async fn merge_node(&self, label: &str, id: i64, props: &Map<String, Value>) -> ProjectionResult<()>;

    /// Upsert an edge. `ReferentialGap` when either endpoint is missing.
    async fn merge_edge(&self, edge: &EdgeRef<'_>) -> ProjectionResult<()>;

    /// Delete every edge of a type; returns how many went
    async fn delete_edges(&self, edge_type: &str) -> ProjectionResult<u64>;

    /// Delete every node with a label, together with its edges
    async fn delete_nodes(&self, label: &str) -> ProjectionResult<u64>;

    async fn inventory(&self) -> ProjectionResult<GraphInventory>;

    /// Every `(from_id, to_id)` pair of an edge type, sorted
    async fn edge_pairs(&self, edge_type: &str) -> ProjectionResult<Vec<(i64, i64)>>;
}
