//! In-process property graph

use super::{EdgeRef, GraphInventory, GraphStore};
use crate::error::{ProjectionError, ProjectionResult};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

type NodeKey = (String, i64);

/// (edge type, from label, from id, to label, to id)
type EdgeKey = (String, String, i64, String, i64);

#[derive(Debug, Default)]
struct GraphState {
    nodes: BTreeMap<NodeKey, Map<String, Value>>,
    edges: BTreeSet<EdgeKey>,
    /// (label, key)
    constraints: BTreeSet<(String, String)>,
}

/// Property graph held in memory
pub struct MemoryGraph {
    state: RwLock<GraphState>,
    available: AtomicBool,
    constraints_supported: bool,
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
            available: AtomicBool::new(true),
            constraints_supported: true,
        }
    }

    /// A graph that rejects every constraint declaration, like an old server
    #[cfg(test)]
    pub fn without_constraints() -> Self {
        Self {
            constraints_supported: false,
            ..Self::new()
        }
    }

    #[cfg(test)]
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// sha256 over every node, edge and constraint
    #[cfg(test)]
    pub async fn fingerprint(&self) -> String {
        let state = self.state.read().await;
        let nodes = state.nodes.iter().map(|((label, id), props)| {
            format!("node|{}|{}|{}", label, id, Value::Object(props.clone()))
        });
        let edges = state
            .edges
            .iter()
            .map(|(t, fl, fi, tl, ti)| format!("edge|{}|{}:{}|{}:{}", t, fl, fi, tl, ti));
        let constraints = state
            .constraints
            .iter()
            .map(|(label, key)| format!("unique|{}|{}", label, key));
        crate::targets::fingerprint_lines(nodes.chain(edges).chain(constraints))
    }

    fn check_available(&self) -> ProjectionResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProjectionError::TargetUnavailable(
                "in-memory graph is offline".to_string(),
            ))
        }
    }
}

#[async_trait]
impl GraphStore for MemoryGraph {
    fn describe(&self) -> String {
        "memory graph".to_string()
    }

    async fn ping(&self) -> ProjectionResult<()> {
        self.check_available()
    }

    async fn ensure_unique(&self, label: &str, key: &str) -> ProjectionResult<()> {
        self.check_available()?;
        if !self.constraints_supported {
            return Err(ProjectionError::ConstraintUnsupported(format!(
                "uniqueness on {}.{} is not supported",
                label, key
            )));
        }
        self.state
            .write()
            .await
            .constraints
            .insert((label.to_string(), key.to_string()));
        Ok(())
    }

    async fn drop_unique(&self, label: &str, key: &str) -> ProjectionResult<()> {
        self.check_available()?;
        self.state
            .write()
            .await
            .constraints
            .remove(&(label.to_string(), key.to_string()));
        Ok(())
    }

    async fn merge_node(&self, label: &str, id: i64, props: &Map<String, Value>) -> ProjectionResult<()> {
        self.check_available()?;
        let mut state = self.state.write().await;

        // Unique keys other than the merge key are checked against the label's other nodes
        for (c_label, key) in &state.constraints {
            if c_label != label || key == "id" {
                continue;
            }
            if let Some(value) = props.get(key) {
                let clash = state.nodes.iter().any(|((l, other), p)| {
                    l == label && *other != id && p.get(key) == Some(value)
                });
                if clash {
                    return Err(ProjectionError::WriteRejected(format!(
                        "{}.{} = {} already exists",
                        label, key, value
                    )));
                }
            }
        }

        let node = state.nodes.entry((label.to_string(), id)).or_default();
        node.insert("id".to_string(), Value::from(id));
        for (k, v) in props {
            node.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    async fn merge_edge(&self, edge: &EdgeRef<'_>) -> ProjectionResult<()> {
        self.check_available()?;
        let mut state = self.state.write().await;

        for (label, id) in [(edge.from_label, edge.from_id), (edge.to_label, edge.to_id)] {
            if !state.nodes.contains_key(&(label.to_string(), id)) {
                return Err(ProjectionError::ReferentialGap(format!(
                    "{} -[{}]-> {}: node {}:{} does not exist",
                    edge.from_label, edge.edge_type, edge.to_label, label, id
                )));
            }
        }

        state.edges.insert((
            edge.edge_type.to_string(),
            edge.from_label.to_string(),
            edge.from_id,
            edge.to_label.to_string(),
            edge.to_id,
        ));
        Ok(())
    }

    async fn delete_edges(&self, edge_type: &str) -> ProjectionResult<u64> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let before = state.edges.len();
        state.edges.retain(|(t, ..)| t != edge_type);
        Ok((before - state.edges.len()) as u64)
    }

    async fn delete_nodes(&self, label: &str) -> ProjectionResult<u64> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let before = state.nodes.len();
        state.nodes.retain(|(l, _), _| l != label);
        state.edges.retain(|(_, fl, _, tl, _)| fl != label && tl != label);
        Ok((before - state.nodes.len()) as u64)
    }

    async fn inventory(&self) -> ProjectionResult<GraphInventory> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut inventory = GraphInventory::default();
        for (label, _) in state.nodes.keys() {
            *inventory.nodes.entry(label.clone()).or_default() += 1;
        }
        for (edge_type, ..) in &state.edges {
            *inventory.edges.entry(edge_type.clone()).or_default() += 1;
        }
        inventory.constraints = state
            .constraints
            .iter()
            .map(|(label, key)| format!("{}.{} IS UNIQUE", label, key))
            .collect();
        Ok(inventory)
    }

    async fn edge_pairs(&self, edge_type: &str) -> ProjectionResult<Vec<(i64, i64)>> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut pairs: Vec<(i64, i64)> = state
            .edges
            .iter()
            .filter(|(t, ..)| t == edge_type)
            .map(|(_, _, from, _, to)| (*from, *to))
            .collect();
        pairs.sort_unstable();
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn props(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn test_edge_needs_both_endpoints() {
        let graph = MemoryGraph::new();
        graph.merge_node("Student", 1, &props(json!({"full_name": "A"}))).await.unwrap();

        let edge = EdgeRef {
            from_label: "Student",
            from_id: 1,
            edge_type: "MEMBER_OF",
            to_label: "Group",
            to_id: 7,
        };
        assert!(matches!(
            graph.merge_edge(&edge).await,
            Err(ProjectionError::ReferentialGap(_))
        ));

        graph.merge_node("Group", 7, &Map::new()).await.unwrap();
        graph.merge_edge(&edge).await.unwrap();
        graph.merge_edge(&edge).await.unwrap();

        let inventory = graph.inventory().await.unwrap();
        assert_eq!(inventory.edge_total(), 1);
        assert_eq!(inventory.node_total(), 2);
    }

    #[tokio::test]
    async fn test_unique_constraint_rejects_clash() {
        let graph = MemoryGraph::new();
        graph.ensure_unique("Specialty", "code").await.unwrap();
        graph.merge_node("Specialty", 1, &props(json!({"code": "09.03.04"}))).await.unwrap();

        let clash = graph.merge_node("Specialty", 2, &props(json!({"code": "09.03.04"}))).await;
        assert!(matches!(clash, Err(ProjectionError::WriteRejected(_))));
    }

    #[tokio::test]
    async fn test_delete_nodes_detaches_edges() {
        let graph = MemoryGraph::new();
        graph.merge_node("Group", 1, &Map::new()).await.unwrap();
        graph.merge_node("Student", 2, &Map::new()).await.unwrap();
        graph
            .merge_edge(&EdgeRef {
                from_label: "Student",
                from_id: 2,
                edge_type: "MEMBER_OF",
                to_label: "Group",
                to_id: 1,
            })
            .await
            .unwrap();

        assert_eq!(graph.delete_nodes("Group").await.unwrap(), 1);
        assert_eq!(graph.inventory().await.unwrap().edge_total(), 0);
    }

    #[tokio::test]
    async fn test_old_server_rejects_constraints() {
        let graph = MemoryGraph::without_constraints();
        assert!(matches!(
            graph.ensure_unique("Student", "id").await,
            Err(ProjectionError::ConstraintUnsupported(_))
        ));
    }
}
