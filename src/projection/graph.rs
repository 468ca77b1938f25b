//! Graph projection: one node label per entity type, one edge per foreign key,
//! plus the synthesized `ATTENDED` edge from students to lectures.

use super::{attribute_map, log_stage, BuildContext, Granularity, ProjectionStats, Projector, TargetInventory};
use crate::error::{ProjectionError, ProjectionResult};
use crate::schema::{EntityKind, Relation, SchemaRegistry, ATTENDED_EDGE};
use crate::source::{Extractor, JoinSpec, RowSet, Snapshot};
use crate::targets::{EdgeRef, GraphStore, TargetKind};
use async_trait::async_trait;
use futures::TryStreamExt;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, warn};

const KEY: &str = "id";

pub struct GraphProjector {
    registry: Arc<SchemaRegistry>,
    store: Arc<dyn GraphStore>,
}

impl GraphProjector {
    pub fn new(registry: Arc<SchemaRegistry>, store: Arc<dyn GraphStore>) -> Self {
        Self { registry, store }
    }

    /// Distinct (student, lecture) pairs currently linked by `ATTENDED`
    pub async fn attended_pairs(&self) -> ProjectionResult<Vec<(i64, i64)>> {
        self.store.edge_pairs(ATTENDED_EDGE).await
    }

    /// Every edge type the projection writes, without repeats
    fn edge_types(&self) -> Vec<&'static str> {
        let mut seen = BTreeSet::new();
        self.registry
            .relations()
            .iter()
            .map(|r| r.edge)
            .chain(std::iter::once(ATTENDED_EDGE))
            .filter(|edge| seen.insert(*edge))
            .collect()
    }

    /// Remove edges first, then nodes children-first
    async fn clear(&self, stats: &mut ProjectionStats) -> ProjectionResult<()> {
        for edge in self.edge_types() {
            stats.removed += self.store.delete_edges(edge).await?;
        }
        for kind in self.registry.teardown_order() {
            let label = self.registry.entity(kind)?.label;
            stats.removed += self.store.delete_nodes(label).await?;
        }
        Ok(())
    }

    async fn project(&self, snapshot: &Snapshot<'_>, ctx: &BuildContext, stats: &mut ProjectionStats) -> ProjectionResult<()> {
        ctx.check("graph constraints")?;
        log_stage(TargetKind::Graph, "constraints");
        for &kind in self.registry.creation_order() {
            let label = self.registry.entity(kind)?.label;
            let result = self.store.ensure_unique(label, KEY).await;
            stats.degrade(result)?;
        }

        ctx.check("graph clear")?;
        log_stage(TargetKind::Graph, "clear");
        self.clear(stats).await?;

        let mut projected: HashMap<EntityKind, HashSet<i64>> = HashMap::new();
        let mut blocked: HashSet<EntityKind> = HashSet::new();
        for &kind in self.registry.creation_order() {
            ctx.check(kind.alias())?;
            if blocked.contains(&kind) {
                warn!(entity = %kind, "Skipping entity type after an upstream referential gap");
                continue;
            }

            match self.project_kind(snapshot, kind, &mut projected, stats).await {
                Ok(()) => {}
                Err(e @ ProjectionError::ReferentialGap(_)) => {
                    error!(entity = %kind, error = %e, "Stopping entity type");
                    stats.errors.push(e);
                    blocked.insert(kind);
                    blocked.extend(self.registry.descendants(kind));
                }
                Err(e) => return Err(e),
            }
        }

        ctx.check("attendance")?;
        if blocked.contains(&EntityKind::VisitRecord) || blocked.contains(&EntityKind::Lecture) {
            warn!("Skipping {} edges, visits or lectures are incomplete", ATTENDED_EDGE);
        } else if let Err(e) = self.project_attendance(snapshot, stats).await {
            match e {
                ProjectionError::ReferentialGap(_) => {
                    error!(error = %e, "Stopping {} edges", ATTENDED_EDGE);
                    stats.errors.push(e);
                }
                other => return Err(other),
            }
        }

        Ok(())
    }

    /// Nodes of one type, each followed by its edges to already projected parents.
    /// No node is written unless every row's parents resolve.
    async fn project_kind(
        &self,
        snapshot: &Snapshot<'_>,
        kind: EntityKind,
        projected: &mut HashMap<EntityKind, HashSet<i64>>,
        stats: &mut ProjectionStats,
    ) -> ProjectionResult<()> {
        let def = self.registry.entity(kind)?;
        let parents = self
            .registry
            .parents(kind)
            .into_iter()
            .map(|rel| Ok((*rel, self.registry.entity(rel.parent)?.label)))
            .collect::<ProjectionResult<Vec<(Relation, &'static str)>>>()?;

        let rows = snapshot.rows(JoinSpec::of(kind))?;
        Self::resolve_parents(&rows, kind, &parents, projected, stats).await?;

        let mut ids = HashSet::new();
        let mut stream = rows.stream();
        while let Some(row) = stream.try_next().await? {
            let props = attribute_map(def, &row)?;
            let written = self.store.merge_node(def.label, row.id, &props).await;
            if !stats.absorb(def.label, written)? {
                continue;
            }
            ids.insert(row.id);

            for (rel, parent_label) in &parents {
                let Some(parent_id) = row.id_of(&rel.field())? else {
                    continue;
                };
                let edge = EdgeRef {
                    from_label: def.label,
                    from_id: row.id,
                    edge_type: rel.edge,
                    to_label: parent_label,
                    to_id: parent_id,
                };
                let written = self.store.merge_edge(&edge).await;
                stats.absorb(rel.edge, written)?;
            }
        }

        info!(entity = %kind, count = ids.len(), "Projected graph nodes");
        projected.insert(kind, ids);
        Ok(())
    }

    /// Count the rows of one type and fail with `ReferentialGap` when any
    /// non-null parent reference points at a node this run did not project
    async fn resolve_parents(
        rows: &RowSet<'_>,
        kind: EntityKind,
        parents: &[(Relation, &'static str)],
        projected: &HashMap<EntityKind, HashSet<i64>>,
        stats: &mut ProjectionStats,
    ) -> ProjectionResult<()> {
        let mut dangling: Vec<String> = Vec::new();
        let mut stream = rows.stream();
        while let Some(row) = stream.try_next().await? {
            stats.extracted(kind);
            for (rel, parent_label) in parents {
                let Some(parent_id) = row.id_of(&rel.field())? else {
                    continue;
                };
                let resolved = projected
                    .get(&rel.parent)
                    .is_some_and(|ids| ids.contains(&parent_id));
                if !resolved {
                    dangling.push(format!("{}:{} -[{}]-> {}:{}", kind, row.id, rel.edge, parent_label, parent_id));
                }
            }
        }

        match dangling.first() {
            None => Ok(()),
            Some(first) => Err(ProjectionError::ReferentialGap(format!(
                "{} {} reference(s) to parents that were not projected, first {}",
                dangling.len(),
                kind,
                first
            ))),
        }
    }

    /// One `ATTENDED` edge per distinct (student, lecture) pair reached
    /// through visits and their schedule entries
    async fn project_attendance(&self, snapshot: &Snapshot<'_>, stats: &mut ProjectionStats) -> ProjectionResult<()> {
        let student = self.registry.entity(EntityKind::Student)?.label;
        let lecture = self.registry.entity(EntityKind::Lecture)?.label;

        let rows = snapshot.rows(JoinSpec::of(EntityKind::VisitRecord).up(EntityKind::ScheduleEntry))?;
        let mut pairs = BTreeSet::new();
        let mut stream = rows.stream();
        while let Some(row) = stream.try_next().await? {
            let student_id = row.id_of("student_id")?;
            let lecture_id = row.id_of("schedule_entry_lecture_id")?;
            if let (Some(s), Some(l)) = (student_id, lecture_id) {
                pairs.insert((s, l));
            }
        }

        for (student_id, lecture_id) in &pairs {
            let edge = EdgeRef {
                from_label: student,
                from_id: *student_id,
                edge_type: ATTENDED_EDGE,
                to_label: lecture,
                to_id: *lecture_id,
            };
            let written = self.store.merge_edge(&edge).await;
            stats.absorb(ATTENDED_EDGE, written)?;
        }

        info!(count = pairs.len(), "Projected {} edges", ATTENDED_EDGE);
        Ok(())
    }
}

#[async_trait]
impl Projector for GraphProjector {
    fn target(&self) -> TargetKind {
        TargetKind::Graph
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
        let inventory = self.store.inventory().await?;
        Ok(TargetInventory {
            target: TargetKind::Graph,
            units: inventory.node_total() + inventory.edge_total(),
            structures: inventory.constraints.clone(),
            detail: serde_json::to_value(&inventory).unwrap_or_default(),
        })
    }

    async fn teardown(&self, granularity: Granularity, ctx: &BuildContext, stats: &mut ProjectionStats) -> ProjectionResult<()> {
        ctx.check("graph clear")?;
        self.clear(stats).await?;

        if granularity == Granularity::Structure {
            ctx.check("graph constraints")?;
            for kind in self.registry.teardown_order() {
                let label = self.registry.entity(kind)?.label;
                let result = self.store.drop_unique(label, KEY).await;
                stats.degrade(result)?;
            }
        }

        info!(removed = stats.removed, granularity = ?granularity, "Cleared graph");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::CancelToken;
    use crate::projection::fixtures;
    use crate::schema::university_registry;
    use crate::targets::MemoryGraph;
    use pretty_assertions::assert_eq;

    fn projector(store: Arc<MemoryGraph>) -> GraphProjector {
        GraphProjector::new(Arc::new(university_registry().unwrap()), store)
    }

    fn ctx() -> BuildContext {
        BuildContext::new(CancelToken::new())
    }

    #[tokio::test]
    async fn test_build_projects_every_row_and_deduplicates_attendance() {
        let (extractor, _) = fixtures::seeded().await;
        let dataset = fixtures::reference();
        let store = Arc::new(MemoryGraph::new());
        let graph = projector(store.clone());

        let stats = fixtures::build(&graph, &extractor, &ctx()).await.unwrap();
        assert!(stats.errors.is_empty());

        let inventory = store.inventory().await.unwrap();
        assert_eq!(inventory.node_total(), 96);
        assert_eq!(inventory.nodes.get("Student"), Some(&19));
        assert_eq!(inventory.edges.get("MEMBER_OF"), Some(&19));
        assert_eq!(inventory.constraints.len(), 11);

        // Expected pairs straight from the dataset
        let schedule: std::collections::BTreeMap<i64, i64> = dataset
            .rows(EntityKind::ScheduleEntry)
            .iter()
            .map(|r| (r.id, r.columns["id_lect"].as_i64().unwrap()))
            .collect();
        let expected: BTreeSet<(i64, i64)> = dataset
            .rows(EntityKind::VisitRecord)
            .iter()
            .map(|r| {
                let student = r.columns["id_student"].as_i64().unwrap();
                let rasp = r.columns["id_rasp"].as_i64().unwrap();
                (student, schedule[&rasp])
            })
            .collect();

        let pairs = graph.attended_pairs().await.unwrap();
        assert_eq!(pairs, expected.into_iter().collect::<Vec<_>>());
        assert!(pairs.len() <= 30);
    }

    #[tokio::test]
    async fn test_rebuild_is_idempotent() {
        let (extractor, _) = fixtures::seeded().await;
        let store = Arc::new(MemoryGraph::new());
        let graph = projector(store.clone());

        fixtures::build(&graph, &extractor, &ctx()).await.unwrap();
        let first = store.fingerprint().await;
        let second_stats = fixtures::build(&graph, &extractor, &ctx()).await.unwrap();
        assert_eq!(store.fingerprint().await, first);
        assert!(second_stats.removed > 0);
    }

    #[tokio::test]
    async fn test_old_server_degrades_constraints() {
        let (extractor, _) = fixtures::seeded().await;
        let store = Arc::new(MemoryGraph::without_constraints());
        let graph = projector(store.clone());

        let stats = fixtures::build(&graph, &extractor, &ctx()).await.unwrap();
        assert_eq!(stats.warnings.len(), 11);
        assert!(stats.errors.is_empty());
        assert_eq!(store.inventory().await.unwrap().node_total(), 96);
    }

    #[tokio::test]
    async fn test_referential_gap_stops_type_and_descendants() {
        use serde_json::Value;

        let mut dataset = fixtures::reference();
        // A student in a group that does not exist
        dataset.push(
            EntityKind::Student,
            vec![
                ("id_group", Value::from(99)),
                ("fio", Value::from("Сидоров Иван")),
                ("date_of_recipient", Value::from("2020-09-01")),
            ],
        );
        let (extractor, _) = fixtures::seeded_with(dataset).await;
        let store = Arc::new(MemoryGraph::new());
        let graph = projector(store.clone());

        let stats = fixtures::build(&graph, &extractor, &ctx()).await.unwrap();
        assert_eq!(stats.errors.len(), 1);
        assert!(matches!(stats.errors[0], ProjectionError::ReferentialGap(_)));

        let inventory = store.inventory().await.unwrap();
        // The stopped type leaves no node behind, orphan or otherwise
        assert_eq!(inventory.nodes.get("Student"), None);
        assert_eq!(inventory.edges.get("MEMBER_OF"), None);
        assert_eq!(inventory.nodes.get("VisitRecord"), None);
        assert_eq!(inventory.edges.get(ATTENDED_EDGE), None);
        assert_eq!(stats.extracted.get(&EntityKind::Student), Some(&20));
        assert_eq!(stats.written.get("Student"), None);
        // Unrelated types still project
        assert_eq!(inventory.nodes.get("Material"), Some(&5));
        assert_eq!(inventory.nodes.get("ScheduleEntry"), Some(&10));
        assert_eq!(inventory.nodes.get("Group"), Some(&4));
    }

    #[tokio::test]
    async fn test_teardown_granularity() {
        let (extractor, _) = fixtures::seeded().await;
        let store = Arc::new(MemoryGraph::new());
        let graph = projector(store.clone());

        fixtures::build(&graph, &extractor, &ctx()).await.unwrap();
        fixtures::teardown(&graph, Granularity::Data, &ctx()).await.unwrap();
        let after_data = graph.inventory().await.unwrap();
        assert_eq!(after_data.units, 0);
        assert_eq!(after_data.structures.len(), 11);

        fixtures::teardown(&graph, Granularity::Structure, &ctx()).await.unwrap();
        assert!(graph.inventory().await.unwrap().is_empty(Granularity::Structure));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_build() {
        let (extractor, _) = fixtures::seeded().await;
        let store = Arc::new(MemoryGraph::new());
        store.set_available(false);
        let result = fixtures::build(&projector(store), &extractor, &ctx()).await;
        assert!(matches!(result, Err(ProjectionError::TargetUnavailable(_))));
    }
}
