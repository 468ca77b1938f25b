//! Document projection: one nested aggregate per group

use super::{attribute_map, canonical_ids, log_stage, named_ref, BuildContext, Granularity, ProjectionStats, Projector, TargetInventory};
use crate::error::ProjectionResult;
use crate::schema::{EntityKind, SchemaRegistry};
use crate::source::{Extractor, JoinSpec, Snapshot};
use crate::targets::{DocumentStore, IndexSpec, TargetKind};
use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

const DOCUMENTS: &str = "documents";

pub struct DocumentProjector {
    registry: Arc<SchemaRegistry>,
    store: Arc<dyn DocumentStore>,
    collection: String,
}

impl DocumentProjector {
    pub fn new(registry: Arc<SchemaRegistry>, store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self {
            registry,
            store,
            collection: collection.into(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Every group document, in insertion order
    pub async fn documents(&self) -> ProjectionResult<Vec<Value>> {
        self.store.find_all(&self.collection).await
    }

    /// Groups whose embedded student list holds this student
    pub async fn groups_of_student(&self, student_id: i64) -> ProjectionResult<Vec<Value>> {
        self.store
            .find(&self.collection, "students.id", &Value::from(student_id))
            .await
    }

    fn indexes(&self) -> Vec<IndexSpec> {
        vec![
            IndexSpec::new(format!("{}_id_unique", self.collection), "id", true),
            IndexSpec::new(format!("{}_name", self.collection), "name", false),
            IndexSpec::new(format!("{}_students_id", self.collection), "students.id", false),
        ]
    }

    /// Embedded student entries per group id, ordered by student id
    async fn students_by_group(
        &self,
        snapshot: &Snapshot<'_>,
        stats: &mut ProjectionStats,
    ) -> ProjectionResult<BTreeMap<i64, Vec<Value>>> {
        let def = self.registry.entity(EntityKind::Student)?;
        let rows = snapshot.rows(JoinSpec::of(EntityKind::Student))?;
        let mut groups: BTreeMap<i64, Vec<Value>> = BTreeMap::new();

        let mut stream = rows.stream();
        while let Some(row) = stream.try_next().await? {
            stats.extracted(EntityKind::Student);
            let Some(group_id) = row.id_of("group_id")? else {
                continue;
            };
            let mut entry = Map::new();
            entry.insert("id".to_string(), Value::from(row.id));
            entry.extend(attribute_map(def, &row)?);
            groups.entry(group_id).or_default().push(Value::Object(entry));
        }

        Ok(groups)
    }

    async fn project(&self, snapshot: &Snapshot<'_>, ctx: &BuildContext, stats: &mut ProjectionStats) -> ProjectionResult<()> {
        let group_def = self.registry.entity(EntityKind::Group)?;

        ctx.check("document collection")?;
        log_stage(TargetKind::Document, "collection");
        if self.store.drop_collection(&self.collection).await? {
            stats.removed += 1;
        }
        self.store.create_collection(&self.collection).await?;

        ctx.check("document students")?;
        let mut students = self.students_by_group(snapshot, stats).await?;

        ctx.check("document groups")?;
        log_stage(TargetKind::Document, "groups");
        let mut unresolved = canonical_ids(snapshot, EntityKind::Group).await?;
        let rows = snapshot.rows(
            JoinSpec::of(EntityKind::Group)
                .up(EntityKind::Department)
                .up(EntityKind::Institute)
                .up(EntityKind::University),
        )?;
        let mut stream = rows.stream();
        while let Some(row) = stream.try_next().await? {
            stats.extracted(EntityKind::Group);
            unresolved.remove(&row.id);

            let members = students.remove(&row.id).unwrap_or_default();
            let mut document = Map::new();
            document.insert("id".to_string(), Value::from(row.id));
            document.extend(attribute_map(group_def, &row)?);
            document.insert("department".to_string(), named_ref(&row, "department")?);
            document.insert("institute".to_string(), named_ref(&row, "institute")?);
            document.insert("university".to_string(), named_ref(&row, "university")?);
            document.insert("student_count".to_string(), json!(members.len()));
            document.insert("students".to_string(), Value::Array(members));

            let written = self.store.insert(&self.collection, &Value::Object(document)).await;
            stats.absorb(DOCUMENTS, written)?;
        }

        for id in unresolved {
            stats.gap(EntityKind::Group, id, "does not resolve to a department, institute and university");
        }
        for (group_id, members) in &students {
            for id in members.iter().filter_map(|m| m.get("id").and_then(Value::as_i64)) {
                stats.gap(EntityKind::Student, id, &format!("references group {} which has no document", group_id));
            }
        }

        ctx.check("document indexes")?;
        log_stage(TargetKind::Document, "indexes");
        for index in self.indexes() {
            let result = self.store.create_index(&self.collection, &index).await;
            stats.degrade(result)?;
        }

        info!(
            collection = %self.collection,
            count = stats.written.get(DOCUMENTS).copied().unwrap_or(0),
            "Projected group documents"
        );
        Ok(())
    }
}

#[async_trait]
impl Projector for DocumentProjector {
    fn target(&self) -> TargetKind {
        TargetKind::Document
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
        let inventory = self.store.inventory(&self.collection).await?;
        let mut structures = Vec::new();
        if inventory.exists {
            structures.push(self.collection.clone());
            structures.extend(inventory.indexes.iter().cloned());
        }
        Ok(TargetInventory {
            target: TargetKind::Document,
            units: inventory.documents,
            structures,
            detail: serde_json::to_value(&inventory).unwrap_or_default(),
        })
    }

    async fn teardown(&self, granularity: Granularity, ctx: &BuildContext, stats: &mut ProjectionStats) -> ProjectionResult<()> {
        ctx.check("document teardown")?;

        match granularity {
            Granularity::Data => {
                stats.removed += self.store.delete_all(&self.collection).await?;
            }
            Granularity::Structure => {
                let documents = self.store.inventory(&self.collection).await?.documents;
                if self.store.drop_collection(&self.collection).await? {
                    stats.removed += documents;
                }
            }
        }

        info!(collection = %self.collection, removed = stats.removed, granularity = ?granularity, "Cleared documents");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProjectionError;
    use crate::lifecycle::CancelToken;
    use crate::projection::fixtures;
    use crate::schema::university_registry;
    use crate::targets::MemoryDocuments;
    use pretty_assertions::assert_eq;

    fn projector(store: Arc<MemoryDocuments>) -> DocumentProjector {
        DocumentProjector::new(Arc::new(university_registry().unwrap()), store, "groups")
    }

    fn ctx() -> BuildContext {
        BuildContext::new(CancelToken::new())
    }

    #[tokio::test]
    async fn test_groups_embed_students_and_ancestors() {
        let (extractor, _) = fixtures::seeded().await;
        let documents = projector(Arc::new(MemoryDocuments::new()));

        let stats = fixtures::build(&documents, &extractor, &ctx()).await.unwrap();
        assert!(stats.warnings.is_empty());

        let groups = documents.documents().await.unwrap();
        assert_eq!(groups.len(), 4);

        let mut embedded = 0;
        for group in &groups {
            let students = group["students"].as_array().unwrap();
            assert_eq!(group["student_count"].as_u64().unwrap() as usize, students.len());
            embedded += students.len();
        }
        assert_eq!(embedded, 19);

        let first = &groups[0];
        assert_eq!(first["name"], "ПИ-101");
        assert_eq!(first["department"]["name"], "Кафедра программной инженерии");
        assert_eq!(first["institute"]["name"], "Институт компьютерных наук");
        assert_eq!(first["university"]["name"], "Московский Государственный Университет");
    }

    #[tokio::test]
    async fn test_lookup_by_embedded_student() {
        let (extractor, _) = fixtures::seeded().await;
        let documents = projector(Arc::new(MemoryDocuments::new()));
        fixtures::build(&documents, &extractor, &ctx()).await.unwrap();

        let found = documents.groups_of_student(1).await.unwrap();
        assert_eq!(found.len(), 1);
        let ids: Vec<i64> = found[0]["students"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["id"].as_i64().unwrap())
            .collect();
        assert!(ids.contains(&1));
    }

    #[tokio::test]
    async fn test_rebuild_replaces_collection() {
        let (extractor, _) = fixtures::seeded().await;
        let store = Arc::new(MemoryDocuments::new());
        let documents = projector(store.clone());

        fixtures::build(&documents, &extractor, &ctx()).await.unwrap();
        let first = store.fingerprint().await;
        fixtures::build(&documents, &extractor, &ctx()).await.unwrap();
        assert_eq!(store.fingerprint().await, first);
        assert_eq!(documents.documents().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_student_of_missing_group_fails_target() {
        let mut dataset = fixtures::reference();
        dataset.push(
            EntityKind::Student,
            vec![
                ("id_group", Value::from(99)),
                ("fio", Value::from("Сидоров Иван")),
                ("date_of_recipient", Value::from("2020-09-01")),
            ],
        );
        let (extractor, _) = fixtures::seeded_with(dataset).await;
        let documents = projector(Arc::new(MemoryDocuments::new()));

        let stats = fixtures::build(&documents, &extractor, &ctx()).await.unwrap();
        assert_eq!(stats.errors.len(), 1);
        assert!(matches!(stats.errors[0], ProjectionError::ReferentialGap(ref m) if m.contains("student row 20")));
        assert_eq!(stats.extracted.get(&EntityKind::Student), Some(&20));

        // Only students whose group exists are embedded
        let groups = documents.documents().await.unwrap();
        assert_eq!(groups.len(), 4);
        let embedded: usize = groups.iter().map(|g| g["students"].as_array().unwrap().len()).sum();
        assert_eq!(embedded, 19);
        assert!(documents.groups_of_student(20).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_group_with_missing_department_fails_target() {
        let mut dataset = fixtures::reference();
        dataset.push(
            EntityKind::Group,
            vec![
                ("id_kafedr_a", Value::from(99)),
                ("name", Value::from("ПИ-999")),
                ("startyear", Value::from("2020-09-01")),
                ("endyear", Value::from("2024-06-30")),
            ],
        );
        let (extractor, _) = fixtures::seeded_with(dataset).await;
        let documents = projector(Arc::new(MemoryDocuments::new()));

        let stats = fixtures::build(&documents, &extractor, &ctx()).await.unwrap();
        assert_eq!(stats.errors.len(), 1);
        assert!(matches!(stats.errors[0], ProjectionError::ReferentialGap(ref m) if m.contains("group row 5")));
        assert_eq!(documents.documents().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_build() {
        let (extractor, _) = fixtures::seeded().await;
        let store = Arc::new(MemoryDocuments::new());
        store.set_available(false);

        let result = fixtures::build(&projector(store), &extractor, &ctx()).await;
        assert!(matches!(result, Err(ProjectionError::TargetUnavailable(_))));
    }

    #[tokio::test]
    async fn test_teardown_granularity() {
        let (extractor, _) = fixtures::seeded().await;
        let documents = projector(Arc::new(MemoryDocuments::new()));
        fixtures::build(&documents, &extractor, &ctx()).await.unwrap();

        let stats = fixtures::teardown(&documents, Granularity::Data, &ctx()).await.unwrap();
        assert_eq!(stats.removed, 4);
        let inventory = documents.inventory().await.unwrap();
        assert_eq!(inventory.units, 0);
        assert_eq!(
            inventory.structures,
            vec!["groups", "groups_id_unique", "groups_name", "groups_students_id"]
        );

        fixtures::teardown(&documents, Granularity::Structure, &ctx()).await.unwrap();
        assert!(documents.inventory().await.unwrap().is_empty(Granularity::Structure));
    }
}
