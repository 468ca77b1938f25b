//! Cache projection: student values, membership sets and time-ordered visits
//!
//! Keys are grouped into families by naming pattern. A rebuild purges every
//! family before writing, so nothing from an earlier canonical state survives.

use super::{attribute_map, canonical_ids, epoch_seconds, log_stage, named_ref, BuildContext, Granularity, ProjectionStats, Projector, TargetInventory};
use crate::error::{ProjectionError, ProjectionResult};
use crate::schema::{EntityKind, SchemaRegistry};
use crate::source::{Extractor, JoinSpec, Snapshot};
use crate::targets::{CacheStore, TargetKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

const REGISTRY_KEY: &str = "students:all";
const MARKER_KEY: &str = "students:info";

/// One key family: a scan pattern plus the exact shape a key must have
struct KeyFamily {
    name: &'static str,
    pattern: &'static str,
    shape: &'static Lazy<Regex>,
}

static STUDENT_VALUE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^student:\d+$").expect("valid regex"));
static REGISTRY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^students:all$").expect("valid regex"));
static GROUP_MEMBERS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^group:\d+:students$").expect("valid regex"));
static STUDENT_VISITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^student:\d+:visits$").expect("valid regex"));
static LECTURE_VISITORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^lecture:\d+:visitors$").expect("valid regex"));

static FAMILIES: [KeyFamily; 5] = [
    KeyFamily {
        name: "student values",
        pattern: "student:*",
        shape: &STUDENT_VALUE,
    },
    KeyFamily {
        name: "student registry",
        pattern: REGISTRY_KEY,
        shape: &REGISTRY,
    },
    KeyFamily {
        name: "group members",
        pattern: "group:*:students",
        shape: &GROUP_MEMBERS,
    },
    KeyFamily {
        name: "student visits",
        pattern: "student:*:visits",
        shape: &STUDENT_VISITS,
    },
    KeyFamily {
        name: "lecture visitors",
        pattern: "lecture:*:visitors",
        shape: &LECTURE_VISITORS,
    },
];

fn student_key(id: i64) -> String {
    format!("student:{}", id)
}

fn group_key(id: i64) -> String {
    format!("group:{}:students", id)
}

fn visits_key(student_id: i64) -> String {
    format!("student:{}:visits", student_id)
}

fn visitors_key(lecture_id: i64) -> String {
    format!("lecture:{}:visitors", lecture_id)
}

/// One visit stored in a student's time-ordered set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitEntry {
    pub id: i64,
    pub schedule_id: Option<i64>,
    pub lecture_id: Option<i64>,
    pub lecture_name: Option<String>,
    pub visited_at: String,
}

pub struct CacheProjector {
    registry: Arc<SchemaRegistry>,
    store: Arc<dyn CacheStore>,
}

impl CacheProjector {
    pub fn new(registry: Arc<SchemaRegistry>, store: Arc<dyn CacheStore>) -> Self {
        Self { registry, store }
    }

    pub async fn student(&self, id: i64) -> ProjectionResult<Option<Value>> {
        self.store.get_json(&student_key(id)).await
    }

    pub async fn group_members(&self, group_id: i64) -> ProjectionResult<Vec<String>> {
        self.store.set_members(&group_key(group_id)).await
    }

    pub async fn lecture_visitors(&self, lecture_id: i64) -> ProjectionResult<Vec<String>> {
        self.store.set_members(&visitors_key(lecture_id)).await
    }

    /// Visits of one student with `from <= visited_at <= to`, oldest first
    pub async fn visits_between(
        &self,
        student_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ProjectionResult<Vec<VisitEntry>> {
        let range = self
            .store
            .sorted_range(&visits_key(student_id), from.timestamp() as f64, to.timestamp() as f64)
            .await?;

        range
            .into_iter()
            .map(|(member, _)| {
                serde_json::from_str(&member).map_err(|e| {
                    ProjectionError::SchemaMismatch(format!("visit entry is not readable: {}", e))
                })
            })
            .collect()
    }

    /// Keys of one family, filtered down to the family's exact shape
    async fn family_keys(&self, family: &KeyFamily) -> ProjectionResult<Vec<String>> {
        Ok(self
            .store
            .scan(family.pattern)
            .await?
            .into_iter()
            .filter(|key| family.shape.is_match(key))
            .collect())
    }

    async fn purge(&self, stats: &mut ProjectionStats) -> ProjectionResult<()> {
        for family in &FAMILIES {
            let keys = self.family_keys(family).await?;
            if keys.is_empty() {
                continue;
            }
            let removed = self.store.delete(&keys).await?;
            debug!(family = family.name, removed, "Purged key family");
            stats.removed += removed;
        }
        Ok(())
    }

    async fn project(&self, snapshot: &Snapshot<'_>, ctx: &BuildContext, stats: &mut ProjectionStats) -> ProjectionResult<()> {
        ctx.check("cache purge")?;
        log_stage(TargetKind::Cache, "purge");
        self.purge(stats).await?;

        ctx.check("cache students")?;
        log_stage(TargetKind::Cache, "students");
        let projected = self.project_students(snapshot, stats).await?;

        ctx.check("cache visits")?;
        log_stage(TargetKind::Cache, "visits");
        let visits = self.project_visits(snapshot, &projected, stats).await?;

        let marker = json!({
            "students": projected.len(),
            "visits": visits,
        });
        self.store.set_json(MARKER_KEY, &marker).await?;

        info!(students = projected.len(), visits, skipped = stats.skipped, "Projected cache keys");
        Ok(())
    }

    /// Student values, the registry set and group membership sets.
    /// Returns the ids that made it into the cache.
    async fn project_students(
        &self,
        snapshot: &Snapshot<'_>,
        stats: &mut ProjectionStats,
    ) -> ProjectionResult<BTreeSet<i64>> {
        let def = self.registry.entity(EntityKind::Student)?;
        let rows = snapshot.rows(
            JoinSpec::of(EntityKind::Student)
                .up(EntityKind::Group)
                .up(EntityKind::Department)
                .up(EntityKind::Institute)
                .up(EntityKind::University),
        )?;

        let mut unresolved = canonical_ids(snapshot, EntityKind::Student).await?;
        let mut projected = BTreeSet::new();
        let mut groups: BTreeMap<i64, Vec<String>> = BTreeMap::new();

        let mut stream = rows.stream();
        while let Some(row) = stream.try_next().await? {
            stats.extracted(EntityKind::Student);
            unresolved.remove(&row.id);

            let mut value = Map::new();
            value.insert("id".to_string(), Value::from(row.id));
            value.extend(attribute_map(def, &row)?);
            for alias in ["group", "department", "institute", "university"] {
                value.insert(alias.to_string(), named_ref(&row, alias)?);
            }

            let written = self.store.set_json(&student_key(row.id), &Value::Object(value)).await;
            if !stats.absorb("student values", written)? {
                continue;
            }
            projected.insert(row.id);
            if let Some(group_id) = row.id_of("group_id")? {
                groups.entry(group_id).or_default().push(row.id.to_string());
            }
        }

        for id in unresolved {
            stats.gap(EntityKind::Student, id, "does not resolve to a group, department, institute and university");
        }

        let ids: Vec<String> = projected.iter().map(i64::to_string).collect();
        let added = self.store.set_add(REGISTRY_KEY, &ids).await?;
        stats.wrote("student registry", added);

        for (group_id, members) in &groups {
            let added = self.store.set_add(&group_key(*group_id), members).await?;
            stats.wrote("group members", added);
        }

        Ok(projected)
    }

    /// Time-ordered visit entries per student plus visitor sets per lecture.
    /// Returns how many visits were stored.
    async fn project_visits(
        &self,
        snapshot: &Snapshot<'_>,
        projected: &BTreeSet<i64>,
        stats: &mut ProjectionStats,
    ) -> ProjectionResult<u64> {
        let rows = snapshot.rows(
            JoinSpec::of(EntityKind::VisitRecord)
                .up(EntityKind::ScheduleEntry)
                .up(EntityKind::Lecture),
        )?;

        let mut unresolved = canonical_ids(snapshot, EntityKind::VisitRecord).await?;
        let mut visitors: BTreeMap<i64, BTreeSet<String>> = BTreeMap::new();
        let mut stored = 0;

        let mut stream = rows.stream();
        while let Some(row) = stream.try_next().await? {
            stats.extracted(EntityKind::VisitRecord);
            unresolved.remove(&row.id);

            let Some(student_id) = row.id_of("student_id")? else {
                debug!(visit = row.id, "Skipping visit without a student");
                stats.skipped += 1;
                continue;
            };
            if !projected.contains(&student_id) {
                stats.gap(
                    EntityKind::VisitRecord,
                    row.id,
                    &format!("references student {} which is not cached", student_id),
                );
                continue;
            }
            let lecture_id = row.id_of("lecture_id")?;
            let entry = VisitEntry {
                id: row.id,
                schedule_id: row.id_of("schedule_entry_id")?,
                lecture_id,
                lecture_name: row.text("lecture_name")?.map(str::to_string),
                visited_at: row.text("visited_at")?.unwrap_or_default().to_string(),
            };
            let score = epoch_seconds(&row, "visited_at")? as f64;
            let member = serde_json::to_string(&entry)
                .map_err(|e| ProjectionError::WriteRejected(e.to_string()))?;

            let written = self.store.sorted_add(&visits_key(student_id), score, &member).await;
            if !stats.absorb("student visits", written)? {
                continue;
            }
            stored += 1;

            if let Some(lecture_id) = lecture_id {
                visitors
                    .entry(lecture_id)
                    .or_default()
                    .insert(student_id.to_string());
            }
        }

        for id in unresolved {
            stats.gap(EntityKind::VisitRecord, id, "does not resolve to a schedule entry and lecture");
        }

        for (lecture_id, students) in &visitors {
            let members: Vec<String> = students.iter().cloned().collect();
            let added = self.store.set_add(&visitors_key(*lecture_id), &members).await?;
            stats.wrote("lecture visitors", added);
        }

        Ok(stored)
    }
}

#[async_trait]
impl Projector for CacheProjector {
    fn target(&self) -> TargetKind {
        TargetKind::Cache
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
        let mut detail = Map::new();
        let mut units = 0;
        for family in &FAMILIES {
            let count = self.family_keys(family).await?.len() as u64;
            detail.insert(family.name.to_string(), Value::from(count));
            units += count;
        }

        let structures = if self.store.exists(MARKER_KEY).await? {
            vec![MARKER_KEY.to_string()]
        } else {
            Vec::new()
        };

        Ok(TargetInventory {
            target: TargetKind::Cache,
            units,
            structures,
            detail: Value::Object(detail),
        })
    }

    async fn teardown(&self, granularity: Granularity, ctx: &BuildContext, stats: &mut ProjectionStats) -> ProjectionResult<()> {
        ctx.check("cache purge")?;
        self.purge(stats).await?;

        if granularity == Granularity::Structure {
            stats.removed += self.store.delete(&[MARKER_KEY.to_string()]).await?;
        }

        info!(removed = stats.removed, granularity = ?granularity, "Cleared cache");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::CancelToken;
    use crate::projection::fixtures;
    use crate::schema::university_registry;
    use crate::source::seed::reference_epoch;
    use crate::targets::MemoryCache;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn projector(store: Arc<MemoryCache>) -> CacheProjector {
        CacheProjector::new(Arc::new(university_registry().unwrap()), store)
    }

    fn ctx() -> BuildContext {
        BuildContext::new(CancelToken::new())
    }

    #[tokio::test]
    async fn test_students_registry_and_membership() {
        let (extractor, _) = fixtures::seeded().await;
        let store = Arc::new(MemoryCache::new());
        let cache = projector(store.clone());

        fixtures::build(&cache, &extractor, &ctx()).await.unwrap();

        assert_eq!(store.scan("student:*").await.unwrap().iter().filter(|k| STUDENT_VALUE.is_match(k)).count(), 19);
        assert_eq!(store.set_members(REGISTRY_KEY).await.unwrap().len(), 19);

        let mut members = 0;
        for group in 1..=4 {
            members += cache.group_members(group).await.unwrap().len();
        }
        assert_eq!(members, 19);

        let student = cache.student(1).await.unwrap().unwrap();
        assert!(student["group"]["name"].is_string());
        assert!(student["university"]["name"].is_string());
    }

    #[tokio::test]
    async fn test_visits_are_time_ordered_and_ranged() {
        let (extractor, _) = fixtures::seeded().await;
        let dataset = fixtures::reference();
        let cache = projector(Arc::new(MemoryCache::new()));
        fixtures::build(&cache, &extractor, &ctx()).await.unwrap();

        let start = reference_epoch();
        let end = start + Duration::days(30);
        let mut total = 0;
        for student in 1..=19 {
            let visits = cache.visits_between(student, start, end).await.unwrap();
            let times: Vec<&str> = visits.iter().map(|v| v.visited_at.as_str()).collect();
            let mut sorted = times.clone();
            sorted.sort();
            assert_eq!(times, sorted);
            total += visits.len();
        }
        assert_eq!(total, dataset.count(EntityKind::VisitRecord));

        let before = cache
            .visits_between(1, start - Duration::days(2), start - Duration::days(1))
            .await
            .unwrap();
        assert!(before.is_empty());
    }

    #[tokio::test]
    async fn test_unresolved_rows_fail_target_without_orphan_keys() {
        let mut dataset = fixtures::reference();
        // A student in a missing group, and a visit by a missing student
        dataset.push(
            EntityKind::Student,
            vec![
                ("id_group", Value::from(99)),
                ("fio", Value::from("Сидоров Иван")),
                ("date_of_recipient", Value::from("2020-09-01")),
            ],
        );
        dataset.push(
            EntityKind::VisitRecord,
            vec![
                ("id_student", Value::from(77)),
                ("id_rasp", Value::from(1)),
                ("visittime", Value::from("2024-02-01T09:00:00+00:00")),
            ],
        );
        let (extractor, _) = fixtures::seeded_with(dataset).await;
        let store = Arc::new(MemoryCache::new());
        let cache = projector(store.clone());

        let stats = fixtures::build(&cache, &extractor, &ctx()).await.unwrap();
        assert_eq!(stats.errors.len(), 2);
        assert!(stats
            .errors
            .iter()
            .all(|e| matches!(e, ProjectionError::ReferentialGap(_))));
        assert_eq!(stats.extracted.get(&EntityKind::Student), Some(&20));

        assert_eq!(store.set_members(REGISTRY_KEY).await.unwrap().len(), 19);
        assert!(cache.student(20).await.unwrap().is_none());
        assert!(!store.exists(&visits_key(77)).await.unwrap());
    }

    #[tokio::test]
    async fn test_rebuild_purges_stale_keys() {
        let (extractor, _) = fixtures::seeded().await;
        let store = Arc::new(MemoryCache::new());
        let cache = projector(store.clone());

        fixtures::build(&cache, &extractor, &ctx()).await.unwrap();
        let first = store.fingerprint().await;

        store.set_raw("student:999", "{}").await;
        store.set_raw("session:42", "keep").await;
        fixtures::build(&cache, &extractor, &ctx()).await.unwrap();

        assert!(!store.exists("student:999").await.unwrap());
        assert!(store.exists("session:42").await.unwrap());
        store.delete(&["session:42".to_string()]).await.unwrap();
        assert_eq!(store.fingerprint().await, first);
    }

    #[tokio::test]
    async fn test_teardown_granularity() {
        let (extractor, _) = fixtures::seeded().await;
        let store = Arc::new(MemoryCache::new());
        let cache = projector(store.clone());
        fixtures::build(&cache, &extractor, &ctx()).await.unwrap();

        fixtures::teardown(&cache, Granularity::Data, &ctx()).await.unwrap();
        let inventory = cache.inventory().await.unwrap();
        assert_eq!(inventory.units, 0);
        assert_eq!(inventory.structures, vec![MARKER_KEY]);

        fixtures::teardown(&cache, Granularity::Structure, &ctx()).await.unwrap();
        assert!(cache.inventory().await.unwrap().is_empty(Granularity::Structure));
        assert_eq!(store.key_count().await, 0);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_teardown() {
        let (extractor, _) = fixtures::seeded().await;
        let store = Arc::new(MemoryCache::new());
        let cache = projector(store.clone());
        fixtures::build(&cache, &extractor, &ctx()).await.unwrap();

        store.set_available(false);
        let result = fixtures::teardown(&cache, Granularity::Data, &ctx()).await;
        assert!(matches!(result, Err(ProjectionError::TargetUnavailable(_))));

        store.set_available(true);
        assert_eq!(store.set_members(REGISTRY_KEY).await.unwrap().len(), 19);
    }
}
