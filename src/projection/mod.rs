//! Projectors
//!
//! A projector turns canonical rows into one target family's native shape.
//! All four share the [`Projector`] contract so the orchestrator can drive
//! them without knowing which store sits behind each one.

mod cache;
mod document;
mod graph;
mod search;

pub use cache::{CacheProjector, VisitEntry};
pub use document::DocumentProjector;
pub use graph::GraphProjector;
pub use search::SearchProjector;

use crate::error::{ProjectionError, ProjectionResult};
use crate::lifecycle::CancelToken;
use crate::schema::{EntityDef, EntityKind};
use crate::source::{CanonicalRow, Extractor, JoinSpec, Snapshot};
use crate::targets::TargetKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use futures::TryStreamExt;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, warn};

/// How much of a target a teardown removes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// Empty every structure but keep it
    Data,
    /// Drop collections, indexes and constraints as well
    Structure,
}

impl Granularity {
    pub const ALL: [Granularity; 2] = [Granularity::Data, Granularity::Structure];
}

/// Per-run inputs shared by every stage
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub started_at: DateTime<Utc>,
    pub cancel: CancelToken,
}

impl BuildContext {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            started_at: Utc::now(),
            cancel,
        }
    }

    /// Stop before `stage` if the run was cancelled
    pub fn check(&self, stage: &str) -> ProjectionResult<()> {
        if self.cancel.is_cancelled() {
            Err(ProjectionError::Cancelled(format!("cancelled before {}", stage)))
        } else {
            Ok(())
        }
    }
}

/// Counters and diagnostics for one projector run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionStats {
    /// Canonical rows read, per entity type
    pub extracted: BTreeMap<EntityKind, u64>,
    /// Units written, per unit name (node label, edge type, key family, ...)
    pub written: BTreeMap<String, u64>,
    /// Units removed while clearing or tearing down
    pub removed: u64,
    /// Records skipped after a rejected write
    pub skipped: u64,
    /// Degraded declarations
    pub warnings: Vec<ProjectionError>,
    /// Errors that failed the target while other work carried on
    pub errors: Vec<ProjectionError>,
}

impl ProjectionStats {
    pub fn extracted(&mut self, kind: EntityKind) {
        *self.extracted.entry(kind).or_default() += 1;
    }

    pub fn wrote(&mut self, unit: &str, count: u64) {
        *self.written.entry(unit.to_string()).or_default() += count;
    }

    pub fn total_extracted(&self) -> u64 {
        self.extracted.values().sum()
    }

    pub fn total_written(&self) -> u64 {
        self.written.values().sum()
    }

    /// Count a write, or skip the record if the store rejected it.
    /// Returns whether the unit was written.
    pub fn absorb(&mut self, unit: &str, result: ProjectionResult<()>) -> ProjectionResult<bool> {
        match result {
            Ok(()) => {
                self.wrote(unit, 1);
                Ok(true)
            }
            Err(e) if e.is_record_level() => {
                warn!(unit, error = %e, "Skipping rejected record");
                self.skipped += 1;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Fail the target over one row whose parent is missing, while the
    /// rest of the batch carries on
    pub fn gap(&mut self, kind: EntityKind, id: i64, detail: &str) {
        let e = ProjectionError::ReferentialGap(format!("{} row {} {}", kind, id, detail));
        error!(error = %e, "Unresolved parent reference");
        self.errors.push(e);
    }

    /// Keep going without a declaration the store refused
    pub fn degrade(&mut self, result: ProjectionResult<()>) -> ProjectionResult<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_degradable() => {
                warn!(error = %e, "Continuing without declaration");
                self.warnings.push(e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Read-back of what a target currently holds
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInventory {
    pub target: TargetKind,
    /// Nodes plus edges, documents, indexed documents or keys
    pub units: u64,
    /// Constraints, collections, indexes or marker keys
    pub structures: Vec<String>,
    pub detail: Value,
}

impl TargetInventory {
    /// Whether a teardown at this granularity would have nothing to remove
    pub fn is_empty(&self, granularity: Granularity) -> bool {
        match granularity {
            Granularity::Data => self.units == 0,
            Granularity::Structure => self.units == 0 && self.structures.is_empty(),
        }
    }
}

/// One target family's build and teardown
#[async_trait]
pub trait Projector: Send + Sync {
    fn target(&self) -> TargetKind;

    /// Backend description for reports
    fn describe(&self) -> String;

    /// Fails with `TargetUnavailable` when the store cannot be reached
    async fn ping(&self) -> ProjectionResult<()>;

    /// Replace the derived state with a fresh projection of the source.
    ///
    /// Record-level and degradable errors are absorbed into `stats`.
    /// Blocking errors that still let unrelated work finish are pushed to
    /// `stats.errors`; anything fatal to the target is returned as `Err`,
    /// leaving in `stats` whatever was removed and written before it.
    async fn build(&self, extractor: &Extractor, ctx: &BuildContext, stats: &mut ProjectionStats) -> ProjectionResult<()>;

    async fn inventory(&self) -> ProjectionResult<TargetInventory>;

    /// Same error contract as [`Projector::build`]
    async fn teardown(&self, granularity: Granularity, ctx: &BuildContext, stats: &mut ProjectionStats) -> ProjectionResult<()>;
}

/// An entity's attributes as a property map keyed by canonical field name
pub(crate) fn attribute_map(def: &EntityDef, row: &CanonicalRow) -> ProjectionResult<Map<String, Value>> {
    def.attributes
        .iter()
        .map(|attr| Ok((attr.field.to_string(), row.value(attr.field)?.clone())))
        .collect()
}

/// Ids of every canonical row of `kind`, before any ancestor join
pub(crate) async fn canonical_ids(snapshot: &Snapshot<'_>, kind: EntityKind) -> ProjectionResult<BTreeSet<i64>> {
    snapshot
        .rows(JoinSpec::of(kind))?
        .stream()
        .map_ok(|row| row.id)
        .try_collect()
        .await
}

/// `{id, name}` reference to an ancestor carried on a joined row
pub(crate) fn named_ref(row: &CanonicalRow, alias: &str) -> ProjectionResult<Value> {
    let id = row.value(&format!("{}_id", alias))?.clone();
    let name = row.value(&format!("{}_name", alias))?.clone();
    let mut map = Map::new();
    map.insert("id".to_string(), id);
    map.insert("name".to_string(), name);
    Ok(Value::Object(map))
}

/// Epoch seconds of a canonical timestamp field
pub(crate) fn epoch_seconds(row: &CanonicalRow, field: &str) -> ProjectionResult<i64> {
    let raw = row.text(field)?.ok_or_else(|| {
        ProjectionError::SchemaMismatch(format!("{} row {} has no {}", row.kind, row.id, field))
    })?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.timestamp())
        .map_err(|e| {
            ProjectionError::SchemaMismatch(format!(
                "{} row {} field '{}' is not a timestamp: {}",
                row.kind, row.id, field, e
            ))
        })
}

pub(crate) fn log_stage(target: TargetKind, stage: &str) {
    debug!(target = %target, stage, "Projection stage");
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Reference dataset wiring shared by the projector and lifecycle tests

    use super::{BuildContext, Granularity, ProjectionStats, Projector};
    use crate::error::ProjectionResult;
    use crate::schema::university_registry;
    use crate::source::{CanonicalDataset, Extractor, MemorySource, SourceStore};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    pub async fn seeded_with(dataset: CanonicalDataset) -> (Extractor, Arc<MemorySource>) {
        let registry = Arc::new(university_registry().unwrap());
        let source = Arc::new(MemorySource::new());
        source.provision(&registry, &dataset).await.unwrap();
        (Extractor::new(registry, source.clone()), source)
    }

    pub fn reference() -> CanonicalDataset {
        CanonicalDataset::reference(&mut StdRng::seed_from_u64(42))
    }

    pub async fn seeded() -> (Extractor, Arc<MemorySource>) {
        seeded_with(reference()).await
    }

    /// Run one build and hand back its stats
    pub async fn build(
        projector: &dyn Projector,
        extractor: &Extractor,
        ctx: &BuildContext,
    ) -> ProjectionResult<ProjectionStats> {
        let mut stats = ProjectionStats::default();
        projector.build(extractor, ctx, &mut stats).await?;
        Ok(stats)
    }

    pub async fn teardown(
        projector: &dyn Projector,
        granularity: Granularity,
        ctx: &BuildContext,
    ) -> ProjectionResult<ProjectionStats> {
        let mut stats = ProjectionStats::default();
        projector.teardown(granularity, ctx, &mut stats).await?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_absorb_counts_and_skips() {
        let mut stats = ProjectionStats::default();
        assert!(stats.absorb("Student", Ok(())).unwrap());
        assert!(!stats
            .absorb("Student", Err(ProjectionError::WriteRejected("dup".into())))
            .unwrap());
        assert!(stats
            .absorb("Student", Err(ProjectionError::ReferentialGap("gap".into())))
            .is_err());

        assert_eq!(stats.written.get("Student"), Some(&1));
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn test_gap_fails_without_stopping() {
        let mut stats = ProjectionStats::default();
        stats.gap(EntityKind::Student, 20, "references group 99");
        assert!(stats.absorb("Student", Ok(())).unwrap());

        assert_eq!(stats.errors.len(), 1);
        assert!(matches!(stats.errors[0], ProjectionError::ReferentialGap(ref m) if m == "student row 20 references group 99"));
        assert_eq!(stats.total_written(), 1);
    }

    #[test]
    fn test_degrade_keeps_warning() {
        let mut stats = ProjectionStats::default();
        stats
            .degrade(Err(ProjectionError::ConstraintUnsupported("old".into())))
            .unwrap();
        assert_eq!(stats.warnings.len(), 1);
        assert!(stats
            .degrade(Err(ProjectionError::TargetUnavailable("down".into())))
            .is_err());
    }

    #[test]
    fn test_inventory_emptiness_depends_on_granularity() {
        let inventory = TargetInventory {
            target: TargetKind::Document,
            units: 0,
            structures: vec!["groups".to_string()],
            detail: Value::Null,
        };
        assert!(inventory.is_empty(Granularity::Data));
        assert!(!inventory.is_empty(Granularity::Structure));
    }

    #[test]
    fn test_cancelled_context_stops_stage() {
        let cancel = CancelToken::new();
        let ctx = BuildContext::new(cancel.clone());
        assert!(ctx.check("nodes").is_ok());
        cancel.cancel();
        assert!(matches!(ctx.check("nodes"), Err(ProjectionError::Cancelled(_))));
    }
}
