//! Run reports

use super::TargetState;
use crate::error::ProjectionError;
use crate::projection::{Granularity, ProjectionStats};
use crate::targets::TargetKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Build,
    Teardown,
}

/// Outcome of one target in a run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetReport {
    pub target: TargetKind,
    pub backend: String,
    pub state: TargetState,
    pub stats: ProjectionStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProjectionError>,
    pub already_empty: bool,
    pub elapsed_ms: u64,
}

impl TargetReport {
    pub fn failed(target: TargetKind, backend: String, error: ProjectionError) -> Self {
        Self {
            target,
            backend,
            state: TargetState::Failed,
            stats: ProjectionStats::default(),
            error: Some(error),
            already_empty: false,
            elapsed_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub extracted: u64,
    pub written: u64,
    pub removed: u64,
    pub skipped: u64,
    pub warnings: u64,
    pub failures: u64,
}

/// Everything one build or teardown did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: Uuid,
    pub operation: Operation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granularity: Option<Granularity>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// The confirmation gate said no; nothing was touched
    pub declined: bool,
    /// Error that stopped the whole run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal: Option<ProjectionError>,
    pub targets: Vec<TargetReport>,
    pub totals: Totals,
}

impl RunReport {
    pub fn new(operation: Operation, granularity: Option<Granularity>, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            operation,
            granularity,
            started_at,
            finished_at: started_at,
            declined: false,
            fatal: None,
            targets: Vec::new(),
            totals: Totals::default(),
        }
    }

    /// Sort targets, compute totals and stamp the finish time
    pub fn finish(mut self) -> Self {
        self.targets.sort_by_key(|t| t.target);

        let mut totals = Totals::default();
        for report in &self.targets {
            totals.extracted += report.stats.total_extracted();
            totals.written += report.stats.total_written();
            totals.removed += report.stats.removed;
            totals.skipped += report.stats.skipped;
            totals.warnings += report.stats.warnings.len() as u64;
            if report.state == TargetState::Failed {
                totals.failures += 1;
            }
        }
        self.totals = totals;
        self.finished_at = Utc::now();
        self
    }

    pub fn target(&self, target: TargetKind) -> Option<&TargetReport> {
        self.targets.iter().find(|t| t.target == target)
    }

    pub fn succeeded(&self) -> bool {
        !self.declined && self.fatal.is_none() && self.totals.failures == 0
    }

    /// One line naming every target's terminal state and every failure
    pub fn summary(&self) -> String {
        let operation = match self.operation {
            Operation::Build => "build",
            Operation::Teardown => "teardown",
        };
        if self.declined {
            return format!("{} declined, nothing changed", operation);
        }

        let mut parts: Vec<String> = self
            .targets
            .iter()
            .map(|t| {
                let mut part = format!("{}={:?}", t.target, t.state).to_lowercase();
                if t.already_empty {
                    part.push_str(" (already empty)");
                }
                if let Some(error) = &t.error {
                    part.push_str(&format!(" [{}]", error));
                }
                part
            })
            .collect();
        if let Some(fatal) = &self.fatal {
            parts.push(format!("fatal: {}", fatal));
        }

        format!(
            "{} {}: {}; written {}, removed {}, skipped {}, warnings {}",
            operation,
            if self.succeeded() { "succeeded" } else { "finished with failures" },
            parts.join(", "),
            self.totals.written,
            self.totals.removed,
            self.totals.skipped,
            self.totals.warnings
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_separates_success_from_failure() {
        let mut report = RunReport::new(Operation::Build, None, Utc::now());
        let mut stats = ProjectionStats::default();
        stats.wrote("documents", 4);
        report.targets.push(TargetReport {
            target: TargetKind::Document,
            backend: "memory documents".to_string(),
            state: TargetState::Ready,
            stats,
            error: None,
            already_empty: false,
            elapsed_ms: 3,
        });
        report.targets.push(TargetReport::failed(
            TargetKind::Graph,
            "memory graph".to_string(),
            ProjectionError::TargetUnavailable("down".to_string()),
        ));
        let report = report.finish();

        assert_eq!(report.targets[0].target, TargetKind::Graph);
        assert_eq!(report.totals.failures, 1);
        assert_eq!(report.totals.written, 4);
        assert!(!report.succeeded());
        assert_eq!(
            report.summary(),
            "build finished with failures: graph=failed [Target unavailable: down], document=ready; \
             written 4, removed 0, skipped 0, warnings 0"
        );
    }
}
