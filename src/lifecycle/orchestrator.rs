//! Build and teardown across every target
//!
//! Targets run as independent pipelines joined at the end of a run. A
//! failure inside one pipeline is recorded in its report and never stops the
//! others; only a run-fatal error cancels the shared token.

use super::gate::{ConfirmationGate, ConfirmationPrompt};
use super::report::{Operation, RunReport, TargetReport};
use super::{CancelToken, TargetState};
use crate::error::{ProjectionError, ProjectionResult};
use crate::projection::{BuildContext, Granularity, ProjectionStats, Projector, TargetInventory};
use crate::source::Extractor;
use crate::targets::TargetKind;
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

/// Current state and contents of one target
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatus {
    pub target: TargetKind,
    pub backend: String,
    pub state: TargetState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inventory: Option<TargetInventory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProjectionError>,
}

pub struct Orchestrator {
    extractor: Extractor,
    projectors: Vec<Arc<dyn Projector>>,
    states: Mutex<BTreeMap<TargetKind, TargetState>>,
    running: Mutex<Vec<CancelToken>>,
    last_report: RwLock<Option<RunReport>>,
}

impl Orchestrator {
    pub fn new(extractor: Extractor, projectors: Vec<Arc<dyn Projector>>) -> Self {
        let states = projectors
            .iter()
            .map(|p| (p.target(), TargetState::Pending))
            .collect();
        Self {
            extractor,
            projectors,
            states: Mutex::new(states),
            running: Mutex::new(Vec::new()),
            last_report: RwLock::new(None),
        }
    }

    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    pub async fn states(&self) -> BTreeMap<TargetKind, TargetState> {
        self.states.lock().await.clone()
    }

    pub async fn last_report(&self) -> Option<RunReport> {
        self.last_report.read().await.clone()
    }

    /// State plus a fresh inventory of every target
    pub async fn status(&self) -> Vec<TargetStatus> {
        let states = &self.states().await;
        let checks = self.projectors.iter().map(|p| async move {
            let target = p.target();
            let (inventory, error) = match p.inventory().await {
                Ok(inventory) => (Some(inventory), None),
                Err(e) => (None, Some(e)),
            };
            TargetStatus {
                target,
                backend: p.describe(),
                state: states.get(&target).copied().unwrap_or(TargetState::Pending),
                inventory,
                error,
            }
        });
        join_all(checks).await
    }

    /// Ask every run in flight to stop at its next stage boundary
    pub async fn cancel_running(&self) -> usize {
        let running = self.running.lock().await;
        for token in running.iter() {
            token.cancel();
        }
        running.len()
    }

    /// Project the source into the selected targets (all when empty)
    pub async fn build(&self, selection: &[TargetKind], cancel: CancelToken) -> RunReport {
        let ctx = BuildContext::new(cancel);
        let mut report = RunReport::new(Operation::Build, None, ctx.started_at);
        let selected = self.select(selection);

        info!(run = %report.run_id, targets = selected.len(), "Starting build");

        if let Err(e) = self.extractor.ping().await {
            error!(error = %e, "Canonical store unreachable, no target will be built");
            for projector in &selected {
                self.fail_idle(projector.target()).await;
                report
                    .targets
                    .push(TargetReport::failed(projector.target(), projector.describe(), e.clone()));
            }
            report.fatal = Some(e);
            return self.store(report.finish()).await;
        }

        self.track(&ctx.cancel).await;
        let pipelines = selected.iter().map(|p| self.run_build(p.clone(), &ctx));
        let results = join_all(pipelines).await;
        self.untrack(&ctx.cancel).await;

        for result in results {
            if let Some(e) = result.error.as_ref().filter(|e| e.is_fatal_to_run()) {
                report.fatal.get_or_insert_with(|| e.clone());
            }
            report.targets.push(result);
        }

        self.store(report.finish()).await
    }

    /// Remove derived state from the selected targets (all when empty).
    ///
    /// The gate is asked once for the whole run. A target that holds nothing
    /// at the requested granularity is reported as already empty.
    pub async fn teardown(
        &self,
        selection: &[TargetKind],
        granularity: Granularity,
        gate: &dyn ConfirmationGate,
        cancel: CancelToken,
    ) -> RunReport {
        let ctx = BuildContext::new(cancel);
        let mut report = RunReport::new(Operation::Teardown, Some(granularity), ctx.started_at);
        let selected = self.select(selection);
        let kinds: Vec<TargetKind> = selected.iter().map(|p| p.target()).collect();

        let prompt = ConfirmationPrompt::teardown(&kinds, granularity);
        if !gate.confirm(&prompt) {
            info!(action = %prompt.action, "Teardown declined");
            report.declined = true;
            return self.store(report.finish()).await;
        }

        info!(run = %report.run_id, action = %prompt.action, "Starting teardown");

        self.track(&ctx.cancel).await;
        let pipelines = selected
            .iter()
            .map(|p| self.run_teardown(p.clone(), granularity, &ctx));
        report.targets = join_all(pipelines).await;
        self.untrack(&ctx.cancel).await;

        self.store(report.finish()).await
    }

    fn select(&self, selection: &[TargetKind]) -> Vec<Arc<dyn Projector>> {
        self.projectors
            .iter()
            .filter(|p| selection.is_empty() || selection.contains(&p.target()))
            .cloned()
            .collect()
    }

    /// Move a target into a transition, refusing if it is already in one
    async fn claim(&self, target: TargetKind, next: TargetState) -> ProjectionResult<()> {
        let mut states = self.states.lock().await;
        let current = states.entry(target).or_insert(TargetState::Pending);
        if !current.can_enter(next) {
            return Err(ProjectionError::Conflict(format!(
                "{} target is {:?}, cannot start {:?}",
                target, current, next
            )));
        }
        *current = next;
        Ok(())
    }

    async fn settle(&self, target: TargetKind, state: TargetState) {
        self.states.lock().await.insert(target, state);
    }

    /// Mark a target failed unless another run owns it
    async fn fail_idle(&self, target: TargetKind) {
        let mut states = self.states.lock().await;
        let current = states.entry(target).or_insert(TargetState::Pending);
        if !current.is_transitioning() {
            *current = TargetState::Failed;
        }
    }

    async fn track(&self, cancel: &CancelToken) {
        self.running.lock().await.push(cancel.clone());
    }

    async fn untrack(&self, cancel: &CancelToken) {
        self.running.lock().await.retain(|t| !t.same_as(cancel));
    }

    async fn store(&self, report: RunReport) -> RunReport {
        info!(run = %report.run_id, "{}", report.summary());
        *self.last_report.write().await = Some(report.clone());
        report
    }

    async fn build_pipeline(
        &self,
        projector: &dyn Projector,
        ctx: &BuildContext,
        stats: &mut ProjectionStats,
    ) -> ProjectionResult<()> {
        ctx.check("ping")?;
        projector.ping().await?;
        ctx.check("build")?;
        projector.build(&self.extractor, ctx, stats).await
    }

    /// `false` when the target had nothing to remove
    async fn teardown_pipeline(
        projector: &dyn Projector,
        granularity: Granularity,
        ctx: &BuildContext,
        stats: &mut ProjectionStats,
    ) -> ProjectionResult<bool> {
        ctx.check("ping")?;
        projector.ping().await?;
        if projector.inventory().await?.is_empty(granularity) {
            return Ok(false);
        }
        ctx.check("teardown")?;
        projector.teardown(granularity, ctx, stats).await?;
        Ok(true)
    }

    async fn run_build(&self, projector: Arc<dyn Projector>, ctx: &BuildContext) -> TargetReport {
        let target = projector.target();
        if let Err(e) = self.claim(target, TargetState::Creating).await {
            warn!(target = %target, error = %e, "Build refused");
            return TargetReport::failed(target, projector.describe(), e);
        }

        let started = Instant::now();
        let mut stats = ProjectionStats::default();
        let outcome = self.build_pipeline(projector.as_ref(), ctx, &mut stats).await;

        // Stats keep whatever the target removed and wrote before a failure
        let (state, error) = match outcome {
            Ok(()) => match stats.errors.first().cloned() {
                Some(first) => (TargetState::Failed, Some(first)),
                None => (TargetState::Ready, None),
            },
            Err(e) => {
                if e.is_fatal_to_run() {
                    ctx.cancel.cancel();
                }
                (TargetState::Failed, Some(e))
            }
        };

        match &error {
            Some(e) if e.is_fatal_to_target() || e.is_fatal_to_run() => {
                error!(target = %target, error = %e, written = stats.total_written(), "Build failed")
            }
            Some(e) => warn!(target = %target, error = %e, "Build stopped on a record-level error"),
            None => info!(target = %target, written = stats.total_written(), "Build finished"),
        }

        self.settle(target, state).await;
        TargetReport {
            target,
            backend: projector.describe(),
            state,
            stats,
            error,
            already_empty: false,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn run_teardown(
        &self,
        projector: Arc<dyn Projector>,
        granularity: Granularity,
        ctx: &BuildContext,
    ) -> TargetReport {
        let target = projector.target();
        if let Err(e) = self.claim(target, TargetState::Cleaning).await {
            warn!(target = %target, error = %e, "Teardown refused");
            return TargetReport::failed(target, projector.describe(), e);
        }

        let started = Instant::now();
        let mut stats = ProjectionStats::default();
        let outcome = Self::teardown_pipeline(projector.as_ref(), granularity, ctx, &mut stats).await;

        let (state, error, already_empty) = match outcome {
            Ok(true) => (TargetState::Empty, None, false),
            Ok(false) => {
                info!(target = %target, "Nothing to remove");
                (TargetState::Empty, None, true)
            }
            Err(e) => {
                error!(target = %target, error = %e, removed = stats.removed, "Teardown failed");
                (TargetState::Failed, Some(e), false)
            }
        };

        self.settle(target, state).await;
        TargetReport {
            target,
            backend: projector.describe(),
            state,
            stats,
            error,
            already_empty,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}
