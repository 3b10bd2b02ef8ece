//! Batch driver: runs a list of requests to completion.
//!
//! Requests are submitted to a [`Scheduler`] up to a window of active units.
//! Outcomes are collected as units finish, in no particular order. Units
//! that lost a registry commit race are re-queued as fresh attempts; a
//! corrupt registry halts the run.

use super::orchestrator::Orchestrator;
use super::request::WorkRequest;
use super::state::{FailureKind, FailureReason, UnitState};
use super::unit::{UnitId, UnitReport, WorkUnit};
use super::PipelineError;
use crate::registry::{RegistryIssue, SceneId};
use crate::scheduler::{AdmissionControl, Scheduler, DEFAULT_MAX_CONCURRENT};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Default number of times a contended unit is re-queued.
pub const DEFAULT_REQUEUE_LIMIT: u32 = 2;

/// Batch run settings.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Units allowed in `Processing` at once
    pub max_concurrent: usize,
    /// Units submitted but not finished; 0 means unlimited
    pub max_active_units: usize,
    pub admission_timeout: Option<Duration>,
    /// Re-queues allowed per request after `RegistryContention`
    pub requeue_limit: u32,
    /// Rebuild a corrupt registry from sidecars instead of halting
    pub rebuild_on_corrupt: bool,
    /// Validate registry outputs after the batch
    pub validate_registry: bool,
    /// GPUs assigned to processing slots round-robin; empty for none
    pub gpu_ids: Vec<u32>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_active_units: 0,
            admission_timeout: None,
            requeue_limit: DEFAULT_REQUEUE_LIMIT,
            rebuild_on_corrupt: false,
            validate_registry: true,
            gpu_ids: Vec::new(),
        }
    }
}

/// A unit that ended in `Failed`.
#[derive(Debug, Clone)]
pub struct FailedUnit {
    pub unit_id: UnitId,
    pub request: String,
    pub reason: FailureReason,
}

/// Outcome of a batch.
#[derive(Debug, Default)]
pub struct BatchSummary {
    /// Request name and registered scene
    pub registered: Vec<(String, SceneId)>,
    /// Request name and reused scene
    pub skipped: Vec<(String, SceneId)>,
    pub failed: Vec<FailedUnit>,
    /// Contended units that were given another attempt
    pub requeued: usize,
    /// Findings of the post-run registry validation
    pub registry_issues: Vec<RegistryIssue>,
}

impl BatchSummary {
    fn record(&mut self, report: UnitReport) {
        let scene = report.scene_id.clone();
        match (report.state, scene) {
            (UnitState::Registered, Some(scene)) => self.registered.push((report.request.name, scene)),
            (UnitState::Skipped, Some(scene)) => self.skipped.push((report.request.name, scene)),
            (UnitState::Failed(reason), _) => self.failed.push(FailedUnit {
                unit_id: report.unit_id,
                request: report.request.name,
                reason,
            }),
            (state, _) => {
                error!(unit_id = %report.unit_id, state = %state, "Unit report without terminal outcome");
                self.failed.push(FailedUnit {
                    unit_id: report.unit_id,
                    request: report.request.name,
                    reason: FailureReason::new(FailureKind::ProcessingError, format!("ended in {}", state)),
                });
            }
        }
    }

    pub fn total(&self) -> usize {
        self.registered.len() + self.skipped.len() + self.failed.len()
    }

    /// True when no unit failed and validation found nothing.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.registry_issues.is_empty()
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Registered: {}  Skipped: {}  Failed: {}  Re-queued: {}",
            self.registered.len(),
            self.skipped.len(),
            self.failed.len(),
            self.requeued
        )?;
        for failed in &self.failed {
            writeln!(f, "  FAILED {} ({}): {}", failed.request, failed.unit_id, failed.reason)?;
        }
        for issue in &self.registry_issues {
            writeln!(f, "  REGISTRY {}", issue)?;
        }
        Ok(())
    }
}

/// Runs batches against one orchestrator.
#[derive(Debug)]
pub struct BatchRunner {
    orchestrator: Arc<Orchestrator>,
    options: BatchOptions,
}

impl BatchRunner {
    pub fn new(orchestrator: Arc<Orchestrator>, options: BatchOptions) -> Self {
        Self {
            orchestrator,
            options,
        }
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    /// Runs every request and returns the summary.
    ///
    /// Cancelling `cancel` stops submission and cancels units that have not
    /// been dispatched to processing; the summary still accounts for every
    /// request. A corrupt registry ends the run with
    /// [`PipelineError::CorruptRegistry`].
    pub async fn run(
        &self,
        requests: Vec<WorkRequest>,
        cancel: CancellationToken,
    ) -> Result<BatchSummary, PipelineError> {
        self.preflight().await?;

        let mut queue: VecDeque<WorkUnit> = requests.into_iter().map(WorkUnit::new).collect();
        let window = match self.options.max_active_units {
            0 => usize::MAX,
            n => n,
        };
        let admission = AdmissionControl::new(self.options.max_concurrent)
            .with_devices(self.options.gpu_ids.clone());
        let mut scheduler = Scheduler::new(admission, self.options.admission_timeout)
        .with_cancellation(cancel.clone());
        let mut summary = BatchSummary::default();

        info!(
            units = queue.len(),
            max_concurrent = self.options.max_concurrent,
            "Batch started"
        );

        loop {
            while scheduler.pending() < window && !cancel.is_cancelled() {
                let Some(unit) = queue.pop_front() else {
                    break;
                };
                let orchestrator = Arc::clone(&self.orchestrator);
                scheduler.submit(unit, move |unit, ctx| async move {
                    orchestrator.run_unit(unit, ctx).await
                });
            }

            let Some(report) = scheduler.await_any().await else {
                break;
            };

            match report.failure().map(|reason| reason.kind) {
                Some(FailureKind::CorruptRegistry) => {
                    let detail = report
                        .failure()
                        .map(|reason| reason.detail.clone())
                        .unwrap_or_default();
                    error!(unit_id = %report.unit_id, reason = %detail, "Registry corrupt, halting batch");
                    scheduler.shutdown().await;
                    return Err(PipelineError::CorruptRegistry(detail));
                }
                Some(FailureKind::RegistryContention)
                    if report.attempt <= self.options.requeue_limit && !cancel.is_cancelled() =>
                {
                    warn!(
                        unit_id = %report.unit_id,
                        request = %report.request.name,
                        attempt = report.attempt,
                        "Re-queueing unit after registry contention"
                    );
                    summary.requeued += 1;
                    queue.push_back(WorkUnit::retry_of(&report));
                }
                _ => summary.record(report),
            }
        }

        // Anything still queued was never started.
        for mut unit in queue.drain(..) {
            unit.transition(UnitState::Failed(FailureReason::new(
                FailureKind::Cancelled,
                "run shut down before the unit started",
            )))?;
            summary.record(unit.into_report());
        }

        if self.options.validate_registry {
            summary.registry_issues = self
                .orchestrator
                .store()
                .audit(&self.orchestrator.layout().results_root())
                .await?;
        }

        info!(
            registered = summary.registered.len(),
            skipped = summary.skipped.len(),
            failed = summary.failed.len(),
            requeued = summary.requeued,
            issues = summary.registry_issues.len(),
            "Batch finished"
        );
        Ok(summary)
    }

    /// Checks the registry before any unit runs, rebuilding it when allowed.
    async fn preflight(&self) -> Result<(), PipelineError> {
        let store = self.orchestrator.store();
        match store.snapshot().await {
            Ok(_) => Ok(()),
            Err(e) if e.is_corrupt() && self.options.rebuild_on_corrupt => {
                warn!(error = %e, "Registry corrupt, rebuilding from result sidecars");
                let report = store
                    .rebuild(&self.orchestrator.layout().results_root())
                    .await?;
                info!(
                    scenes = report.registry.len(),
                    backup = ?report.backup,
                    rejected = report.rejected.len(),
                    swept = report.swept.len(),
                    "Registry rebuilt"
                );
                Ok(())
            }
            Err(e) if e.is_corrupt() => Err(PipelineError::CorruptRegistry(e.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}
