//! Concurrency scheduler for work units.
//!
//! Every submitted unit runs in its own Tokio task. Units acquire a
//! processing slot from [`AdmissionControl`] inside that task, so waiting
//! for admission never blocks submission or other units.
//!
//! # Example
//!
//! ```ignore
//! use sarflow::scheduler::Scheduler;
//!
//! let mut scheduler = Scheduler::new(AdmissionControl::new(2), None);
//! let handle = scheduler.submit(unit, |unit, ctx| orchestrator.run_unit(unit, ctx));
//!
//! while let Some(report) = scheduler.await_any().await {
//!     println!("{} finished: {}", report.unit_id, report.state);
//! }
//! ```
//!
//! # Cancellation
//!
//! [`Scheduler::shutdown`] cancels the run token and then waits for every
//! unit. Units observe the token only at suspension points before external
//! processing starts; dispatched units always run to completion.

mod admission;
mod handle;

pub use admission::{AdmissionControl, AdmissionError, AdmissionPermit, DEFAULT_MAX_CONCURRENT};
pub use handle::UnitHandle;

use crate::pipeline::{FailureKind, FailureReason, UnitReport, UnitState, WorkUnit};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// What a running unit needs from the scheduler.
#[derive(Debug, Clone)]
pub struct UnitContext {
    pub admission: AdmissionControl,
    pub cancel: CancellationToken,
    /// Longest a unit may wait for a processing slot
    pub admission_timeout: Option<Duration>,
}

impl UnitContext {
    pub fn new(admission: AdmissionControl, admission_timeout: Option<Duration>) -> Self {
        Self {
            admission,
            cancel: CancellationToken::new(),
            admission_timeout,
        }
    }

    /// Waits for a processing slot, honouring the timeout and cancellation.
    pub async fn admit(&self) -> Result<AdmissionPermit, FailureReason> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FailureReason::new(
                FailureKind::Cancelled,
                "run shut down while waiting for admission",
            )),
            result = self.admission.admit(self.admission_timeout) => result.map_err(|e| match e {
                AdmissionError::Timeout(_) => FailureReason::new(FailureKind::SchedulingTimeout, e.to_string()),
                AdmissionError::Closed => FailureReason::new(FailureKind::Cancelled, e.to_string()),
            }),
        }
    }
}

/// Runs units concurrently and collects their reports.
pub struct Scheduler {
    tasks: JoinSet<UnitReport>,
    context: UnitContext,
}

impl Scheduler {
    pub fn new(admission: AdmissionControl, admission_timeout: Option<Duration>) -> Self {
        Self {
            tasks: JoinSet::new(),
            context: UnitContext::new(admission, admission_timeout),
        }
    }

    /// Uses `cancel` as the run token, so an outside signal reaches units.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.context.cancel = cancel;
        self
    }

    /// Token cancelled by [`shutdown`](Self::shutdown).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.context.cancel.clone()
    }

    pub fn admission(&self) -> &AdmissionControl {
        &self.context.admission
    }

    /// Number of submitted units whose reports have not been collected.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Spawns `run` for `unit` and returns a handle to observe it.
    ///
    /// `run` must drive the unit to a terminal state. A panic inside it is
    /// turned into a failed report rather than lost.
    pub fn submit<F, Fut>(&mut self, unit: WorkUnit, run: F) -> UnitHandle
    where
        F: FnOnce(WorkUnit, UnitContext) -> Fut,
        Fut: Future<Output = UnitReport> + Send + 'static,
    {
        let handle = UnitHandle::new(unit.id().clone(), unit.subscribe());
        let unit_id = unit.id().clone();
        let request = unit.request().clone();
        let attempt = unit.attempt();
        let future = run(unit, self.context.clone());

        debug!(unit_id = %unit_id, request = %request.name, attempt, "Unit submitted");
        self.tasks.spawn(AssertUnwindSafe(future).catch_unwind().map(move |result| {
            result.unwrap_or_else(|panic| {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(unit_id = %unit_id, detail = %detail, "Unit task panicked");
                UnitReport {
                    unit_id,
                    request,
                    attempt,
                    state: UnitState::Failed(FailureReason::new(
                        FailureKind::ProcessingError,
                        format!("unit task panicked: {}", detail),
                    )),
                    scene_id: None,
                    history: Vec::new(),
                }
            })
        }));
        handle
    }

    /// Waits for the next unit to finish. Returns `None` when none remain.
    pub async fn await_any(&mut self) -> Option<UnitReport> {
        loop {
            match self.tasks.join_next().await? {
                Ok(report) => return Some(report),
                // Tasks are never aborted, so this only happens if the
                // runtime is shutting down underneath us.
                Err(e) => warn!(error = %e, "Unit task did not complete"),
            }
        }
    }

    /// Cancels the run and waits for every in-flight unit.
    pub async fn shutdown(&mut self) -> Vec<UnitReport> {
        self.context.cancel.cancel();
        let mut reports = Vec::with_capacity(self.tasks.len());
        while let Some(report) = self.await_any().await {
            reports.push(report);
        }
        reports
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.tasks.len())
            .field("admission", &self.context.admission)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Footprint;
    use crate::pipeline::WorkRequest;
    use chrono::{TimeZone, Utc};

    fn unit(name: &str) -> WorkUnit {
        let request = WorkRequest::builder(
            name,
            Footprint::from_bounds(0.0, 0.0, 1.0, 1.0).unwrap(),
            Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
        )
        .build()
        .unwrap();
        WorkUnit::new(request)
    }

    async fn skip(mut unit: WorkUnit, _ctx: UnitContext) -> UnitReport {
        unit.transition(UnitState::Skipped).unwrap();
        unit.into_report()
    }

    async fn hold_slot(mut unit: WorkUnit, ctx: UnitContext) -> UnitReport {
        unit.transition(UnitState::Acquiring).unwrap();
        match ctx.admit().await {
            Ok(_permit) => {
                unit.transition(UnitState::Processing).unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
                unit.transition(UnitState::Validating).unwrap();
                unit.transition(UnitState::Registered).unwrap();
            }
            Err(reason) => {
                unit.transition(UnitState::Failed(reason)).unwrap();
            }
        }
        unit.into_report()
    }

    async fn explode(_unit: WorkUnit, _ctx: UnitContext) -> UnitReport {
        panic!("collaborator exploded")
    }

    #[tokio::test]
    async fn test_submit_and_await_any() {
        let mut scheduler = Scheduler::new(AdmissionControl::new(2), None);
        let mut handle = scheduler.submit(unit("a"), skip);
        scheduler.submit(unit("b"), skip);

        assert_eq!(handle.wait().await, UnitState::Skipped);

        let mut names = Vec::new();
        while let Some(report) = scheduler.await_any().await {
            names.push(report.request.name);
        }
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
        assert!(scheduler.await_any().await.is_none());
    }

    #[tokio::test]
    async fn test_admission_timeout_fails_unit() {
        let admission = AdmissionControl::new(1);
        let _held = admission.admit(None).await.unwrap();
        let mut scheduler = Scheduler::new(admission, Some(Duration::from_millis(20)));

        scheduler.submit(unit("late"), hold_slot);
        let report = scheduler.await_any().await.unwrap();
        assert_eq!(report.failure().unwrap().kind, FailureKind::SchedulingTimeout);
    }

    #[tokio::test]
    async fn test_never_exceeds_capacity() {
        let mut scheduler = Scheduler::new(AdmissionControl::new(2), None);
        for i in 0..6 {
            scheduler.submit(unit(&format!("u{i}")), hold_slot);
        }
        let mut registered = 0;
        while let Some(report) = scheduler.await_any().await {
            if report.state == UnitState::Registered {
                registered += 1;
            }
        }
        assert_eq!(registered, 6);
        assert!(scheduler.admission().peak_in_flight() <= 2);
        assert_eq!(scheduler.admission().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_waiting_units() {
        let admission = AdmissionControl::new(1);
        let held = admission.admit(None).await.unwrap();
        let mut scheduler = Scheduler::new(admission, None);
        scheduler.submit(unit("waiting"), hold_slot);
        tokio::task::yield_now().await;

        let reports = scheduler.shutdown().await;
        drop(held);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].failure().unwrap().kind, FailureKind::Cancelled);
    }

    #[tokio::test]
    async fn test_panicking_unit_becomes_failed_report() {
        let mut scheduler = Scheduler::new(AdmissionControl::new(1), None);
        scheduler.submit(unit("boom"), explode);

        let report = scheduler.await_any().await.unwrap();
        let failure = report.failure().unwrap();
        assert!(failure.detail.contains("collaborator exploded"));
    }
}
