//! Drives one work unit through the pipeline.
//!
//! ```text
//! resolve ─ hit ──> Skipped (reference recorded on the reused scene)
//!    │
//!   miss ─> acquire ─> validate inputs ─> admit ─> process ─> validate outputs ─> commit
//! ```
//!
//! A registered scene is only reused while all of its products are still
//! on disk and non-empty; otherwise the next best match is considered, and
//! with none left the request is processed afresh.
//!
//! Raw inputs live in `scratch/<unit>` and are removed on every exit path.
//! Products are written to `rtc/<unit>`, which is removed whenever the unit
//! does not end in `Registered`.

use super::journal::{ProcessingJournal, JOURNAL_FILE};
use super::request::WorkRequest;
use super::state::{FailureKind, FailureReason, UnitState};
use super::unit::{UnitId, UnitReport, WorkUnit};
use super::validate::{validate_inputs, validate_outputs};
use crate::collaborator::{AcquisitionRequest, Acquirer, ProcessingJob, Processor};
use crate::fsutil;
use crate::registry::{
    write_sidecar, RegistryError, RegistryStore, SceneId, SceneRecord, SceneStatus, REGISTRY_FILE,
};
use crate::resolver::OverlapResolver;
use crate::scheduler::UnitContext;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Directory for per-unit raw inputs.
pub const SCRATCH_DIR: &str = "scratch";

/// Directory for per-unit durable products.
pub const RESULTS_DIR: &str = "rtc";

/// Directory for the processing journal.
pub const LOGS_DIR: &str = "logs";

/// Paths under the output root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE)
    }

    pub fn scratch_dir(&self, unit: &UnitId) -> PathBuf {
        self.root.join(SCRATCH_DIR).join(unit.as_str())
    }

    /// Root scanned by registry rebuilds.
    pub fn results_root(&self) -> PathBuf {
        self.root.join(RESULTS_DIR)
    }

    pub fn result_dir(&self, unit: &UnitId) -> PathBuf {
        self.results_root().join(unit.as_str())
    }

    pub fn journal_path(&self) -> PathBuf {
        self.root.join(LOGS_DIR).join(JOURNAL_FILE)
    }
}

/// Removes a unit's scratch directory when dropped.
struct ScratchDir {
    path: PathBuf,
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = fsutil::remove_dir_if_exists(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove scratch directory");
        }
    }
}

/// Runs units against the registry and the external collaborators.
pub struct Orchestrator {
    store: RegistryStore,
    resolver: OverlapResolver,
    acquirer: Arc<dyn Acquirer>,
    processor: Arc<dyn Processor>,
    journal: Arc<ProcessingJournal>,
    layout: OutputLayout,
}

impl Orchestrator {
    /// Creates an orchestrator with the default reuse policy and no journal.
    pub fn new(
        layout: OutputLayout,
        store: RegistryStore,
        acquirer: Arc<dyn Acquirer>,
        processor: Arc<dyn Processor>,
    ) -> Self {
        Self {
            store,
            resolver: OverlapResolver::default(),
            acquirer,
            processor,
            journal: Arc::new(ProcessingJournal::disabled()),
            layout,
        }
    }

    pub fn with_resolver(mut self, resolver: OverlapResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_journal(mut self, journal: Arc<ProcessingJournal>) -> Self {
        self.journal = journal;
        self
    }

    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// Drives `unit` to a terminal state and returns its report.
    ///
    /// Never fails: every error becomes a `Failed` state on the unit.
    pub async fn run_unit(&self, mut unit: WorkUnit, ctx: UnitContext) -> UnitReport {
        if let Err(reason) = self.drive(&mut unit, &ctx).await {
            let result_dir = self.layout.result_dir(unit.id());
            if let Err(e) = tokio::fs::remove_dir_all(&result_dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(unit_id = %unit.id(), path = %result_dir.display(), error = %e, "Failed to remove unit outputs");
                }
            }
            self.fail(&mut unit, reason);
        }

        log_terminal(&unit);
        unit.into_report()
    }

    async fn drive(&self, unit: &mut WorkUnit, ctx: &UnitContext) -> Result<(), FailureReason> {
        let request = unit.request().clone();

        if let Some((scene_id, already_listed)) = self.find_reusable(&request).await? {
            unit.set_scene_id(scene_id.clone());
            self.advance(unit, UnitState::Skipped)?;
            if !already_listed {
                self.record_reuse(&scene_id, &request.name).await;
            }
            return Ok(());
        }

        if ctx.cancel.is_cancelled() {
            return Err(cancelled("run shut down before acquisition"));
        }
        self.advance(unit, UnitState::Acquiring)?;

        let scratch = ScratchDir {
            path: self.layout.scratch_dir(unit.id()),
        };
        tokio::fs::create_dir_all(&scratch.path)
            .await
            .map_err(|e| FailureReason::new(FailureKind::AcquisitionError, e.to_string()))?;

        let acquisition = AcquisitionRequest::new(
            unit.id(),
            request.reference_footprint.clone(),
            request.reference_time,
            request.search_window_days,
            request.required_polarization,
            scratch.path.clone(),
        );
        let inputs = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(cancelled("run shut down during acquisition")),
            result = self.acquirer.acquire(&acquisition) => result
                .map_err(|e| FailureReason::new(FailureKind::AcquisitionError, e.to_string()))?,
        };
        let required = request.required_polarization;
        let inputs = tokio::task::spawn_blocking(move || validate_inputs(&inputs, required).map(|()| inputs))
            .await
            .map_err(|e| FailureReason::new(FailureKind::ValidationError, e.to_string()))??;
        debug!(unit_id = %unit.id(), scene = %inputs.source.name, "Inputs acquired");

        let permit = ctx.admit().await?;
        self.advance(unit, UnitState::Processing)?;

        // Dispatched work is never interrupted; a shutdown only discards it.
        let job = ProcessingJob {
            unit_id: unit.id().to_string(),
            inputs: inputs.clone(),
            output_dir: self.layout.result_dir(unit.id()),
            slot: permit.slot(),
            gpu_id: permit.device(),
        };
        debug!(unit_id = %unit.id(), slot = job.slot, gpu = ?job.gpu_id, "Dispatching to processing");
        // The processor only returns once its program has exited, so the
        // slot is never released under a running job.
        let processed = self.processor.process(&job).await;
        drop(permit);
        tokio::task::spawn_blocking(move || drop(scratch))
            .await
            .map_err(|e| FailureReason::new(FailureKind::ProcessingError, e.to_string()))?;

        let output =
            processed.map_err(|e| FailureReason::new(FailureKind::ProcessingError, e.to_string()))?;
        if ctx.cancel.is_cancelled() {
            return Err(cancelled("run shut down during processing, result discarded"));
        }

        self.advance(unit, UnitState::Validating)?;
        let checked = {
            let request = request.clone();
            let source_footprint = inputs.source.footprint.clone();
            tokio::task::spawn_blocking(move || validate_outputs(&output, &request, &source_footprint))
                .await
                .map_err(|e| FailureReason::new(FailureKind::ValidationError, e.to_string()))?
        };
        let (manifest, footprint) = checked?;

        let now = Utc::now();
        let record = SceneRecord {
            scene_id: SceneId::derive(
                &inputs.source.name,
                request.required_polarization,
                now.date_naive(),
            ),
            source_scene: inputs.source.name.clone(),
            footprint,
            acquisition_time: inputs.source.acquisition_time,
            polarization: request.required_polarization,
            phase: request.phase,
            output_paths: manifest,
            status: SceneStatus::Processed,
            references: vec![request.name.clone()],
            created_at: now,
            updated_at: now,
        };

        {
            let output_dir = job.output_dir.clone();
            let record = record.clone();
            tokio::task::spawn_blocking(move || write_sidecar(&output_dir, &record))
                .await
                .map_err(|e| registry_failure(RegistryError::Task(e.to_string())))?
                .map_err(registry_failure)?;
        }
        self.commit_record(&record).await?;

        unit.set_scene_id(record.scene_id.clone());
        self.advance(unit, UnitState::Registered)
    }

    /// Best registered scene for `request` whose products are intact, with
    /// whether the request is already listed among its references.
    async fn find_reusable(&self, request: &WorkRequest) -> Result<Option<(SceneId, bool)>, FailureReason> {
        let store = self.store.clone();
        let resolver = self.resolver;
        let request = request.clone();
        tokio::task::spawn_blocking(move || {
            let registry = store.load()?;
            let hit = resolver.resolve_where(&registry, &request, |record| {
                let intact = record.outputs_present();
                if !intact {
                    warn!(
                        scene_id = %record.scene_id,
                        request = %request.name,
                        "Registered scene matches but its products are missing, not reusing it"
                    );
                }
                intact
            });
            Ok::<_, RegistryError>(hit.map(|record| {
                let listed = record.references.iter().any(|r| r == &request.name);
                (record.scene_id.clone(), listed)
            }))
        })
        .await
        .map_err(|e| registry_failure(RegistryError::Task(e.to_string())))?
        .map_err(registry_failure)
    }

    /// Commits `record`, re-checking its outputs on every attempt.
    ///
    /// A record already registered under the same id keeps its references.
    async fn commit_record(&self, record: &SceneRecord) -> Result<(), FailureReason> {
        let record = record.clone();
        self.store
            .commit(move |registry| {
                for (band, path) in &record.output_paths {
                    if !fsutil::file_status(path).is_usable() {
                        return Err(RegistryError::Rejected(format!(
                            "band {} output {} is missing or empty",
                            band,
                            path.display()
                        )));
                    }
                }
                let mut merged = record.clone();
                if let Some(existing) = registry.get(&record.scene_id) {
                    for reference in &existing.references {
                        merged.add_reference(reference, record.updated_at);
                    }
                }
                registry.upsert(merged);
                Ok(())
            })
            .await
            .map(|_| ())
            .map_err(registry_failure)
    }

    /// Records `reference` on a reused scene. Best effort.
    async fn record_reuse(&self, scene_id: &SceneId, reference: &str) {
        let now = Utc::now();
        let (id, name) = (scene_id.clone(), reference.to_string());
        let result = self
            .store
            .commit(move |registry| {
                if let Some(record) = registry.get_mut(&id) {
                    record.add_reference(&name, now);
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            warn!(scene_id = %scene_id, reference, error = %e, "Failed to record scene reuse");
        }
    }

    fn advance(&self, unit: &mut WorkUnit, next: UnitState) -> Result<(), FailureReason> {
        match unit.transition(next) {
            Ok(transition) => {
                self.journal
                    .record(unit.id(), &unit.request().name, &transition);
                Ok(())
            }
            Err(e) => {
                error!(unit_id = %unit.id(), error = %e, "Illegal unit transition");
                Err(FailureReason::new(FailureKind::ProcessingError, e.to_string()))
            }
        }
    }

    fn fail(&self, unit: &mut WorkUnit, reason: FailureReason) {
        match unit.transition(UnitState::Failed(reason)) {
            Ok(transition) => self
                .journal
                .record(unit.id(), &unit.request().name, &transition),
            Err(e) => error!(unit_id = %unit.id(), error = %e, "Failed to mark unit as failed"),
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.store.path())
            .field("policy", &self.resolver.policy())
            .field("layout", &self.layout)
            .finish()
    }
}

/// Maps a registry error onto the unit failure taxonomy.
pub fn registry_failure(error: RegistryError) -> FailureReason {
    let kind = match &error {
        RegistryError::Contention { .. } => FailureKind::RegistryContention,
        RegistryError::Corrupt { .. } => FailureKind::CorruptRegistry,
        RegistryError::Rejected(_) => FailureKind::ValidationError,
        RegistryError::Io { .. } | RegistryError::Serialize(_) | RegistryError::Task(_) => {
            FailureKind::RegistryUnavailable
        }
    };
    FailureReason::new(kind, error.to_string())
}

fn cancelled(detail: &str) -> FailureReason {
    FailureReason::new(FailureKind::Cancelled, detail)
}

fn log_terminal(unit: &WorkUnit) {
    let request: &WorkRequest = unit.request();
    match unit.state() {
        UnitState::Registered => info!(
            unit_id = %unit.id(),
            request = %request.name,
            scene_id = ?unit.scene_id().map(SceneId::as_str),
            "Unit registered"
        ),
        UnitState::Skipped => info!(
            unit_id = %unit.id(),
            request = %request.name,
            scene_id = ?unit.scene_id().map(SceneId::as_str),
            "Unit skipped, reusing registered scene"
        ),
        UnitState::Failed(reason) => warn!(
            unit_id = %unit.id(),
            request = %request.name,
            attempt = unit.attempt(),
            kind = %reason.kind,
            reason = %reason.detail,
            "Unit failed"
        ),
        other => error!(unit_id = %unit.id(), state = %other, "Unit finished in a non-terminal state"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = OutputLayout::new("/data/out");
        let unit = UnitId::new("unit-1");
        assert_eq!(layout.registry_path(), PathBuf::from("/data/out/sar_registry.json"));
        assert_eq!(layout.scratch_dir(&unit), PathBuf::from("/data/out/scratch/unit-1"));
        assert_eq!(layout.result_dir(&unit), PathBuf::from("/data/out/rtc/unit-1"));
        assert_eq!(
            layout.journal_path(),
            PathBuf::from("/data/out/logs/processing_log.jsonl")
        );
    }

    #[test]
    fn test_registry_failure_mapping() {
        assert_eq!(
            registry_failure(RegistryError::Contention { attempts: 5 }).kind,
            FailureKind::RegistryContention
        );
        assert_eq!(
            registry_failure(RegistryError::Corrupt {
                path: PathBuf::from("r.json"),
                reason: "bad".into()
            })
            .kind,
            FailureKind::CorruptRegistry
        );
        assert_eq!(
            registry_failure(RegistryError::Rejected("missing".into())).kind,
            FailureKind::ValidationError
        );
    }
}
