//! Durable registry storage with optimistic commits.
//!
//! # Commit protocol
//!
//! 1. Load the latest document and remember its `generation`.
//! 2. Apply the caller's mutation to the loaded copy.
//! 3. Serialize it into a temp file in the registry directory and fsync.
//! 4. Take the commit lock, re-read the generation, and rename the temp
//!    file over the registry only if nobody committed in between.
//!
//! A conflict (generation moved or lock held) restarts from step 1 after a
//! jittered exponential backoff. The previous document stays in place
//! through any crash because the only mutation of the registry path is the
//! rename.
//!
//! The async entry points run their disk work on the blocking thread pool;
//! the synchronous ones ([`RegistryStore::load`], [`RegistryStore::validate`]
//! and friends) are for callers that are not on a Tokio worker.

use super::lock::CommitLock;
use super::types::{Registry, RegistryIssue, SceneRecord, REGISTRY_VERSION};
use super::{RegistryError, Result};
use crate::fsutil::{self, FileStatus};
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration Constants
// =============================================================================

/// Default registry file name inside the output root.
pub const REGISTRY_FILE: &str = "sar_registry.json";

/// Per-result sidecar used by `rebuild`.
pub const SIDECAR_FILE: &str = "scene.json";

/// Default number of commit attempts before giving up.
pub const DEFAULT_COMMIT_ATTEMPTS: u32 = 5;

/// Default first backoff delay between commit attempts.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(25);

/// Default backoff ceiling.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(2);

/// A lock sentinel older than this is considered abandoned.
pub const DEFAULT_LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

/// Retry behaviour for contended commits.
#[derive(Debug, Clone)]
pub struct CommitPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub lock_stale_after: Duration,
}

impl Default for CommitPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_COMMIT_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            lock_stale_after: DEFAULT_LOCK_STALE_AFTER,
        }
    }
}

impl CommitPolicy {
    /// Exponential delay for a 0-indexed attempt, capped, scaled by a random
    /// factor in `[0.5, 1.0]` so competing writers spread out.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = 2f64.powi(attempt.min(30) as i32);
        let base = (self.initial_backoff.as_secs_f64() * exp).min(self.max_backoff.as_secs_f64());
        let jitter: f64 = rand::rng().random_range(0.5..=1.0);
        Duration::from_secs_f64(base * jitter)
    }
}

/// Result of publishing a staged commit.
#[derive(Debug)]
pub enum PublishOutcome {
    /// The document was replaced; carries the committed state.
    Published(Registry),
    /// Another writer committed first or holds the lock.
    Conflict,
}

/// A fully written but not yet visible registry replacement.
///
/// Dropping it without calling [`StagedCommit::publish`] deletes the temp
/// file and leaves the registry untouched.
#[derive(Debug)]
pub struct StagedCommit<'a> {
    store: &'a RegistryStore,
    temp: NamedTempFile,
    base_generation: u64,
    registry: Registry,
}

impl StagedCommit<'_> {
    /// The state that publishing would make visible.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Path of the staged temp file.
    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }

    /// Renames the staged document over the registry if no other commit
    /// happened since it was staged.
    pub fn publish(self) -> Result<PublishOutcome> {
        let store = self.store;
        let lock = CommitLock::try_acquire(&store.lock_path, store.policy.lock_stale_after)
            .map_err(|e| store.io_error(&store.lock_path, e))?;
        let Some(lock) = lock else {
            return Ok(PublishOutcome::Conflict);
        };

        let current = store.load()?.generation;
        if current != self.base_generation {
            debug!(
                expected = self.base_generation,
                found = current,
                "Registry generation moved, discarding staged commit"
            );
            return Ok(PublishOutcome::Conflict);
        }
        if !lock.is_held() {
            warn!(path = %store.lock_path.display(), "Registry lock taken over before rename");
            return Ok(PublishOutcome::Conflict);
        }

        fsutil::persist_staged(self.temp, &store.path).map_err(|e| store.io_error(&store.path, e))?;
        Ok(PublishOutcome::Published(self.registry))
    }
}

/// Outcome of [`RegistryStore::rebuild`].
#[derive(Debug)]
pub struct RebuildReport {
    pub registry: Registry,
    /// Copy of the document that was replaced, if there was one.
    pub backup: Option<PathBuf>,
    /// Sidecars that were found but not recovered.
    pub rejected: Vec<RegistryIssue>,
    /// Abandoned staged commits that were deleted.
    pub swept: Vec<PathBuf>,
}

/// File-backed registry.
///
/// Cheap to clone; every clone refers to the same document on disk and all
/// coordination goes through the filesystem, so separate processes behave
/// like separate clones.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
    lock_path: PathBuf,
    policy: CommitPolicy,
}

impl RegistryStore {
    /// Creates a store for the registry document at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = sibling(&path, "lock");
        Self {
            path,
            lock_path,
            policy: CommitPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: CommitPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> &CommitPolicy {
        &self.policy
    }

    /// Sentinel file that serializes publishes.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Reads the persisted registry.
    ///
    /// A missing document is an empty registry. A document that does not
    /// parse, carries an unsupported version or repeats a scene id is
    /// reported as [`RegistryError::Corrupt`].
    pub fn load(&self) -> Result<Registry> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Registry::new()),
            Err(e) => return Err(self.io_error(&self.path, e)),
        };

        let registry: Registry =
            serde_json::from_slice(&bytes).map_err(|e| self.corrupt(e.to_string()))?;

        if registry.version != REGISTRY_VERSION {
            return Err(self.corrupt(format!(
                "unsupported version {} (expected {})",
                registry.version, REGISTRY_VERSION
            )));
        }
        if let Some(dup) = registry.find_duplicate() {
            return Err(self.corrupt(format!("duplicate scene id {}", dup)));
        }

        Ok(registry)
    }

    /// [`load`](Self::load) on the blocking thread pool.
    pub async fn snapshot(&self) -> Result<Registry> {
        self.blocking(|store| store.load()).await
    }

    /// Applies `mutation` to the latest state and writes the result to a
    /// temp file without publishing it.
    pub fn stage<F>(&self, mutation: F) -> Result<StagedCommit<'_>>
    where
        F: FnOnce(&mut Registry) -> Result<()>,
    {
        let mut registry = self.load()?;
        let base_generation = registry.generation;

        mutation(&mut registry)?;
        if let Some(dup) = registry.find_duplicate() {
            return Err(RegistryError::Rejected(format!("duplicate scene id {}", dup)));
        }
        registry.generation = base_generation + 1;

        let bytes = serde_json::to_vec_pretty(&registry)?;
        let temp = fsutil::stage_file(&self.path, &bytes).map_err(|e| self.io_error(&self.path, e))?;

        Ok(StagedCommit {
            store: self,
            temp,
            base_generation,
            registry,
        })
    }

    /// Atomically applies `mutation` to the latest on-disk state.
    ///
    /// The mutation may run several times (once per attempt) and must be
    /// repeatable. It runs on the blocking thread pool together with the
    /// load, stage and publish of its attempt, so it may read the
    /// filesystem. Returning an error from it aborts the commit without
    /// retrying. After `max_attempts` conflicts the commit fails with
    /// [`RegistryError::Contention`].
    pub async fn commit<F>(&self, mutation: F) -> Result<Registry>
    where
        F: FnMut(&mut Registry) -> Result<()> + Send + 'static,
    {
        let mutation = Arc::new(Mutex::new(mutation));
        let attempts = self.policy.max_attempts.max(1);
        for attempt in 0..attempts {
            let mutation = Arc::clone(&mutation);
            let outcome = self
                .blocking(move |store| {
                    let mut mutation = mutation.lock();
                    store.stage(&mut *mutation)?.publish()
                })
                .await?;
            match outcome {
                PublishOutcome::Published(registry) => {
                    debug!(
                        generation = registry.generation,
                        attempt = attempt + 1,
                        "Registry commit published"
                    );
                    return Ok(registry);
                }
                PublishOutcome::Conflict => {
                    let delay = self.policy.backoff_delay(attempt);
                    debug!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Registry commit conflicted, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        warn!(attempts, path = %self.path.display(), "Registry commit abandoned under contention");
        Err(RegistryError::Contention { attempts })
    }

    /// Checks that every processed record's outputs exist and are non-empty,
    /// and reports staged commits abandoned by crashed writers.
    pub fn validate(&self) -> Result<Vec<RegistryIssue>> {
        let registry = self.load()?;
        let mut issues = Vec::new();

        for record in registry.processed() {
            if record.output_paths.is_empty() {
                issues.push(RegistryIssue::NoOutputs {
                    scene_id: record.scene_id.clone(),
                });
            }
            for (band, path) in &record.output_paths {
                match fsutil::file_status(path) {
                    FileStatus::Present(_) => {}
                    FileStatus::Empty => issues.push(RegistryIssue::EmptyOutput {
                        scene_id: record.scene_id.clone(),
                        band: band.clone(),
                        path: path.clone(),
                    }),
                    FileStatus::Missing => issues.push(RegistryIssue::MissingOutput {
                        scene_id: record.scene_id.clone(),
                        band: band.clone(),
                        path: path.clone(),
                    }),
                }
            }
        }

        for path in self.abandoned_stages()? {
            issues.push(RegistryIssue::AbandonedStage { path });
        }

        Ok(issues)
    }

    /// [`validate`](Self::validate) plus [`find_unregistered`](Self::find_unregistered)
    /// on the blocking thread pool.
    pub async fn audit(&self, scan_root: &Path) -> Result<Vec<RegistryIssue>> {
        let scan_root = scan_root.to_path_buf();
        self.blocking(move |store| {
            let mut issues = store.validate()?;
            issues.extend(store.find_unregistered(&scan_root)?);
            Ok(issues)
        })
        .await
    }

    /// Reports result directories under `scan_root` that the registry does
    /// not know about.
    pub fn find_unregistered(&self, scan_root: &Path) -> Result<Vec<RegistryIssue>> {
        let registry = self.load()?;
        let (sidecars, mut issues) = scan_sidecars(scan_root);

        for (sidecar, record) in sidecars {
            if !registry.contains(&record.scene_id) {
                issues.push(RegistryIssue::Unregistered {
                    scene_id: record.scene_id,
                    sidecar,
                });
            }
        }

        Ok(issues)
    }

    /// Reconstructs the registry from the sidecars under `scan_root`.
    ///
    /// Only processed records whose outputs are all present and non-empty
    /// are recovered; when a scene id appears twice the most recently
    /// updated sidecar wins. The existing document, readable or not, is
    /// copied to `<registry>.backup.<unix_ms>` before being replaced, and
    /// staged commits abandoned next to it are deleted.
    pub async fn rebuild(&self, scan_root: &Path) -> Result<RebuildReport> {
        let scan_root = scan_root.to_path_buf();
        let (recovered, rejected) = self
            .blocking(move |_| Ok(recover_sidecars(&scan_root)))
            .await?;

        let lock = self.acquire_lock().await?;
        self.blocking(move |store| {
            let report = store.replace_with(recovered, rejected);
            drop(lock);
            report
        })
        .await
    }

    fn replace_with(
        &self,
        recovered: Vec<SceneRecord>,
        rejected: Vec<RegistryIssue>,
    ) -> Result<RebuildReport> {
        let previous_generation = match self.load() {
            Ok(registry) => registry.generation,
            Err(RegistryError::Corrupt { .. }) => 0,
            Err(e) => return Err(e),
        };
        let backup = self.backup()?;

        let registry = Registry::from_scenes(previous_generation + 1, recovered);
        let bytes = serde_json::to_vec_pretty(&registry)?;
        fsutil::write_atomic(&self.path, &bytes).map_err(|e| self.io_error(&self.path, e))?;

        let mut swept = Vec::new();
        for path in self.abandoned_stages()? {
            match fs::remove_file(&path) {
                Ok(()) => swept.push(path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(self.io_error(&path, e)),
            }
        }

        info!(
            scenes = registry.len(),
            rejected = rejected.len(),
            swept = swept.len(),
            path = %self.path.display(),
            "Registry rebuilt"
        );

        Ok(RebuildReport {
            registry,
            backup,
            rejected,
            swept,
        })
    }

    /// Copies the current document aside. Returns `None` if there is none.
    pub fn backup(&self) -> Result<Option<PathBuf>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let target = sibling(&self.path, &format!("backup.{}", Utc::now().timestamp_millis()));
        fs::copy(&self.path, &target).map_err(|e| self.io_error(&target, e))?;
        info!(backup = %target.display(), "Registry backed up");
        Ok(Some(target))
    }

    async fn acquire_lock(&self) -> Result<CommitLock> {
        let attempts = self.policy.max_attempts.max(1);
        for attempt in 0..attempts {
            let lock = self
                .blocking(|store| {
                    CommitLock::try_acquire(&store.lock_path, store.policy.lock_stale_after)
                        .map_err(|e| store.io_error(&store.lock_path, e))
                })
                .await?;
            if let Some(lock) = lock {
                return Ok(lock);
            }
            tokio::time::sleep(self.policy.backoff_delay(attempt)).await;
        }
        Err(RegistryError::Contention { attempts })
    }

    /// Staged commits next to the registry older than the lock stale
    /// threshold. No live writer keeps a stage that long.
    fn abandoned_stages(&self) -> Result<Vec<PathBuf>> {
        let dir = fsutil::parent_dir(&self.path);
        fsutil::stale_stage_files(dir, self.policy.lock_stale_after)
            .map_err(|e| self.io_error(dir, e))
    }

    /// Runs `work` on the blocking thread pool with a clone of this store.
    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&RegistryStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || work(&store))
            .await
            .map_err(|e| RegistryError::Task(e.to_string()))?
    }

    fn corrupt(&self, reason: String) -> RegistryError {
        RegistryError::Corrupt {
            path: self.path.clone(),
            reason,
        }
    }

    fn io_error(&self, path: &Path, source: io::Error) -> RegistryError {
        RegistryError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Writes the sidecar for a result directory.
pub fn write_sidecar(result_dir: &Path, record: &SceneRecord) -> Result<PathBuf> {
    let path = result_dir.join(SIDECAR_FILE);
    let bytes = serde_json::to_vec_pretty(record)?;
    fsutil::write_atomic(&path, &bytes).map_err(|source| RegistryError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| REGISTRY_FILE.to_string());
    path.with_file_name(format!("{}.{}", name, suffix))
}

/// Keeps the recoverable records among the sidecars under `root`.
fn recover_sidecars(root: &Path) -> (Vec<SceneRecord>, Vec<RegistryIssue>) {
    let (sidecars, mut rejected) = scan_sidecars(root);

    let mut recovered: HashMap<_, SceneRecord> = HashMap::new();
    for (sidecar, record) in sidecars {
        if !record.is_processed() {
            continue;
        }
        if !record.outputs_present() {
            rejected.push(RegistryIssue::UnreadableSidecar {
                sidecar,
                reason: "outputs missing or empty".to_string(),
            });
            continue;
        }
        match recovered.get(&record.scene_id) {
            Some(existing) if existing.updated_at >= record.updated_at => {}
            _ => {
                recovered.insert(record.scene_id.clone(), record);
            }
        }
    }
    (recovered.into_values().collect(), rejected)
}

/// Walks `root` collecting parseable sidecars and issues for the rest.
fn scan_sidecars(root: &Path) -> (Vec<(PathBuf, SceneRecord)>, Vec<RegistryIssue>) {
    let mut found = Vec::new();
    let mut issues = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() && entry.file_name() == SIDECAR_FILE {
                match fs::read(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|b| serde_json::from_slice::<SceneRecord>(&b).map_err(|e| e.to_string()))
                {
                    Ok(record) => found.push((path, record)),
                    Err(reason) => issues.push(RegistryIssue::UnreadableSidecar {
                        sidecar: path,
                        reason,
                    }),
                }
            }
        }
    }

    found.sort_by(|a, b| a.0.cmp(&b.0));
    (found, issues)
}
