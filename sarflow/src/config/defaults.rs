//! Default values and constants for all configuration settings.
//!
//! Contains all `DEFAULT_*` constants and the `ConfigFile::default()`
//! implementation.

use std::path::PathBuf;

use super::settings::*;
use crate::pipeline::{
    DEFAULT_POLARIZATION, DEFAULT_REQUEUE_LIMIT, DEFAULT_SEARCH_WINDOW_DAYS,
    DEFAULT_TOLERANCE_DEGREES,
};
use crate::registry::{
    DEFAULT_COMMIT_ATTEMPTS, DEFAULT_INITIAL_BACKOFF, DEFAULT_LOCK_STALE_AFTER,
    DEFAULT_MAX_BACKOFF,
};
use crate::resolver::ReusePolicy;
use crate::scheduler::DEFAULT_MAX_CONCURRENT;

// =============================================================================
// Pipeline
// =============================================================================

/// Default admission timeout (seconds); 0 waits indefinitely.
pub const DEFAULT_ADMISSION_TIMEOUT_SECS: u64 = 0;

/// Default limit on submitted-but-unfinished units; 0 = unlimited.
pub const DEFAULT_MAX_ACTIVE_UNITS: usize = 0;

/// Minimum processing concurrency.
pub const MIN_CONCURRENT_JOBS: usize = 1;

/// Maximum processing concurrency.
///
/// Each unit runs a full terrain-correction job; more than this is never
/// useful on one host.
pub const MAX_CONCURRENT_JOBS: usize = 64;

// =============================================================================
// Collaborators
// =============================================================================

/// Default marker file written by batch-queue processing jobs.
pub const DEFAULT_MARKER_FILE: &str = "DONE";

/// Default first marker poll interval (seconds).
pub const DEFAULT_POLL_INITIAL_SECS: u64 = 5;

/// Default longest marker poll interval (seconds).
pub const DEFAULT_POLL_MAX_SECS: u64 = 120;

// =============================================================================
// Logging
// =============================================================================

/// Default log filter.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default log file name inside the config directory.
pub const DEFAULT_LOG_FILE: &str = "sarflow.log";

/// Clamps processing concurrency to the valid range, warning when changed.
pub(super) fn clamp_concurrent_jobs(value: usize) -> usize {
    let clamped = value.clamp(MIN_CONCURRENT_JOBS, MAX_CONCURRENT_JOBS);
    if clamped != value {
        tracing::warn!(
            requested = value,
            min = MIN_CONCURRENT_JOBS,
            max = MAX_CONCURRENT_JOBS,
            "max_concurrent_jobs out of range, clamping to {}",
            clamped
        );
    }
    clamped
}

/// Default output root: the platform data directory.
pub fn default_output_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sarflow")
}

impl Default for ConfigFile {
    fn default() -> Self {
        let config_dir = super::file::config_directory();

        Self {
            paths: PathsSettings {
                output_dir: default_output_dir(),
                registry_file: None,
            },
            search: SearchSettings {
                window_days: DEFAULT_SEARCH_WINDOW_DAYS,
                tolerance_degrees: DEFAULT_TOLERANCE_DEGREES,
                polarization: DEFAULT_POLARIZATION,
                reuse_policy: ReusePolicy::default(),
            },
            pipeline: PipelineSettings {
                max_concurrent_jobs: DEFAULT_MAX_CONCURRENT,
                max_active_units: DEFAULT_MAX_ACTIVE_UNITS,
                admission_timeout_secs: DEFAULT_ADMISSION_TIMEOUT_SECS,
                requeue_limit: DEFAULT_REQUEUE_LIMIT,
                validate_registry: true,
            },
            registry: RegistrySettings {
                commit_attempts: DEFAULT_COMMIT_ATTEMPTS,
                initial_backoff_ms: DEFAULT_INITIAL_BACKOFF.as_millis() as u64,
                max_backoff_ms: DEFAULT_MAX_BACKOFF.as_millis() as u64,
                lock_stale_secs: DEFAULT_LOCK_STALE_AFTER.as_secs(),
                rebuild_on_corrupt: false,
            },
            acquisition: AcquisitionSettings {
                command: None,
                args: Vec::new(),
                timeout_secs: 0,
            },
            processing: ProcessingSettings {
                command: None,
                args: Vec::new(),
                timeout_secs: 0,
                completion: CompletionMode::Exit,
                marker_file: DEFAULT_MARKER_FILE.to_string(),
                poll_initial_secs: DEFAULT_POLL_INITIAL_SECS,
                poll_max_secs: DEFAULT_POLL_MAX_SECS,
                gpu_ids: Vec::new(),
            },
            logging: LoggingSettings {
                file: config_dir.join(DEFAULT_LOG_FILE),
                level: DEFAULT_LOG_LEVEL.to_string(),
            },
        }
    }
}
