//! Settings structs for all configuration sections.
//!
//! Each struct represents one `[section]` of the INI config file. Besides
//! plain data, the sections know how to turn themselves into the runtime
//! types they configure.

use crate::collaborator::{CommandAcquirer, CommandProcessor, Completion, MarkerPolling};
use crate::pipeline::{BatchOptions, RequestDefaults};
use crate::registry::{CommitPolicy, Polarization, REGISTRY_FILE};
use crate::resolver::ReusePolicy;
use std::path::PathBuf;
use std::time::Duration;

/// Complete application configuration loaded from config.ini.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub paths: PathsSettings,
    pub search: SearchSettings,
    pub pipeline: PipelineSettings,
    pub registry: RegistrySettings,
    pub acquisition: AcquisitionSettings,
    pub processing: ProcessingSettings,
    pub logging: LoggingSettings,
}

/// Output locations.
#[derive(Debug, Clone)]
pub struct PathsSettings {
    /// Output root holding the registry, `rtc/`, `scratch/` and `logs/`
    pub output_dir: PathBuf,
    /// Registry document; defaults to `<output_dir>/sar_registry.json`
    pub registry_file: Option<PathBuf>,
}

impl PathsSettings {
    pub fn registry_path(&self) -> PathBuf {
        self.registry_file
            .clone()
            .unwrap_or_else(|| self.output_dir.join(REGISTRY_FILE))
    }
}

/// Matching defaults applied to requests that do not set them.
#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub window_days: i64,
    pub tolerance_degrees: f64,
    pub polarization: Polarization,
    pub reuse_policy: ReusePolicy,
}

impl SearchSettings {
    pub fn request_defaults(&self) -> RequestDefaults {
        RequestDefaults {
            polarization: self.polarization,
            search_window_days: self.window_days,
            tolerance_degrees: self.tolerance_degrees,
        }
    }
}

/// Batch execution settings.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Units allowed in processing at once
    pub max_concurrent_jobs: usize,
    /// Submitted but unfinished units; 0 = unlimited
    pub max_active_units: usize,
    /// Admission wait limit in seconds; 0 = wait forever
    pub admission_timeout_secs: u64,
    pub requeue_limit: u32,
    /// Validate registry outputs after each batch
    pub validate_registry: bool,
}

/// Registry commit behaviour.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub commit_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub lock_stale_secs: u64,
    pub rebuild_on_corrupt: bool,
}

impl RegistrySettings {
    pub fn commit_policy(&self) -> CommitPolicy {
        CommitPolicy {
            max_attempts: self.commit_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            lock_stale_after: Duration::from_secs(self.lock_stale_secs),
        }
    }
}

/// External acquisition program.
#[derive(Debug, Clone)]
pub struct AcquisitionSettings {
    pub command: Option<PathBuf>,
    pub args: Vec<String>,
    /// Seconds; 0 = no limit
    pub timeout_secs: u64,
}

impl AcquisitionSettings {
    /// The configured acquirer, if a command is set.
    pub fn acquirer(&self) -> Option<CommandAcquirer> {
        let command = self.command.as_ref()?;
        Some(
            CommandAcquirer::new(command)
                .with_args(self.args.clone())
                .with_timeout(non_zero_secs(self.timeout_secs)),
        )
    }
}

/// How the processing program reports completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    Exit,
    Marker,
}

/// External processing program.
#[derive(Debug, Clone)]
pub struct ProcessingSettings {
    pub command: Option<PathBuf>,
    pub args: Vec<String>,
    /// Seconds; 0 = no limit
    pub timeout_secs: u64,
    pub completion: CompletionMode,
    pub marker_file: String,
    pub poll_initial_secs: u64,
    pub poll_max_secs: u64,
    /// GPUs handed to processing slots round-robin; empty for none
    pub gpu_ids: Vec<u32>,
}

impl ProcessingSettings {
    /// The configured processor, if a command is set.
    pub fn processor(&self) -> Option<CommandProcessor> {
        let command = self.command.as_ref()?;
        let completion = match self.completion {
            CompletionMode::Exit => Completion::Exit,
            CompletionMode::Marker => Completion::Marker(MarkerPolling {
                file_name: self.marker_file.clone(),
                initial_interval: Duration::from_secs(self.poll_initial_secs.max(1)),
                max_interval: Duration::from_secs(self.poll_max_secs.max(self.poll_initial_secs).max(1)),
            }),
        };
        Some(
            CommandProcessor::new(command)
                .with_args(self.args.clone())
                .with_timeout(non_zero_secs(self.timeout_secs))
                .with_completion(completion),
        )
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingSettings {
    /// Log file path
    pub file: PathBuf,
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
}

impl ConfigFile {
    /// Batch options assembled from `[pipeline]` and `[registry]`.
    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            max_concurrent: self.pipeline.max_concurrent_jobs,
            max_active_units: self.pipeline.max_active_units,
            admission_timeout: non_zero_secs(self.pipeline.admission_timeout_secs),
            requeue_limit: self.pipeline.requeue_limit,
            rebuild_on_corrupt: self.registry.rebuild_on_corrupt,
            validate_registry: self.pipeline.validate_registry,
            gpu_ids: self.processing.gpu_ids.clone(),
        }
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
