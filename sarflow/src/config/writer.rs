//! INI serialization logic for converting `ConfigFile` → INI string.
//!
//! This module contains the `to_config_string()` function that produces
//! the commented INI representation written to `config.ini`.

use std::path::Path;

use super::settings::{CompletionMode, ConfigFile};

/// Convert a `ConfigFile` to a commented INI string for saving.
pub(super) fn to_config_string(config: &ConfigFile) -> String {
    let registry_file = config
        .paths
        .registry_file
        .as_ref()
        .map(|p| path_to_string(p))
        .unwrap_or_default();
    let acquisition_command = config
        .acquisition
        .command
        .as_ref()
        .map(|p| path_to_string(p))
        .unwrap_or_default();
    let processing_command = config
        .processing
        .command
        .as_ref()
        .map(|p| path_to_string(p))
        .unwrap_or_default();
    let completion = match config.processing.completion {
        CompletionMode::Exit => "exit",
        CompletionMode::Marker => "marker",
    };

    format!(
        r#"[paths]
; Output root. Holds the scene registry, rtc/<unit>/ products,
; scratch/<unit>/ raw inputs and logs/processing_log.jsonl
output_dir = {}
; Registry document (default: <output_dir>/sar_registry.json)
registry_file = {}

[search]
; Defaults for requests that do not set their own values
; Maximum days between reference time and SAR acquisition (default: 30)
window_days = {}
; Footprint overlap tolerance in degrees (default: 0.01)
tolerance_degrees = {}
; Required polarization: single-pol (VV) or dual-pol (VV + VH)
polarization = {}
; Which registered scene to reuse when several match:
;   closest - smallest acquisition time difference (default)
;   latest  - most recently registered
reuse_policy = {}

[pipeline]
; Units processed at the same time (default: 2, range 1-64)
max_concurrent_jobs = {}
; Units submitted but not finished; 0 = unlimited
max_active_units = {}
; Seconds a unit may wait for a processing slot; 0 = wait forever
admission_timeout_secs = {}
; Times a unit is re-queued after losing registry commit races (default: 2)
requeue_limit = {}
; Check registry outputs after every batch (default: true)
validate_registry = {}

[registry]
; Commit attempts before a unit fails with registry contention (default: 5)
commit_attempts = {}
; Backoff between commit attempts, doubled each time with jitter
initial_backoff_ms = {}
max_backoff_ms = {}
; Seconds after which an abandoned commit lock is recovered (default: 30)
lock_stale_secs = {}
; Rebuild a corrupt registry from result sidecars instead of halting (default: false)
rebuild_on_corrupt = {}

[acquisition]
; Program that downloads DEM, orbit and SLC scene. Receives the request as
; JSON on stdin and prints the acquired paths as JSON on stdout.
command = {}
; Extra arguments, separated by spaces
args = {}
; Seconds before acquisition is abandoned; 0 = no limit
timeout_secs = {}

[processing]
; Program that runs terrain correction. Receives the job as JSON on stdin and
; runs inside the unit's output directory.
command = {}
args = {}
; Seconds before processing is reported as failed; 0 = no limit
timeout_secs = {}
; How completion is detected:
;   exit   - the program finishes the job before exiting (default)
;   marker - the program submits the job; completion is a marker file
completion = {}
marker_file = {}
; Marker polling interval, doubling from initial to max (seconds)
poll_initial_secs = {}
poll_max_secs = {}
; GPUs assigned to processing slots round-robin (e.g. 0 1). The program sees
; its slot's GPU as CUDA_VISIBLE_DEVICES. Empty = no assignment
gpu_ids = {}

[logging]
; Log file, truncated at the start of each run
file = {}
; Default filter when RUST_LOG is not set (e.g. info, debug, sarflow=debug)
level = {}
"#,
        path_to_string(&config.paths.output_dir),
        registry_file,
        config.search.window_days,
        config.search.tolerance_degrees,
        config.search.polarization,
        config.search.reuse_policy,
        config.pipeline.max_concurrent_jobs,
        config.pipeline.max_active_units,
        config.pipeline.admission_timeout_secs,
        config.pipeline.requeue_limit,
        config.pipeline.validate_registry,
        config.registry.commit_attempts,
        config.registry.initial_backoff_ms,
        config.registry.max_backoff_ms,
        config.registry.lock_stale_secs,
        config.registry.rebuild_on_corrupt,
        acquisition_command,
        config.acquisition.args.join(" "),
        config.acquisition.timeout_secs,
        processing_command,
        config.processing.args.join(" "),
        config.processing.timeout_secs,
        completion,
        config.processing.marker_file,
        config.processing.poll_initial_secs,
        config.processing.poll_max_secs,
        config
            .processing
            .gpu_ids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(" "),
        path_to_string(&config.logging.file),
        config.logging.level,
    )
}

/// Converts a path to a string, replacing home directory with ~ for readability.
fn path_to_string(path: &Path) -> String {
    if let Some(home) = dirs::home_dir() {
        if let Ok(stripped) = path.strip_prefix(&home) {
            return format!("~/{}", stripped.display());
        }
    }
    path.display().to_string()
}
