//! Contracts for the external systems the pipeline drives.
//!
//! Acquisition (DEM, orbit and SAR scene download) and processing
//! (terrain correction) are opaque to the orchestrator: it only sees the
//! paths they hand back, their status and their output manifest. Both are
//! dyn-compatible traits returning boxed futures so the orchestrator can
//! hold them as `Arc<dyn ...>`.
//!
//! [`CommandAcquirer`] and [`CommandProcessor`] implement the contracts by
//! running configured programs.

mod command;

pub use command::{CommandAcquirer, CommandProcessor, Completion, MarkerPolling};
pub use futures::future::BoxFuture;

use crate::geo::Footprint;
use crate::pipeline::UnitId;
use crate::registry::Polarization;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// What the orchestrator asks the acquisition collaborator for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionRequest {
    pub unit_id: String,
    pub footprint: Footprint,
    pub reference_time: DateTime<Utc>,
    pub window_days: i64,
    pub polarization: Polarization,
    /// Directory the inputs must be placed in; removed after the unit ends
    pub scratch_dir: PathBuf,
}

/// Description of the SAR acquisition that was downloaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceScene {
    pub name: String,
    pub acquisition_time: DateTime<Utc>,
    pub footprint: Footprint,
    pub polarization: Polarization,
}

/// Paths produced by acquisition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquiredInputs {
    pub dem_path: PathBuf,
    pub orbit_path: PathBuf,
    pub scene_path: PathBuf,
    pub source: SourceScene,
}

/// Work handed to the processing collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub unit_id: String,
    pub inputs: AcquiredInputs,
    /// Durable directory the products must be written to
    pub output_dir: PathBuf,
    /// Admission slot the job runs in
    #[serde(default)]
    pub slot: usize,
    /// GPU assigned to the slot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_id: Option<u32>,
}

/// Completion status reported by processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Completed,
    Failed,
}

/// What processing reports back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingOutput {
    pub status: ProcessingStatus,
    /// Failure detail from the processing system
    #[serde(default)]
    pub message: Option<String>,
    /// Band name to product path
    #[serde(default)]
    pub manifest: BTreeMap<String, PathBuf>,
    /// Footprint of the products if it differs from the source scene
    #[serde(default)]
    pub footprint: Option<Footprint>,
}

/// Acquisition failures.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("No suitable scene found: {0}")]
    NoScene(String),

    #[error("Acquisition failed: {0}")]
    Failed(String),

    #[error("Acquisition timed out after {0:?}")]
    Timeout(Duration),

    #[error("Acquisition returned unusable output: {0}")]
    InvalidOutput(String),

    #[error("Acquisition I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Processing failures.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Processing failed: {0}")]
    Failed(String),

    #[error("Processing timed out after {0:?}")]
    Timeout(Duration),

    #[error("Processing returned unusable output: {0}")]
    InvalidOutput(String),

    #[error("Processing I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Downloads everything one unit needs.
pub trait Acquirer: Send + Sync {
    fn acquire<'a>(
        &'a self,
        request: &'a AcquisitionRequest,
    ) -> BoxFuture<'a, Result<AcquiredInputs, AcquisitionError>>;
}

/// Runs terrain correction for one unit.
///
/// Implementations must not return before the external work has finished;
/// the orchestrator treats a returned output as final.
pub trait Processor: Send + Sync {
    fn process<'a>(
        &'a self,
        job: &'a ProcessingJob,
    ) -> BoxFuture<'a, Result<ProcessingOutput, ProcessingError>>;
}

impl ProcessingOutput {
    /// A completed output with the given manifest.
    pub fn completed(manifest: BTreeMap<String, PathBuf>) -> Self {
        Self {
            status: ProcessingStatus::Completed,
            message: None,
            manifest,
            footprint: None,
        }
    }
}

impl AcquisitionRequest {
    pub fn new(
        unit_id: &UnitId,
        footprint: Footprint,
        reference_time: DateTime<Utc>,
        window_days: i64,
        polarization: Polarization,
        scratch_dir: PathBuf,
    ) -> Self {
        Self {
            unit_id: unit_id.to_string(),
            footprint,
            reference_time,
            window_days,
            polarization,
            scratch_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Footprint;
    use chrono::TimeZone;

    #[test]
    fn test_processing_output_wire_format() {
        let json = r#"{"status": "completed", "manifest": {"VV": "/out/a_VV.tif"}}"#;
        let output: ProcessingOutput = serde_json::from_str(json).unwrap();
        assert_eq!(output.status, ProcessingStatus::Completed);
        assert_eq!(output.manifest["VV"], PathBuf::from("/out/a_VV.tif"));
        assert!(output.footprint.is_none());

        let json = r#"{"status": "failed", "message": "gpu lost"}"#;
        let output: ProcessingOutput = serde_json::from_str(json).unwrap();
        assert_eq!(output.status, ProcessingStatus::Failed);
        assert_eq!(output.message.as_deref(), Some("gpu lost"));
    }

    #[test]
    fn test_processing_job_carries_gpu() {
        let t = Utc.with_ymd_and_hms(2023, 2, 6, 0, 0, 0).unwrap();
        let footprint = Footprint::from_bounds(36.0, 36.0, 37.0, 37.0).unwrap();
        let job = ProcessingJob {
            unit_id: "unit-1".into(),
            inputs: AcquiredInputs {
                dem_path: "/s/dem.tif".into(),
                orbit_path: "/s/orbit.EOF".into(),
                scene_path: "/s/scene.zip".into(),
                source: SourceScene {
                    name: "scene".into(),
                    acquisition_time: t,
                    footprint,
                    polarization: Polarization::DualPol,
                },
            },
            output_dir: "/out/rtc/unit-1".into(),
            slot: 1,
            gpu_id: Some(3),
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["slot"], 1);
        assert_eq!(value["gpu_id"], 3);

        let without_gpu = ProcessingJob { gpu_id: None, ..job };
        let value = serde_json::to_value(&without_gpu).unwrap();
        assert!(value.get("gpu_id").is_none());
    }
}
