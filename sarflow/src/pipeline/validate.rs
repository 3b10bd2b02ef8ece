//! Checks applied to collaborator results before the pipeline moves on.
//!
//! Input checks run after acquisition, output checks after processing. Both
//! return a [`FailureReason`] so the caller can fail the unit directly.

use super::request::WorkRequest;
use super::state::{FailureKind, FailureReason};
use crate::collaborator::{AcquiredInputs, ProcessingOutput, ProcessingStatus};
use crate::fsutil::{file_status, FileStatus};
use crate::geo::{overlaps, Footprint};
use crate::registry::Polarization;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Smallest plausible SLC archive.
pub const MIN_SCENE_ARCHIVE_BYTES: u64 = 1024;

const DEM_EXTENSIONS: &[&str] = &["tif", "tiff", "vrt"];
const ORBIT_EXTENSIONS: &[&str] = &["eof"];

/// Verifies that acquisition produced usable DEM, orbit and scene files for
/// a scene with at least the `required` polarization.
pub fn validate_inputs(inputs: &AcquiredInputs, required: Polarization) -> Result<(), FailureReason> {
    if !inputs.source.polarization.satisfies(required) {
        return Err(input_failure(format!(
            "scene {} is {}, {} required",
            inputs.source.name, inputs.source.polarization, required
        )));
    }
    check_input("DEM", &inputs.dem_path, DEM_EXTENSIONS)?;
    check_input("orbit", &inputs.orbit_path, ORBIT_EXTENSIONS)?;
    check_scene_archive(&inputs.scene_path)
}

fn check_input(label: &str, path: &Path, extensions: &[&str]) -> Result<(), FailureReason> {
    match file_status(path) {
        FileStatus::Missing => {
            return Err(input_failure(format!("{} file missing: {}", label, path.display())))
        }
        FileStatus::Empty => {
            return Err(input_failure(format!("{} file is empty: {}", label, path.display())))
        }
        FileStatus::Present(_) => {}
    }
    if !has_extension(path, extensions) {
        return Err(input_failure(format!(
            "{} file has unexpected format: {}",
            label,
            path.display()
        )));
    }
    Ok(())
}

/// An SLC scene must be a `.zip` named with `SLC` and must not be a derived
/// OPERA/CSLC product.
fn check_scene_archive(path: &Path) -> Result<(), FailureReason> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if !has_extension(path, &["zip"]) {
        return Err(input_failure(format!("scene is not a zip archive: {}", name)));
    }
    if name.contains("OPERA") || name.contains("CSLC") {
        return Err(input_failure(format!("scene is a derived product, not SLC: {}", name)));
    }
    if !name.contains("SLC") {
        return Err(input_failure(format!("scene name does not identify an SLC: {}", name)));
    }
    match file_status(path) {
        FileStatus::Present(size) if size >= MIN_SCENE_ARCHIVE_BYTES => Ok(()),
        FileStatus::Present(size) => Err(input_failure(format!(
            "scene archive too small ({} bytes): {}",
            size, name
        ))),
        FileStatus::Empty => Err(input_failure(format!("scene archive is empty: {}", name))),
        FileStatus::Missing => Err(input_failure(format!(
            "scene archive missing: {}",
            path.display()
        ))),
    }
}

/// Verifies processing output: completed status, every expected band present
/// and non-empty, and a footprint overlapping the reference.
///
/// `fallback_footprint` is used when processing reports no footprint of its
/// own (normally the source scene's). Returns the validated manifest and
/// footprint.
pub fn validate_outputs(
    output: &ProcessingOutput,
    request: &WorkRequest,
    fallback_footprint: &Footprint,
) -> Result<(BTreeMap<String, PathBuf>, Footprint), FailureReason> {
    if output.status != ProcessingStatus::Completed {
        return Err(FailureReason::new(
            FailureKind::ProcessingError,
            output
                .message
                .clone()
                .unwrap_or_else(|| "processing reported failure".to_string()),
        ));
    }

    let mut manifest = BTreeMap::new();
    for band in request.required_polarization.expected_bands() {
        let Some(path) = output.manifest.get(*band) else {
            return Err(output_failure(format!("band {} missing from manifest", band)));
        };
        match file_status(path) {
            FileStatus::Present(_) => {}
            FileStatus::Empty => {
                return Err(output_failure(format!("band {} is empty: {}", band, path.display())))
            }
            FileStatus::Missing => {
                return Err(output_failure(format!(
                    "band {} file missing: {}",
                    band,
                    path.display()
                )))
            }
        }
        manifest.insert(band.to_string(), path.clone());
    }

    let footprint = output
        .footprint
        .clone()
        .unwrap_or_else(|| fallback_footprint.clone());
    if !overlaps(&footprint, &request.reference_footprint, request.tolerance_degrees) {
        return Err(output_failure(format!(
            "product footprint {} does not overlap reference within {} degrees",
            footprint.to_wkt(),
            request.tolerance_degrees
        )));
    }

    Ok((manifest, footprint))
}

fn has_extension(path: &Path, allowed: &[&str]) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| allowed.contains(&ext.as_str()))
}

fn input_failure(detail: String) -> FailureReason {
    FailureReason::new(FailureKind::AcquisitionError, detail)
}

fn output_failure(detail: String) -> FailureReason {
    FailureReason::new(FailureKind::ValidationError, detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::SourceScene;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    const SCENE: &str = "S1A_IW_SLC__1SDV_20230101T000000_20230101T000030_046000_058000_ABCD.zip";

    fn square(left: f64, bottom: f64) -> Footprint {
        Footprint::from_bounds(left, bottom, left + 1.0, bottom + 1.0).unwrap()
    }

    fn request(polarization: Polarization) -> WorkRequest {
        WorkRequest::builder("chip", square(0.0, 0.0), Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap())
            .required_polarization(polarization)
            .build()
            .unwrap()
    }

    fn write(dir: &Path, name: &str, len: usize) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, vec![7u8; len]).unwrap();
        path
    }

    fn inputs(dir: &Path, scene: &str, scene_len: usize) -> AcquiredInputs {
        AcquiredInputs {
            dem_path: write(dir, "dem.tif", 16),
            orbit_path: write(dir, "S1A_OPER_AUX_POEORB.EOF", 16),
            scene_path: write(dir, scene, scene_len),
            source: SourceScene {
                name: scene.trim_end_matches(".zip").to_string(),
                acquisition_time: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
                footprint: square(0.0, 0.0),
                polarization: Polarization::DualPol,
            },
        }
    }

    #[test]
    fn test_valid_inputs() {
        let dir = TempDir::new().unwrap();
        assert!(validate_inputs(&inputs(dir.path(), SCENE, 2048), Polarization::DualPol).is_ok());
    }

    #[test]
    fn test_small_scene_rejected() {
        let dir = TempDir::new().unwrap();
        let err = validate_inputs(&inputs(dir.path(), SCENE, 100), Polarization::DualPol).unwrap_err();
        assert_eq!(err.kind, FailureKind::AcquisitionError);
        assert!(err.detail.contains("too small"));
    }

    #[test]
    fn test_cslc_product_rejected() {
        let dir = TempDir::new().unwrap();
        let err = validate_inputs(&inputs(dir.path(), "OPERA_L2_CSLC-S1_T001.zip", 4096), Polarization::DualPol)
            .unwrap_err();
        assert!(err.detail.contains("derived product"));
    }

    #[test]
    fn test_wrong_dem_format_rejected() {
        let dir = TempDir::new().unwrap();
        let mut inputs = inputs(dir.path(), SCENE, 2048);
        inputs.dem_path = write(dir.path(), "dem.hgt", 16);
        let err = validate_inputs(&inputs, Polarization::DualPol).unwrap_err();
        assert!(err.detail.contains("DEM"));
    }

    #[test]
    fn test_empty_orbit_rejected() {
        let dir = TempDir::new().unwrap();
        let mut inputs = inputs(dir.path(), SCENE, 2048);
        inputs.orbit_path = write(dir.path(), "empty.EOF", 0);
        let err = validate_inputs(&inputs, Polarization::DualPol).unwrap_err();
        assert!(err.detail.contains("orbit file is empty"));
    }

    #[test]
    fn test_single_pol_scene_cannot_serve_dual_pol() {
        let dir = TempDir::new().unwrap();
        let mut inputs = inputs(dir.path(), SCENE, 2048);
        inputs.source.polarization = Polarization::SinglePol;
        assert!(validate_inputs(&inputs, Polarization::SinglePol).is_ok());
        let err = validate_inputs(&inputs, Polarization::DualPol).unwrap_err();
        assert!(err.detail.contains("dual-pol required"));
    }

    fn output(dir: &Path, bands: &[(&str, usize)]) -> ProcessingOutput {
        let manifest = bands
            .iter()
            .map(|(band, len)| (band.to_string(), write(dir, &format!("rtc_{}.tif", band), *len)))
            .collect();
        ProcessingOutput::completed(manifest)
    }

    #[test]
    fn test_dual_pol_outputs_pass() {
        let dir = TempDir::new().unwrap();
        let out = output(dir.path(), &[("VV", 8), ("VH", 8)]);
        let (manifest, footprint) =
            validate_outputs(&out, &request(Polarization::DualPol), &square(0.5, 0.5)).unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(footprint, square(0.5, 0.5));
    }

    #[test]
    fn test_missing_band_fails() {
        let dir = TempDir::new().unwrap();
        let out = output(dir.path(), &[("VV", 8)]);
        let err = validate_outputs(&out, &request(Polarization::DualPol), &square(0.0, 0.0)).unwrap_err();
        assert_eq!(err.kind, FailureKind::ValidationError);
        assert!(err.detail.contains("VH"));
    }

    #[test]
    fn test_single_pol_only_needs_vv() {
        let dir = TempDir::new().unwrap();
        let out = output(dir.path(), &[("VV", 8)]);
        let (manifest, _) =
            validate_outputs(&out, &request(Polarization::SinglePol), &square(0.0, 0.0)).unwrap();
        assert_eq!(manifest.keys().collect::<Vec<_>>(), vec!["VV"]);
    }

    #[test]
    fn test_empty_band_fails() {
        let dir = TempDir::new().unwrap();
        let out = output(dir.path(), &[("VV", 8), ("VH", 0)]);
        let err = validate_outputs(&out, &request(Polarization::DualPol), &square(0.0, 0.0)).unwrap_err();
        assert!(err.detail.contains("empty"));
    }

    #[test]
    fn test_non_overlapping_footprint_fails() {
        let dir = TempDir::new().unwrap();
        let out = output(dir.path(), &[("VV", 8), ("VH", 8)]);
        let err = validate_outputs(&out, &request(Polarization::DualPol), &square(40.0, 40.0)).unwrap_err();
        assert!(err.detail.contains("does not overlap"));
    }

    #[test]
    fn test_reported_failure_is_processing_error() {
        let out = ProcessingOutput {
            status: ProcessingStatus::Failed,
            message: Some("gpu lost".into()),
            manifest: BTreeMap::new(),
            footprint: None,
        };
        let err = validate_outputs(&out, &request(Polarization::DualPol), &square(0.0, 0.0)).unwrap_err();
        assert_eq!(err.kind, FailureKind::ProcessingError);
        assert_eq!(err.detail, "gpu lost");
    }
}
