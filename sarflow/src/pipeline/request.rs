//! Work requests and their classification.
//!
//! A [`WorkRequest`] is one reference image to be served: where it is, when
//! it was captured, and what the matching SAR product must look like. Its
//! event phase is decided once, here, and carried as a tagged value.

use crate::geo::{Footprint, GeoError, LonLat};
use crate::registry::{EventPhase, Polarization};
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

/// Default half-width of the acceptable acquisition window.
pub const DEFAULT_SEARCH_WINDOW_DAYS: i64 = 30;

/// Default overlap tolerance.
pub const DEFAULT_TOLERANCE_DEGREES: f64 = 0.01;

/// Default polarization requirement.
pub const DEFAULT_POLARIZATION: Polarization = Polarization::DualPol;

/// Invalid request errors.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Request name must not be empty")]
    EmptyName,

    #[error("Search window must be >= 0 days, got {0}")]
    NegativeWindow(i64),

    #[error("Tolerance must be a finite non-negative number of degrees, got {0}")]
    InvalidTolerance(f64),

    #[error("Invalid reference footprint: {0}")]
    Footprint(#[from] GeoError),

    #[error("No reference time given for '{0}' and none found in its name")]
    MissingReferenceTime(String),

    #[error("Failed to parse request on line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

/// One unit of requested work.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkRequest {
    /// Reference image name, used in logs and recorded on reused scenes
    pub name: String,
    pub reference_footprint: Footprint,
    pub reference_time: DateTime<Utc>,
    pub required_polarization: Polarization,
    pub search_window_days: i64,
    pub tolerance_degrees: f64,
    pub phase: EventPhase,
}

impl WorkRequest {
    pub fn builder(
        name: impl Into<String>,
        reference_footprint: Footprint,
        reference_time: DateTime<Utc>,
    ) -> WorkRequestBuilder {
        WorkRequestBuilder {
            name: name.into(),
            reference_footprint,
            reference_time,
            required_polarization: DEFAULT_POLARIZATION,
            search_window_days: DEFAULT_SEARCH_WINDOW_DAYS,
            tolerance_degrees: DEFAULT_TOLERANCE_DEGREES,
            phase: None,
            source_path: None,
        }
    }
}

/// Builder for [`WorkRequest`]; validation happens in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct WorkRequestBuilder {
    name: String,
    reference_footprint: Footprint,
    reference_time: DateTime<Utc>,
    required_polarization: Polarization,
    search_window_days: i64,
    tolerance_degrees: f64,
    phase: Option<EventPhase>,
    source_path: Option<PathBuf>,
}

impl WorkRequestBuilder {
    pub fn required_polarization(mut self, polarization: Polarization) -> Self {
        self.required_polarization = polarization;
        self
    }

    pub fn search_window_days(mut self, days: i64) -> Self {
        self.search_window_days = days;
        self
    }

    pub fn tolerance_degrees(mut self, degrees: f64) -> Self {
        self.tolerance_degrees = degrees;
        self
    }

    /// Overrides phase classification.
    pub fn phase(mut self, phase: EventPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Path of the reference image; its parent directory takes part in
    /// phase classification.
    pub fn source_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<WorkRequest, RequestError> {
        if self.name.trim().is_empty() {
            return Err(RequestError::EmptyName);
        }
        if self.search_window_days < 0 {
            return Err(RequestError::NegativeWindow(self.search_window_days));
        }
        if !self.tolerance_degrees.is_finite() || self.tolerance_degrees < 0.0 {
            return Err(RequestError::InvalidTolerance(self.tolerance_degrees));
        }

        let phase = self
            .phase
            .unwrap_or_else(|| classify_phase(&self.name, self.source_path.as_deref()));

        Ok(WorkRequest {
            name: self.name,
            reference_footprint: self.reference_footprint,
            reference_time: self.reference_time,
            required_polarization: self.required_polarization,
            search_window_days: self.search_window_days,
            tolerance_degrees: self.tolerance_degrees,
            phase,
        })
    }
}

/// Classifies a reference image by name, then by its parent directory.
///
/// `pre_disaster`/`pre_event` and `post_disaster`/`post_event` in the name
/// win; otherwise a parent directory containing `pre` or `post` decides.
pub fn classify_phase(name: &str, source_path: Option<&Path>) -> EventPhase {
    let lower = name.to_lowercase();
    if lower.contains("pre_disaster") || lower.contains("pre_event") {
        return EventPhase::PreEvent;
    }
    if lower.contains("post_disaster") || lower.contains("post_event") {
        return EventPhase::PostEvent;
    }

    let parent = source_path
        .and_then(Path::parent)
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().to_lowercase());
    match parent {
        Some(dir) if dir.contains("pre") => EventPhase::PreEvent,
        Some(dir) if dir.contains("post") => EventPhase::PostEvent,
        _ => EventPhase::Unknown,
    }
}

/// Extracts a `YYYYMMDDTHHMMSS` timestamp embedded in a product name.
pub fn timestamp_from_name(name: &str) -> Option<DateTime<Utc>> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"\d{8}T\d{6}").ok())
        .as_ref()?;
    let found = pattern.find(name)?;
    NaiveDateTime::parse_from_str(found.as_str(), "%Y%m%dT%H%M%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Serialized form of a request, one JSON object per line in a requests
/// file. Unset fields fall back to [`RequestDefaults`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSpec {
    pub name: String,
    /// Ring of `[lon, lat]` pairs; alternative to `bounds`
    #[serde(default)]
    pub footprint: Option<Footprint>,
    /// `[left, bottom, right, top]`
    #[serde(default)]
    pub bounds: Option<[f64; 4]>,
    #[serde(default)]
    pub reference_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub polarization: Option<Polarization>,
    #[serde(default)]
    pub search_window_days: Option<i64>,
    #[serde(default)]
    pub tolerance_degrees: Option<f64>,
    #[serde(default)]
    pub phase: Option<EventPhase>,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Values applied to request fields left unset.
#[derive(Debug, Clone)]
pub struct RequestDefaults {
    pub polarization: Polarization,
    pub search_window_days: i64,
    pub tolerance_degrees: f64,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            polarization: DEFAULT_POLARIZATION,
            search_window_days: DEFAULT_SEARCH_WINDOW_DAYS,
            tolerance_degrees: DEFAULT_TOLERANCE_DEGREES,
        }
    }
}

impl RequestSpec {
    pub fn into_request(self, defaults: &RequestDefaults) -> Result<WorkRequest, RequestError> {
        let footprint = match (self.footprint, self.bounds) {
            (Some(footprint), _) => footprint,
            (None, Some([left, bottom, right, top])) => {
                Footprint::from_bounds(left, bottom, right, top)?
            }
            (None, None) => {
                return Err(RequestError::Footprint(GeoError::TooFewVertices(0)));
            }
        };

        let reference_time = self
            .reference_time
            .or_else(|| timestamp_from_name(&self.name))
            .ok_or_else(|| RequestError::MissingReferenceTime(self.name.clone()))?;

        let mut builder = WorkRequest::builder(self.name, footprint, reference_time)
            .required_polarization(self.polarization.unwrap_or(defaults.polarization))
            .search_window_days(self.search_window_days.unwrap_or(defaults.search_window_days))
            .tolerance_degrees(self.tolerance_degrees.unwrap_or(defaults.tolerance_degrees));
        if let Some(phase) = self.phase {
            builder = builder.phase(phase);
        }
        if let Some(path) = self.path {
            builder = builder.source_path(path);
        }
        builder.build()
    }
}

/// Parses a JSON-lines requests document. Blank lines and lines starting
/// with `#` are ignored.
pub fn parse_requests(text: &str, defaults: &RequestDefaults) -> Result<Vec<WorkRequest>, RequestError> {
    let mut requests = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let spec: RequestSpec = serde_json::from_str(line).map_err(|e| RequestError::Parse {
            line: idx + 1,
            reason: e.to_string(),
        })?;
        requests.push(spec.into_request(defaults)?);
    }
    Ok(requests)
}

/// Convenience for tests and callers holding plain coordinates.
pub fn footprint_from_pairs(pairs: &[(f64, f64)]) -> Result<Footprint, GeoError> {
    Footprint::new(pairs.iter().map(|(lon, lat)| LonLat::new(*lon, *lat)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fp() -> Footprint {
        Footprint::from_bounds(36.0, 36.0, 36.5, 36.5).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 2, 7, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let req = WorkRequest::builder("chip", fp(), t0()).build().unwrap();
        assert_eq!(req.required_polarization, Polarization::DualPol);
        assert_eq!(req.search_window_days, DEFAULT_SEARCH_WINDOW_DAYS);
        assert_eq!(req.tolerance_degrees, DEFAULT_TOLERANCE_DEGREES);
        assert_eq!(req.phase, EventPhase::Unknown);
    }

    #[test]
    fn test_negative_window_rejected() {
        let err = WorkRequest::builder("chip", fp(), t0())
            .search_window_days(-1)
            .build()
            .unwrap_err();
        assert!(matches!(err, RequestError::NegativeWindow(-1)));
    }

    #[test]
    fn test_bad_tolerance_rejected() {
        let err = WorkRequest::builder("chip", fp(), t0())
            .tolerance_degrees(f64::NAN)
            .build()
            .unwrap_err();
        assert!(matches!(err, RequestError::InvalidTolerance(_)));
    }

    #[test]
    fn test_phase_from_name() {
        assert_eq!(classify_phase("turkey_00001_pre_disaster", None), EventPhase::PreEvent);
        assert_eq!(classify_phase("turkey_00001_post_disaster", None), EventPhase::PostEvent);
        assert_eq!(classify_phase("chip_post_event", None), EventPhase::PostEvent);
    }

    #[test]
    fn test_phase_from_parent_directory() {
        let path = Path::new("/data/post_images/turkey_00001.tif");
        assert_eq!(classify_phase("turkey_00001", Some(path)), EventPhase::PostEvent);
        let path = Path::new("/data/PRE/turkey_00001.tif");
        assert_eq!(classify_phase("turkey_00001", Some(path)), EventPhase::PreEvent);
        let path = Path::new("/data/images/turkey_00001.tif");
        assert_eq!(classify_phase("turkey_00001", Some(path)), EventPhase::Unknown);
    }

    #[test]
    fn test_name_beats_directory() {
        let path = Path::new("/data/post/turkey_pre_disaster.tif");
        assert_eq!(classify_phase("turkey_pre_disaster", Some(path)), EventPhase::PreEvent);
    }

    #[test]
    fn test_explicit_phase_overrides_classification() {
        let req = WorkRequest::builder("x_pre_disaster", fp(), t0())
            .phase(EventPhase::PostEvent)
            .build()
            .unwrap();
        assert_eq!(req.phase, EventPhase::PostEvent);
    }

    #[test]
    fn test_timestamp_from_name() {
        let t = timestamp_from_name("S1A_IW_SLC__1SDV_20230206T032451_20230206T032518_047093").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2023, 2, 6, 3, 24, 51).unwrap());
        assert!(timestamp_from_name("no_time_here").is_none());
    }

    #[test]
    fn test_parse_requests_jsonl() {
        let text = r#"
# reference chips
{"name": "a_pre_disaster", "bounds": [36.0, 36.0, 36.5, 36.5], "reference_time": "2023-01-20T08:00:00Z"}

{"name": "b_20230210T080000", "footprint": [[36,36],[37,36],[37,37]], "polarization": "single-pol", "search_window_days": 7}
"#;
        let requests = parse_requests(text, &RequestDefaults::default()).unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].phase, EventPhase::PreEvent);
        assert_eq!(requests[0].search_window_days, DEFAULT_SEARCH_WINDOW_DAYS);
        assert_eq!(requests[1].required_polarization, Polarization::SinglePol);
        assert_eq!(requests[1].search_window_days, 7);
        assert_eq!(
            requests[1].reference_time,
            Utc.with_ymd_and_hms(2023, 2, 10, 8, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_requests_reports_line() {
        let text = "{\"name\": \"ok\", \"bounds\": [0,0,1,1], \"reference_time\": \"2023-01-01T00:00:00Z\"}\nnot json\n";
        let err = parse_requests(text, &RequestDefaults::default()).unwrap_err();
        assert!(matches!(err, RequestError::Parse { line: 2, .. }));
    }

    #[test]
    fn test_missing_reference_time() {
        let text = r#"{"name": "undated", "bounds": [0,0,1,1]}"#;
        let err = parse_requests(text, &RequestDefaults::default()).unwrap_err();
        assert!(matches!(err, RequestError::MissingReferenceTime(_)));
    }
}
