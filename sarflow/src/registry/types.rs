//! Registry data model.

use crate::fsutil;
use crate::geo::Footprint;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Document format version written by this crate.
pub const REGISTRY_VERSION: u32 = 1;

/// Unique identifier for a registered scene.
///
/// Derived from the source scene name, polarization code and the processing
/// date, e.g. `S1A_IW_SLC__1SDV_20230206T032451_SDV_20240101`.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SceneId(String);

impl SceneId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Builds the identifier for a scene processed on `processed_on`.
    pub fn derive(source_scene: &str, polarization: Polarization, processed_on: NaiveDate) -> Self {
        Self(format!(
            "{}_{}_{}",
            source_scene,
            polarization.code(),
            processed_on.format("%Y%m%d")
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SceneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SceneId({})", self.0)
    }
}

impl fmt::Display for SceneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SceneId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Polarization mode of a SAR acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Polarization {
    #[serde(rename = "single-pol")]
    SinglePol,
    #[serde(rename = "dual-pol")]
    DualPol,
}

impl Polarization {
    /// True if a product with this polarization can serve a request that
    /// requires `required`. Dual-pol satisfies both.
    pub fn satisfies(&self, required: Polarization) -> bool {
        match (self, required) {
            (Self::DualPol, _) => true,
            (Self::SinglePol, Self::SinglePol) => true,
            (Self::SinglePol, Self::DualPol) => false,
        }
    }

    /// Short code used in scene identifiers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SinglePol => "SSV",
            Self::DualPol => "SDV",
        }
    }

    /// Bands a processed product of this polarization must contain.
    pub fn expected_bands(&self) -> &'static [&'static str] {
        match self {
            Self::SinglePol => &["VV"],
            Self::DualPol => &["VV", "VH"],
        }
    }

    /// Detects polarization from a Sentinel-1 product name
    /// (`_1SDV_`/`_1SDH_` dual, `_1SSV_`/`_1SSH_` single).
    pub fn from_scene_name(name: &str) -> Option<Self> {
        if name.contains("_1SDV_") || name.contains("_1SDH_") {
            Some(Self::DualPol)
        } else if name.contains("_1SSV_") || name.contains("_1SSH_") {
            Some(Self::SinglePol)
        } else {
            None
        }
    }
}

impl fmt::Display for Polarization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SinglePol => write!(f, "single-pol"),
            Self::DualPol => write!(f, "dual-pol"),
        }
    }
}

impl FromStr for Polarization {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "single-pol" | "single" | "ssv" => Ok(Self::SinglePol),
            "dual-pol" | "dual" | "sdv" => Ok(Self::DualPol),
            other => Err(format!("unknown polarization '{}'", other)),
        }
    }
}

/// Pre/post event classification of a request or a produced scene.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPhase {
    PreEvent,
    PostEvent,
    #[default]
    Unknown,
}

impl EventPhase {
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Strict phase compatibility: an unknown side accepts anything.
    pub fn compatible_with(&self, other: EventPhase) -> bool {
        !self.is_known() || !other.is_known() || *self == other
    }
}

impl fmt::Display for EventPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreEvent => write!(f, "pre_event"),
            Self::PostEvent => write!(f, "post_event"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Outcome recorded for a scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SceneStatus {
    Processed,
    Failed,
    Skipped,
}

/// One durable catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneRecord {
    pub scene_id: SceneId,
    /// Name of the source acquisition the product was derived from
    pub source_scene: String,
    pub footprint: Footprint,
    pub acquisition_time: DateTime<Utc>,
    pub polarization: Polarization,
    #[serde(default)]
    pub phase: EventPhase,
    /// Band name ("VV", "VH") to durable output path
    pub output_paths: BTreeMap<String, PathBuf>,
    pub status: SceneStatus,
    /// Reference images this scene has been used for
    #[serde(default)]
    pub references: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SceneRecord {
    pub fn is_processed(&self) -> bool {
        self.status == SceneStatus::Processed
    }

    /// True when outputs are listed and every one exists with content.
    ///
    /// Reads file metadata for every output.
    pub fn outputs_present(&self) -> bool {
        !self.output_paths.is_empty()
            && self
                .output_paths
                .values()
                .all(|path| fsutil::file_status(path).is_usable())
    }

    /// Records that `reference` was served by this scene. Returns false if
    /// it was already listed.
    pub fn add_reference(&mut self, reference: &str, now: DateTime<Utc>) -> bool {
        if self.references.iter().any(|r| r == reference) {
            return false;
        }
        self.references.push(reference.to_string());
        self.updated_at = now;
        true
    }
}

/// The full catalog as persisted on disk.
///
/// `generation` increases by one on every successful commit and is the
/// optimistic concurrency token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    pub version: u32,
    pub generation: u64,
    scenes: Vec<SceneRecord>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            version: REGISTRY_VERSION,
            generation: 0,
            scenes: Vec::new(),
        }
    }

    pub(crate) fn from_scenes(generation: u64, scenes: Vec<SceneRecord>) -> Self {
        let mut registry = Self {
            version: REGISTRY_VERSION,
            generation,
            scenes: Vec::new(),
        };
        for scene in scenes {
            registry.upsert(scene);
        }
        registry
    }

    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }

    pub fn scenes(&self) -> &[SceneRecord] {
        &self.scenes
    }

    pub fn get(&self, scene_id: &SceneId) -> Option<&SceneRecord> {
        self.scenes.iter().find(|s| &s.scene_id == scene_id)
    }

    pub fn get_mut(&mut self, scene_id: &SceneId) -> Option<&mut SceneRecord> {
        self.scenes.iter_mut().find(|s| &s.scene_id == scene_id)
    }

    pub fn contains(&self, scene_id: &SceneId) -> bool {
        self.get(scene_id).is_some()
    }

    /// Inserts or replaces a record, keeping `scene_id` unique and the
    /// scenes ordered by creation time. Returns the replaced record.
    pub fn upsert(&mut self, record: SceneRecord) -> Option<SceneRecord> {
        let previous = self
            .scenes
            .iter()
            .position(|s| s.scene_id == record.scene_id)
            .map(|idx| self.scenes.remove(idx));
        let idx = self.scenes.partition_point(|s| {
            (s.created_at, &s.scene_id) <= (record.created_at, &record.scene_id)
        });
        self.scenes.insert(idx, record);
        previous
    }

    /// Iterates over records with `status = processed`.
    pub fn processed(&self) -> impl Iterator<Item = &SceneRecord> {
        self.scenes.iter().filter(|s| s.is_processed())
    }

    /// First duplicated scene id, if any.
    pub(crate) fn find_duplicate(&self) -> Option<&SceneId> {
        let mut seen = std::collections::HashSet::new();
        self.scenes
            .iter()
            .map(|s| &s.scene_id)
            .find(|id| !seen.insert(*id))
    }
}

/// A consistency problem found by validation. Reported, never repaired.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryIssue {
    /// A registered output file does not exist.
    MissingOutput {
        scene_id: SceneId,
        band: String,
        path: PathBuf,
    },
    /// A registered output file exists but is empty.
    EmptyOutput {
        scene_id: SceneId,
        band: String,
        path: PathBuf,
    },
    /// A processed record lists no outputs at all.
    NoOutputs { scene_id: SceneId },
    /// A result directory on disk is not in the registry.
    Unregistered { scene_id: SceneId, sidecar: PathBuf },
    /// A sidecar on disk could not be parsed.
    UnreadableSidecar { sidecar: PathBuf, reason: String },
    /// A staged commit was never published or cleaned up.
    AbandonedStage { path: PathBuf },
}

impl fmt::Display for RegistryIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingOutput {
                scene_id,
                band,
                path,
            } => write!(
                f,
                "{}: {} output missing at {}",
                scene_id,
                band,
                path.display()
            ),
            Self::EmptyOutput {
                scene_id,
                band,
                path,
            } => write!(f, "{}: {} output is empty at {}", scene_id, band, path.display()),
            Self::NoOutputs { scene_id } => write!(f, "{}: no outputs recorded", scene_id),
            Self::Unregistered { scene_id, sidecar } => write!(
                f,
                "{}: found on disk but not registered ({})",
                scene_id,
                sidecar.display()
            ),
            Self::UnreadableSidecar { sidecar, reason } => {
                write!(f, "unreadable sidecar {}: {}", sidecar.display(), reason)
            }
            Self::AbandonedStage { path } => write!(
                f,
                "abandoned staged commit {} (removed by rebuild)",
                path.display()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: &str, created_secs: i64) -> SceneRecord {
        let t = Utc.timestamp_opt(created_secs, 0).unwrap();
        SceneRecord {
            scene_id: SceneId::new(id),
            source_scene: id.to_string(),
            footprint: Footprint::from_bounds(0.0, 0.0, 1.0, 1.0).unwrap(),
            acquisition_time: t,
            polarization: Polarization::DualPol,
            phase: EventPhase::Unknown,
            output_paths: BTreeMap::new(),
            status: SceneStatus::Processed,
            references: Vec::new(),
            created_at: t,
            updated_at: t,
        }
    }

    #[test]
    fn test_scene_id_derivation() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let id = SceneId::derive(
            "S1A_IW_SLC__1SDV_20230206T032451",
            Polarization::DualPol,
            date,
        );
        assert_eq!(id.as_str(), "S1A_IW_SLC__1SDV_20230206T032451_SDV_20240102");
    }

    #[test]
    fn test_polarization_satisfies() {
        assert!(Polarization::DualPol.satisfies(Polarization::SinglePol));
        assert!(Polarization::DualPol.satisfies(Polarization::DualPol));
        assert!(Polarization::SinglePol.satisfies(Polarization::SinglePol));
        assert!(!Polarization::SinglePol.satisfies(Polarization::DualPol));
    }

    #[test]
    fn test_polarization_from_scene_name() {
        assert_eq!(
            Polarization::from_scene_name("S1A_IW_SLC__1SDV_20230206T032451_X"),
            Some(Polarization::DualPol)
        );
        assert_eq!(
            Polarization::from_scene_name("S1B_IW_SLC__1SSV_20210101T000000_X"),
            Some(Polarization::SinglePol)
        );
        assert_eq!(Polarization::from_scene_name("unrelated.zip"), None);
    }

    #[test]
    fn test_polarization_parse() {
        assert_eq!("dual-pol".parse::<Polarization>(), Ok(Polarization::DualPol));
        assert_eq!("Single".parse::<Polarization>(), Ok(Polarization::SinglePol));
        assert!("quad".parse::<Polarization>().is_err());
    }

    #[test]
    fn test_phase_compatibility() {
        assert!(EventPhase::PreEvent.compatible_with(EventPhase::PreEvent));
        assert!(!EventPhase::PreEvent.compatible_with(EventPhase::PostEvent));
        assert!(EventPhase::Unknown.compatible_with(EventPhase::PostEvent));
        assert!(EventPhase::PostEvent.compatible_with(EventPhase::Unknown));
    }

    #[test]
    fn test_upsert_keeps_ids_unique_and_ordered() {
        let mut registry = Registry::new();
        assert!(registry.upsert(record("b", 20)).is_none());
        assert!(registry.upsert(record("a", 10)).is_none());
        let replaced = registry.upsert(record("b", 30));
        assert!(replaced.is_some());

        let ids: Vec<_> = registry.scenes().iter().map(|s| s.scene_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(registry.find_duplicate().is_none());
    }

    #[test]
    fn test_add_reference_is_idempotent() {
        let mut rec = record("a", 10);
        let now = Utc.timestamp_opt(100, 0).unwrap();
        assert!(rec.add_reference("chip_1", now));
        assert!(!rec.add_reference("chip_1", now));
        assert_eq!(rec.references, vec!["chip_1".to_string()]);
        assert_eq!(rec.updated_at, now);
    }

    #[test]
    fn test_record_serde_uses_wire_names() {
        let rec = record("a", 10);
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["polarization"], "dual-pol");
        assert_eq!(json["status"], "processed");
        assert_eq!(json["phase"], "unknown");
    }
}
