//! Overlap resolver: decides whether a request can reuse a registered scene.
//!
//! A record is a candidate when it is processed, its footprint overlaps the
//! request footprint within tolerance, its acquisition time is inside the
//! request window, its polarization satisfies the requirement, and (when the
//! request phase is known) its phase does not contradict it. The candidate
//! returned depends on the [`ReusePolicy`].
//!
//! Resolution never mutates the registry.

use crate::geo;
use crate::pipeline::WorkRequest;
use crate::registry::{Registry, SceneRecord};
use chrono::TimeDelta;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Ranking used when several registered scenes match a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReusePolicy {
    /// Smallest `|acquisition_time - reference_time|`; ties go to the most
    /// recently created record.
    #[default]
    ClosestAcquisition,
    /// Most recently created record; ties go to the closest acquisition.
    LatestRegistration,
}

impl fmt::Display for ReusePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClosestAcquisition => write!(f, "closest"),
            Self::LatestRegistration => write!(f, "latest"),
        }
    }
}

impl FromStr for ReusePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "closest" => Ok(Self::ClosestAcquisition),
            "latest" => Ok(Self::LatestRegistration),
            other => Err(format!("unknown reuse policy '{}'", other)),
        }
    }
}

/// Pure reuse decision over a registry snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverlapResolver {
    policy: ReusePolicy,
}

impl OverlapResolver {
    pub fn new(policy: ReusePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ReusePolicy {
        self.policy
    }

    /// Returns true if `record` could serve `request`.
    pub fn matches(&self, record: &SceneRecord, request: &WorkRequest) -> bool {
        record.is_processed()
            && record.polarization.satisfies(request.required_polarization)
            && request.phase.compatible_with(record.phase)
            && geo::temporal_match(
                record.acquisition_time,
                request.reference_time,
                request.search_window_days,
            )
            && geo::overlaps(
                &record.footprint,
                &request.reference_footprint,
                request.tolerance_degrees,
            )
    }

    /// Picks the best reusable record for `request`, if any.
    pub fn resolve<'a>(&self, registry: &'a Registry, request: &WorkRequest) -> Option<&'a SceneRecord> {
        self.resolve_where(registry, request, |_| true)
    }

    /// Like [`resolve`](Self::resolve), but only among matching records
    /// that `usable` accepts. `usable` is not called for records that do
    /// not match.
    pub fn resolve_where<'a, P>(
        &self,
        registry: &'a Registry,
        request: &WorkRequest,
        mut usable: P,
    ) -> Option<&'a SceneRecord>
    where
        P: FnMut(&SceneRecord) -> bool,
    {
        registry
            .processed()
            .filter(|record| self.matches(record, request) && usable(record))
            .min_by(|a, b| self.rank(a, b, request))
    }

    /// `Less` means `a` is preferred.
    fn rank(&self, a: &SceneRecord, b: &SceneRecord, request: &WorkRequest) -> Ordering {
        let by_distance = distance(a, request).cmp(&distance(b, request));
        // Newer records sort first.
        let by_recency = b.created_at.cmp(&a.created_at);
        let by_id = a.scene_id.cmp(&b.scene_id);

        let ranked = match self.policy {
            ReusePolicy::ClosestAcquisition => by_distance.then(by_recency),
            ReusePolicy::LatestRegistration => by_recency.then(by_distance),
        };
        ranked.then(by_id)
    }
}

fn distance(record: &SceneRecord, request: &WorkRequest) -> TimeDelta {
    (record.acquisition_time - request.reference_time).abs()
}
