//! Footprint type definitions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Valid latitude range
pub const MIN_LAT: f64 = -90.0;
pub const MAX_LAT: f64 = 90.0;

/// Valid longitude range
pub const MIN_LON: f64 = -180.0;
pub const MAX_LON: f64 = 180.0;

/// Minimum number of distinct vertices in a footprint.
pub const MIN_VERTICES: usize = 3;

/// Geometric comparisons below this magnitude are treated as zero.
pub(crate) const EPSILON: f64 = 1e-12;

/// A geographic position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LonLat {
    pub lon: f64,
    pub lat: f64,
}

impl LonLat {
    #[inline]
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }
}

/// Axis-aligned bounds of a footprint.
///
/// For footprints crossing the antimeridian, `right` may exceed 180 because
/// bounds are computed on unwrapped longitudes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
    pub top: f64,
}

/// A validated simple polygon describing ground coverage.
///
/// Vertices are stored open (the closing vertex is implied). The ring is
/// guaranteed to have at least three distinct vertices, finite in-range
/// coordinates, non-zero area and no self-intersections once longitudes are
/// unwrapped across the antimeridian.
///
/// Serialized as an array of `[lon, lat]` pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<[f64; 2]>", into = "Vec<[f64; 2]>")]
pub struct Footprint {
    vertices: Vec<LonLat>,
}

impl Footprint {
    /// Validates and builds a footprint from an ordered ring of vertices.
    ///
    /// A repeated closing vertex is accepted and dropped.
    pub fn new(vertices: Vec<LonLat>) -> Result<Self, GeoError> {
        let mut vertices = vertices;
        if vertices.len() > 1 && vertices.first() == vertices.last() {
            vertices.pop();
        }

        if vertices.len() < MIN_VERTICES {
            return Err(GeoError::TooFewVertices(vertices.len()));
        }

        for v in &vertices {
            if !v.lon.is_finite() || !v.lat.is_finite() {
                return Err(GeoError::NonFinite);
            }
            if !(MIN_LAT..=MAX_LAT).contains(&v.lat) {
                return Err(GeoError::InvalidLatitude(v.lat));
            }
            if !(MIN_LON..=MAX_LON).contains(&v.lon) {
                return Err(GeoError::InvalidLongitude(v.lon));
            }
        }

        let footprint = Self { vertices };
        let ring = footprint.unwrapped();

        for i in 0..ring.len() {
            let next = (i + 1) % ring.len();
            if (ring[i].0 - ring[next].0).abs() < EPSILON
                && (ring[i].1 - ring[next].1).abs() < EPSILON
            {
                return Err(GeoError::DuplicateVertex(next));
            }
        }

        if super::signed_area(&ring).abs() < EPSILON {
            return Err(GeoError::ZeroArea);
        }

        if super::is_self_intersecting(&ring) {
            return Err(GeoError::SelfIntersecting);
        }

        Ok(footprint)
    }

    /// Builds a rectangular footprint from bounds
    /// (left, bottom, right, top).
    pub fn from_bounds(left: f64, bottom: f64, right: f64, top: f64) -> Result<Self, GeoError> {
        Self::new(vec![
            LonLat::new(left, bottom),
            LonLat::new(right, bottom),
            LonLat::new(right, top),
            LonLat::new(left, top),
        ])
    }

    /// Returns the open vertex ring.
    pub fn vertices(&self) -> &[LonLat] {
        &self.vertices
    }

    /// Returns `(lon, lat)` pairs with longitudes unwrapped so that no two
    /// consecutive vertices are more than 180 degrees apart.
    pub fn unwrapped(&self) -> Vec<(f64, f64)> {
        let mut ring = Vec::with_capacity(self.vertices.len());
        let mut prev_lon: Option<f64> = None;
        for v in &self.vertices {
            let lon = match prev_lon {
                None => v.lon,
                Some(prev) => {
                    let mut lon = v.lon;
                    while lon - prev > 180.0 {
                        lon -= 360.0;
                    }
                    while prev - lon > 180.0 {
                        lon += 360.0;
                    }
                    lon
                }
            };
            prev_lon = Some(lon);
            ring.push((lon, v.lat));
        }
        ring
    }

    /// Returns the bounds of the unwrapped ring.
    pub fn bounds(&self) -> Bounds {
        let ring = self.unwrapped();
        let mut bounds = Bounds {
            left: f64::INFINITY,
            bottom: f64::INFINITY,
            right: f64::NEG_INFINITY,
            top: f64::NEG_INFINITY,
        };
        for (lon, lat) in ring {
            bounds.left = bounds.left.min(lon);
            bounds.right = bounds.right.max(lon);
            bounds.bottom = bounds.bottom.min(lat);
            bounds.top = bounds.top.max(lat);
        }
        bounds
    }

    /// Well-known text representation, closed ring.
    pub fn to_wkt(&self) -> String {
        let mut coords: Vec<String> = self
            .vertices
            .iter()
            .map(|v| format!("{} {}", v.lon, v.lat))
            .collect();
        if let Some(first) = coords.first().cloned() {
            coords.push(first);
        }
        format!("POLYGON(({}))", coords.join(", "))
    }
}

impl TryFrom<Vec<[f64; 2]>> for Footprint {
    type Error = GeoError;

    fn try_from(pairs: Vec<[f64; 2]>) -> Result<Self, Self::Error> {
        Self::new(pairs.into_iter().map(|[lon, lat]| LonLat::new(lon, lat)).collect())
    }
}

impl From<Footprint> for Vec<[f64; 2]> {
    fn from(footprint: Footprint) -> Self {
        footprint
            .vertices
            .into_iter()
            .map(|v| [v.lon, v.lat])
            .collect()
    }
}

/// Footprint validation errors
#[derive(Debug, Clone, PartialEq)]
pub enum GeoError {
    /// Fewer than three distinct vertices
    TooFewVertices(usize),
    /// A coordinate is NaN or infinite
    NonFinite,
    /// Latitude outside -90..=90
    InvalidLatitude(f64),
    /// Longitude outside -180..=180
    InvalidLongitude(f64),
    /// Vertex at this index repeats its predecessor
    DuplicateVertex(usize),
    /// All vertices are collinear
    ZeroArea,
    /// Two non-adjacent edges cross
    SelfIntersecting,
}

impl fmt::Display for GeoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeoError::TooFewVertices(n) => write!(
                f,
                "Footprint has {} distinct vertices (need at least {})",
                n, MIN_VERTICES
            ),
            GeoError::NonFinite => write!(f, "Footprint contains a non-finite coordinate"),
            GeoError::InvalidLatitude(lat) => write!(
                f,
                "Invalid latitude: {} (must be between {} and {})",
                lat, MIN_LAT, MAX_LAT
            ),
            GeoError::InvalidLongitude(lon) => write!(
                f,
                "Invalid longitude: {} (must be between {} and {})",
                lon, MIN_LON, MAX_LON
            ),
            GeoError::DuplicateVertex(i) => {
                write!(f, "Footprint vertex {} repeats the previous vertex", i)
            }
            GeoError::ZeroArea => write!(f, "Footprint has zero area"),
            GeoError::SelfIntersecting => write!(f, "Footprint ring is self-intersecting"),
        }
    }
}

impl std::error::Error for GeoError {}
