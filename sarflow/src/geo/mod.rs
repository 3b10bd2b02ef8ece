//! Geometry utilities for scene footprints.
//!
//! Planar predicates over lon/lat polygons: buffered overlap, containment
//! and temporal matching. Antimeridian-crossing footprints are handled by
//! unwrapping longitudes and comparing against copies shifted by ±360°.
//!
//! All functions here are pure and deterministic.

mod types;

pub use types::{Bounds, Footprint, GeoError, LonLat, MAX_LAT, MAX_LON, MIN_LAT, MIN_LON};

use chrono::{DateTime, TimeDelta, Utc};
use types::EPSILON;

type Point = (f64, f64);

/// Longitude offsets tried when comparing two footprints.
const WRAP_SHIFTS: [f64; 3] = [0.0, 360.0, -360.0];

/// Returns true if `a` and `b` intersect once `b` is buffered outward by
/// `tolerance_degrees`.
///
/// Equivalent to: the planar distance between the two polygons is at most
/// the tolerance. Containment of either polygon in the other counts as
/// intersection.
pub fn overlaps(a: &Footprint, b: &Footprint, tolerance_degrees: f64) -> bool {
    let tolerance = tolerance_degrees.max(0.0);
    let ring_a = a.unwrapped();
    let ring_b = b.unwrapped();

    WRAP_SHIFTS.iter().any(|shift| {
        let shifted = shift_ring(&ring_b, *shift);
        polygon_distance(&ring_a, &shifted) <= tolerance + EPSILON
    })
}

/// Returns true if every vertex of `inner` lies within `outer` buffered by
/// `tolerance_degrees`.
pub fn contains(outer: &Footprint, inner: &Footprint, tolerance_degrees: f64) -> bool {
    let tolerance = tolerance_degrees.max(0.0);
    let ring_outer = outer.unwrapped();
    let ring_inner = inner.unwrapped();

    WRAP_SHIFTS.iter().any(|shift| {
        shift_ring(&ring_inner, *shift).iter().all(|p| {
            point_in_polygon(*p, &ring_outer)
                || point_ring_distance(*p, &ring_outer) <= tolerance + EPSILON
        })
    })
}

/// Returns true if `|t1 - t2| <= window_days`.
///
/// A negative window never matches.
pub fn temporal_match(t1: DateTime<Utc>, t2: DateTime<Utc>, window_days: i64) -> bool {
    if window_days < 0 {
        return false;
    }
    let Some(window) = TimeDelta::try_days(window_days) else {
        return true;
    };
    (t1 - t2).abs() <= window
}

// =============================================================================
// Planar primitives
// =============================================================================

fn shift_ring(ring: &[Point], shift: f64) -> Vec<Point> {
    ring.iter().map(|(lon, lat)| (lon + shift, *lat)).collect()
}

fn edges(ring: &[Point]) -> impl Iterator<Item = (Point, Point)> + '_ {
    (0..ring.len()).map(move |i| (ring[i], ring[(i + 1) % ring.len()]))
}

/// Shoelace area; sign depends on winding.
pub(crate) fn signed_area(ring: &[Point]) -> f64 {
    edges(ring)
        .map(|((x1, y1), (x2, y2))| x1 * y2 - x2 * y1)
        .sum::<f64>()
        / 2.0
}

pub(crate) fn is_self_intersecting(ring: &[Point]) -> bool {
    let n = ring.len();
    for i in 0..n {
        let (a1, a2) = (ring[i], ring[(i + 1) % n]);
        for j in (i + 1)..n {
            // Adjacent edges share a vertex by construction.
            if j == i + 1 || (i == 0 && j == n - 1) {
                continue;
            }
            let (b1, b2) = (ring[j], ring[(j + 1) % n]);
            if segments_intersect(a1, a2, b1, b2) {
                return true;
            }
        }
    }
    false
}

fn polygon_distance(a: &[Point], b: &[Point]) -> f64 {
    for (a1, a2) in edges(a) {
        for (b1, b2) in edges(b) {
            if segments_intersect(a1, a2, b1, b2) {
                return 0.0;
            }
        }
    }

    if point_in_polygon(a[0], b) || point_in_polygon(b[0], a) {
        return 0.0;
    }

    let a_to_b = a
        .iter()
        .map(|p| point_ring_distance(*p, b))
        .fold(f64::INFINITY, f64::min);
    let b_to_a = b
        .iter()
        .map(|p| point_ring_distance(*p, a))
        .fold(f64::INFINITY, f64::min);
    a_to_b.min(b_to_a)
}

fn point_ring_distance(p: Point, ring: &[Point]) -> f64 {
    edges(ring)
        .map(|(s1, s2)| point_segment_distance(p, s1, s2))
        .fold(f64::INFINITY, f64::min)
}

fn point_segment_distance(p: Point, s1: Point, s2: Point) -> f64 {
    let (dx, dy) = (s2.0 - s1.0, s2.1 - s1.1);
    let len_sq = dx * dx + dy * dy;
    if len_sq < EPSILON {
        return (p.0 - s1.0).hypot(p.1 - s1.1);
    }
    let t = (((p.0 - s1.0) * dx + (p.1 - s1.1) * dy) / len_sq).clamp(0.0, 1.0);
    let (cx, cy) = (s1.0 + t * dx, s1.1 + t * dy);
    (p.0 - cx).hypot(p.1 - cy)
}

/// Even-odd ray casting.
fn point_in_polygon(p: Point, ring: &[Point]) -> bool {
    let mut inside = false;
    for ((x1, y1), (x2, y2)) in edges(ring) {
        if (y1 > p.1) != (y2 > p.1) {
            let x_cross = x1 + (p.1 - y1) * (x2 - x1) / (y2 - y1);
            if p.0 < x_cross {
                inside = !inside;
            }
        }
    }
    inside
}

fn orientation(a: Point, b: Point, c: Point) -> f64 {
    (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0)
}

fn on_segment(a: Point, b: Point, p: Point) -> bool {
    p.0 >= a.0.min(b.0) - EPSILON
        && p.0 <= a.0.max(b.0) + EPSILON
        && p.1 >= a.1.min(b.1) - EPSILON
        && p.1 <= a.1.max(b.1) + EPSILON
}

fn segments_intersect(a1: Point, a2: Point, b1: Point, b2: Point) -> bool {
    let d1 = orientation(b1, b2, a1);
    let d2 = orientation(b1, b2, a2);
    let d3 = orientation(a1, a2, b1);
    let d4 = orientation(a1, a2, b2);

    if ((d1 > EPSILON && d2 < -EPSILON) || (d1 < -EPSILON && d2 > EPSILON))
        && ((d3 > EPSILON && d4 < -EPSILON) || (d3 < -EPSILON && d4 > EPSILON))
    {
        return true;
    }

    (d1.abs() <= EPSILON && on_segment(b1, b2, a1))
        || (d2.abs() <= EPSILON && on_segment(b1, b2, a2))
        || (d3.abs() <= EPSILON && on_segment(a1, a2, b1))
        || (d4.abs() <= EPSILON && on_segment(a1, a2, b2))
}
