//! Polygon boolean and offset operations.
//!
//! This module is the only place that talks to the geo-clipper engine; the
//! rest of the crate calls through it so the engine stays replaceable. All
//! public entry points take and return [`ExPolygon`] sets with explicit holes
//! (hole-free versus regular collision areas is a semantic distinction the
//! support pipeline relies on).
//!
//! Deltas and tolerances are scaled coordinates; conversion to the engine's
//! floating point space happens here.

use crate::geometry::{ExPolygon, ExPolygons, Point, Polygon, Polyline};
use crate::{unscale, Coord, CoordF};
use geo::{Coord as GeoCoord, LineString, MultiPolygon, Polygon as GeoPolygon};
use geo_clipper::{Clipper, EndType, JoinType};

/// Precision factor handed to the clipper engine.
const CLIPPER_FACTOR: CoordF = 1000.0;

/// Join type for offset corners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetJoinType {
    Square,
    /// Round corners; the precise choice for influence areas.
    #[default]
    Round,
    Miter,
}

impl From<OffsetJoinType> for JoinType {
    fn from(jt: OffsetJoinType) -> Self {
        match jt {
            OffsetJoinType::Square => JoinType::Square,
            OffsetJoinType::Round => JoinType::Round(0.25),
            OffsetJoinType::Miter => JoinType::Miter(2.0),
        }
    }
}

fn closed_ring(points: &[Point]) -> LineString<CoordF> {
    let mut ring: Vec<GeoCoord<CoordF>> = points
        .iter()
        .map(|p| GeoCoord {
            x: unscale(p.x),
            y: unscale(p.y),
        })
        .collect();
    if let (Some(first), Some(last)) = (ring.first().copied(), ring.last().copied()) {
        if first != last {
            ring.push(first);
        }
    }
    LineString::new(ring)
}

fn expolygon_to_geo(expoly: &ExPolygon) -> GeoPolygon<CoordF> {
    GeoPolygon::new(
        closed_ring(expoly.contour.points()),
        expoly.holes.iter().map(|h| closed_ring(h.points())).collect(),
    )
}

fn expolygons_to_geo(expolys: &[ExPolygon]) -> MultiPolygon<CoordF> {
    MultiPolygon::new(expolys.iter().map(expolygon_to_geo).collect())
}

fn ring_to_polygon(ring: &LineString<CoordF>) -> Polygon {
    let mut points: Vec<Point> = ring
        .coords()
        .map(|c| Point::new(crate::scale(c.x), crate::scale(c.y)))
        .collect();
    if points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    Polygon::from_points(points)
}

fn geo_to_expolygons(multi: &MultiPolygon<CoordF>) -> ExPolygons {
    multi
        .0
        .iter()
        .map(|poly| {
            ExPolygon::with_holes(
                ring_to_polygon(poly.exterior()),
                poly.interiors().iter().map(ring_to_polygon).collect(),
            )
        })
        .filter(|ex| ex.contour.len() >= 3)
        .collect()
}

/// Union of two polygon sets. Empty inputs short-circuit.
pub fn union(subject: &[ExPolygon], clip: &[ExPolygon]) -> ExPolygons {
    if subject.is_empty() {
        return union_all(clip);
    }
    if clip.is_empty() {
        return union_all(subject);
    }
    let result = expolygons_to_geo(subject).union(&expolygons_to_geo(clip), CLIPPER_FACTOR);
    geo_to_expolygons(&result)
}

/// Union of a single, possibly self-overlapping set.
pub fn union_all(polygons: &[ExPolygon]) -> ExPolygons {
    if polygons.len() <= 1 {
        return polygons.to_vec();
    }
    // A single engine call resolves overlaps across subject and clip alike.
    let result =
        expolygons_to_geo(&polygons[..1]).union(&expolygons_to_geo(&polygons[1..]), CLIPPER_FACTOR);
    geo_to_expolygons(&result)
}

/// Intersection of two polygon sets.
pub fn intersection(subject: &[ExPolygon], clip: &[ExPolygon]) -> ExPolygons {
    if subject.is_empty() || clip.is_empty() {
        return Vec::new();
    }
    let result = expolygons_to_geo(subject).intersection(&expolygons_to_geo(clip), CLIPPER_FACTOR);
    geo_to_expolygons(&result)
}

/// Difference `subject - clip`.
pub fn difference(subject: &[ExPolygon], clip: &[ExPolygon]) -> ExPolygons {
    if subject.is_empty() {
        return Vec::new();
    }
    if clip.is_empty() {
        return subject.to_vec();
    }
    let result = expolygons_to_geo(subject).difference(&expolygons_to_geo(clip), CLIPPER_FACTOR);
    geo_to_expolygons(&result)
}

/// Offset by a scaled delta. Positive grows, negative shrinks.
pub fn offset(expolygons: &[ExPolygon], delta: Coord, join_type: OffsetJoinType) -> ExPolygons {
    if expolygons.is_empty() {
        return Vec::new();
    }
    if delta == 0 {
        return union_all(expolygons);
    }
    let result = expolygons_to_geo(expolygons).offset(
        unscale(delta),
        join_type.into(),
        EndType::ClosedPolygon,
        CLIPPER_FACTOR,
    );
    geo_to_expolygons(&result)
}

/// Widen open polylines into thin area strips of half-width `delta`.
///
/// Used when a union collapsed a degenerate (line-like) area to nothing and
/// the caller needs to keep something with positive area.
pub fn widen_polylines(polylines: &[Polyline], delta: Coord) -> ExPolygons {
    let delta = delta.max(1);
    let mut quads: ExPolygons = Vec::new();
    for polyline in polylines {
        for w in polyline.points().windows(2) {
            let dir = (w[1] - w[0]).to_f64().normalize();
            let normal = crate::geometry::PointF::new(-dir.y, dir.x) * unscale(delta);
            let ext = dir * unscale(delta);
            let a = w[0].to_f64() - ext;
            let b = w[1].to_f64() + ext;
            quads.push(ExPolygon::new(Polygon::from_points(vec![
                (a + normal).to_scaled(),
                (b + normal).to_scaled(),
                (b - normal).to_scaled(),
                (a - normal).to_scaled(),
            ])));
        }
        // Lone points still get a stamp.
        if polyline.len() == 1 {
            quads.push(ExPolygon::circle(polyline.points()[0], delta, 8));
        }
    }
    union_all(&quads)
}

/// Simplify each expolygon and drop degenerate leftovers.
pub fn simplify(expolygons: &[ExPolygon], tolerance: Coord) -> ExPolygons {
    expolygons
        .iter()
        .map(|ex| {
            let mut out = ex.clone();
            out.simplify(tolerance);
            out
        })
        .filter(|ex| ex.contour.len() >= 3)
        .collect()
}

/// Drop expolygons below a minimum area (scaled units squared).
pub fn remove_small(expolygons: &mut ExPolygons, min_area: CoordF) {
    expolygons.retain(|ex| ex.area() >= min_area);
}

/// Total area of a set, scaled units squared.
pub fn area(expolygons: &[ExPolygon]) -> CoordF {
    expolygons.iter().map(ExPolygon::area).sum()
}
