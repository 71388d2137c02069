//! Closed polygon contours.

use super::{BoundingBox, Line, Point, Polyline};
use crate::{Coord, CoordF};
use serde::{Deserialize, Serialize};

/// A closed polygon. Points form an open ring; the edge from the last point
/// back to the first is implicit. Counter-clockwise orientation is positive
/// area.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Polygon {
    points: Vec<Point>,
}

/// A set of polygon contours. Holes, where present, are carried as separate
/// contours the boolean engine re-associates by orientation.
pub type Polygons = Vec<Polygon>;

impl Polygon {
    pub fn new() -> Self {
        Self { points: Vec::new() }
    }

    pub fn from_points(points: Vec<Point>) -> Self {
        Self { points }
    }

    #[inline]
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    #[inline]
    pub fn points_mut(&mut self) -> &mut Vec<Point> {
        &mut self.points
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn push(&mut self, p: Point) {
        self.points.push(p);
    }

    pub fn edge(&self, index: usize) -> Line {
        Line::new(
            self.points[index],
            self.points[(index + 1) % self.points.len()],
        )
    }

    /// Signed area in scaled units squared; positive for counter-clockwise.
    pub fn signed_area(&self) -> CoordF {
        if self.points.len() < 3 {
            return 0.0;
        }
        let mut acc: i128 = 0;
        for i in 0..self.points.len() {
            let p = self.points[i];
            let q = self.points[(i + 1) % self.points.len()];
            acc += p.x as i128 * q.y as i128 - q.x as i128 * p.y as i128;
        }
        acc as CoordF / 2.0
    }

    #[inline]
    pub fn area(&self) -> CoordF {
        self.signed_area().abs()
    }

    #[inline]
    pub fn is_counter_clockwise(&self) -> bool {
        self.signed_area() >= 0.0
    }

    pub fn reverse(&mut self) {
        self.points.reverse();
    }

    pub fn perimeter(&self) -> CoordF {
        if self.points.len() < 2 {
            return 0.0;
        }
        let mut total = 0.0;
        for i in 0..self.points.len() {
            total += self.points[i].distance(&self.points[(i + 1) % self.points.len()]);
        }
        total
    }

    pub fn bounding_box(&self) -> BoundingBox {
        BoundingBox::from_points(&self.points)
    }

    /// Even-odd point in polygon test. Boundary points count as inside.
    pub fn contains_point(&self, p: &Point) -> bool {
        if self.points.len() < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = self.points.len() - 1;
        for i in 0..self.points.len() {
            let pi = self.points[i];
            let pj = self.points[j];
            // On-edge check keeps boundary points inside regardless of ray direction.
            if p.project_onto_segment(pi, pj) == *p {
                return true;
            }
            if (pi.y > p.y) != (pj.y > p.y) {
                let x_cross = pi.x as f64
                    + (p.y - pi.y) as f64 / (pj.y - pi.y) as f64 * (pj.x - pi.x) as f64;
                if (p.x as f64) < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }

    /// Closest point on this polygon's boundary to `p`.
    pub fn closest_point(&self, p: &Point) -> Point {
        let mut best = self.points.first().copied().unwrap_or(*p);
        let mut best_dist2 = i128::MAX;
        for i in 0..self.points.len() {
            let candidate = self.edge(i).closest_point(*p);
            let dist2 = candidate.distance_squared(p);
            if dist2 < best_dist2 {
                best_dist2 = dist2;
                best = candidate;
            }
        }
        best
    }

    pub fn distance_to_point(&self, p: &Point) -> CoordF {
        self.closest_point(p).distance(p)
    }

    pub fn translate(&mut self, v: Point) {
        for p in &mut self.points {
            *p += v;
        }
    }

    pub fn translated(&self, v: Point) -> Self {
        let mut result = self.clone();
        result.translate(v);
        result
    }

    /// Douglas-Peucker simplification with the closing edge respected.
    pub fn simplify(&mut self, tolerance: Coord) {
        if self.points.len() <= 4 || tolerance <= 0 {
            return;
        }
        let mut ring = self.points.clone();
        ring.push(ring[0]);
        let simplified = simplify_douglas_peucker(&ring, tolerance as CoordF);
        self.points = simplified;
        if self.points.last() == self.points.first() && self.points.len() > 1 {
            self.points.pop();
        }
    }

    pub fn simplified(&self, tolerance: Coord) -> Self {
        let mut result = self.clone();
        result.simplify(tolerance);
        result
    }

    pub fn to_polyline(&self) -> Polyline {
        Polyline::from_points(self.points.clone())
    }

    /// Closed polyline: the ring with its first point repeated at the end.
    pub fn to_closed_polyline(&self) -> Polyline {
        let mut points = self.points.clone();
        if let Some(first) = points.first().copied() {
            points.push(first);
        }
        Polyline::from_points(points)
    }

    pub fn rectangle(min: Point, max: Point) -> Self {
        Self::from_points(vec![
            min,
            Point::new(max.x, min.y),
            max,
            Point::new(min.x, max.y),
        ])
    }

    /// A regular polygon approximating a circle.
    pub fn circle(center: Point, radius: Coord, segments: usize) -> Self {
        let segments = segments.max(3);
        let mut points = Vec::with_capacity(segments);
        for i in 0..segments {
            let angle = 2.0 * std::f64::consts::PI * i as CoordF / segments as CoordF;
            points.push(Point::new(
                center.x + (radius as CoordF * angle.cos()).round() as Coord,
                center.y + (radius as CoordF * angle.sin()).round() as Coord,
            ));
        }
        Self::from_points(points)
    }
}

fn simplify_douglas_peucker(points: &[Point], tolerance: CoordF) -> Vec<Point> {
    if points.len() <= 2 {
        return points.to_vec();
    }
    let mut keep = vec![false; points.len()];
    keep[0] = true;
    keep[points.len() - 1] = true;
    let mut stack = vec![(0usize, points.len() - 1)];
    while let Some((first, last)) = stack.pop() {
        let mut max_dist = 0.0;
        let mut index = first;
        for i in first + 1..last {
            let proj = points[i].project_onto_segment(points[first], points[last]);
            let dist = proj.distance(&points[i]);
            if dist > max_dist {
                max_dist = dist;
                index = i;
            }
        }
        if max_dist > tolerance {
            keep[index] = true;
            stack.push((first, index));
            stack.push((index, last));
        }
    }
    points
        .iter()
        .zip(keep.iter())
        .filter_map(|(p, k)| k.then_some(*p))
        .collect()
}

/// Total perimeter of a set of contours.
pub fn total_length(polygons: &[Polygon]) -> CoordF {
    polygons.iter().map(Polygon::perimeter).sum()
}

/// Sum of unsigned contour areas.
pub fn total_area(polygons: &[Polygon]) -> CoordF {
    polygons.iter().map(Polygon::area).sum()
}

/// Whether any contour of the set contains the point.
pub fn contains(polygons: &[Polygon], p: Point) -> bool {
    polygons.iter().any(|poly| poly.contains_point(&p))
}
