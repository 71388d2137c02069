//! Polygons with holes.

use super::{BoundingBox, Point, Polygon};
use crate::{Coord, CoordF};
use serde::{Deserialize, Serialize};

/// An outer contour with zero or more holes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExPolygon {
    pub contour: Polygon,
    pub holes: Vec<Polygon>,
}

pub type ExPolygons = Vec<ExPolygon>;

impl ExPolygon {
    pub fn new(contour: Polygon) -> Self {
        Self {
            contour,
            holes: Vec::new(),
        }
    }

    pub fn with_holes(contour: Polygon, holes: Vec<Polygon>) -> Self {
        Self { contour, holes }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.contour.is_empty()
    }

    pub fn add_hole(&mut self, hole: Polygon) {
        self.holes.push(hole);
    }

    /// Area of the contour minus its holes, in scaled units squared.
    pub fn area(&self) -> CoordF {
        let mut area = self.contour.area();
        for hole in &self.holes {
            area -= hole.area();
        }
        area
    }

    pub fn bounding_box(&self) -> BoundingBox {
        self.contour.bounding_box()
    }

    /// Inside the contour and outside every hole.
    pub fn contains_point(&self, p: &Point) -> bool {
        self.contour.contains_point(p)
            && !self
                .holes
                .iter()
                .any(|hole| hole.contains_point(p) && hole.closest_point(p) != *p)
    }

    pub fn simplify(&mut self, tolerance: Coord) {
        self.contour.simplify(tolerance);
        for hole in &mut self.holes {
            hole.simplify(tolerance);
        }
        self.holes.retain(|h| h.len() >= 3);
    }

    /// Contour and holes as a flat polygon set.
    pub fn to_polygons(&self) -> Vec<Polygon> {
        let mut result = Vec::with_capacity(1 + self.holes.len());
        result.push(self.contour.clone());
        result.extend(self.holes.iter().cloned());
        result
    }

    pub fn rectangle(min: Point, max: Point) -> Self {
        Self::new(Polygon::rectangle(min, max))
    }

    pub fn circle(center: Point, radius: Coord, segments: usize) -> Self {
        Self::new(Polygon::circle(center, radius, segments))
    }
}

impl From<Polygon> for ExPolygon {
    fn from(contour: Polygon) -> Self {
        Self::new(contour)
    }
}

/// Flatten a set of expolygons to contours and holes.
pub fn to_polygons(expolygons: &[ExPolygon]) -> Vec<Polygon> {
    let mut out = Vec::new();
    for ex in expolygons {
        out.push(ex.contour.clone());
        out.extend(ex.holes.iter().cloned());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scale;

    fn donut() -> ExPolygon {
        ExPolygon::with_holes(
            Polygon::rectangle(Point::zero(), Point::new(scale(20.0), scale(20.0))),
            vec![Polygon::rectangle(
                Point::new(scale(5.0), scale(5.0)),
                Point::new(scale(15.0), scale(15.0)),
            )],
        )
    }

    #[test]
    fn test_area_with_hole() {
        let ex = donut();
        let expected = (scale(20.0) as CoordF).powi(2) - (scale(10.0) as CoordF).powi(2);
        assert!((ex.area() - expected).abs() < expected * 1e-9);
    }

    #[test]
    fn test_contains_with_hole() {
        let ex = donut();
        assert!(ex.contains_point(&Point::new(scale(2.0), scale(2.0))));
        assert!(!ex.contains_point(&Point::new(scale(10.0), scale(10.0))));
        assert!(!ex.contains_point(&Point::new(scale(25.0), scale(2.0))));
    }

    #[test]
    fn test_to_polygons() {
        let ex = donut();
        let polys = ex.to_polygons();
        assert_eq!(polys.len(), 2);
    }
}
