//! 2D geometry primitives for support generation.
//!
//! Coordinates are scaled integers ([`crate::Coord`], 1 mm = 1,000,000 scaled
//! units), with floating point mirrors where trigonometry is involved.
//! Polygons store open rings (the closing edge is implicit); [`ExPolygon`]
//! pairs an outer contour with its holes.

pub mod aabb_tree;
pub mod bounding_box;
pub mod expolygon;
pub mod line;
pub mod point;
pub mod polygon;
pub mod polyline;

pub use aabb_tree::{sort_into_box_tree_order, LineTree2D};
pub use bounding_box::BoundingBox;
pub use expolygon::{ExPolygon, ExPolygons};
pub use line::{Line, LineF};
pub use point::{Point, Point3F, PointF};
pub use polygon::{Polygon, Polygons};
pub use polyline::{Polyline, Polylines};
