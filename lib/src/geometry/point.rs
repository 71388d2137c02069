//! 2D and 3D point types.

use crate::{scale, unscale, Coord, CoordF};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

/// A 2D point in scaled integer coordinates.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: Coord,
    pub y: Coord,
}

impl Point {
    #[inline]
    pub const fn new(x: Coord, y: Coord) -> Self {
        Self { x, y }
    }

    /// Create a point from millimeter coordinates.
    #[inline]
    pub fn new_scale(x: CoordF, y: CoordF) -> Self {
        Self::new(scale(x), scale(y))
    }

    #[inline]
    pub const fn zero() -> Self {
        Self::new(0, 0)
    }

    #[inline]
    pub fn to_f64(&self) -> PointF {
        PointF::new(unscale(self.x), unscale(self.y))
    }

    /// Squared distance in scaled units, widened to avoid overflow.
    #[inline]
    pub fn distance_squared(&self, other: &Point) -> i128 {
        let dx = (self.x - other.x) as i128;
        let dy = (self.y - other.y) as i128;
        dx * dx + dy * dy
    }

    /// Euclidean distance in scaled units.
    #[inline]
    pub fn distance(&self, other: &Point) -> CoordF {
        (self.distance_squared(other) as CoordF).sqrt()
    }

    #[inline]
    pub fn length_squared(&self) -> i128 {
        self.distance_squared(&Point::zero())
    }

    #[inline]
    pub fn length(&self) -> CoordF {
        (self.length_squared() as CoordF).sqrt()
    }

    #[inline]
    pub fn dot(&self, other: &Point) -> i128 {
        self.x as i128 * other.x as i128 + self.y as i128 * other.y as i128
    }

    #[inline]
    pub fn cross(&self, other: &Point) -> i128 {
        self.x as i128 * other.y as i128 - self.y as i128 * other.x as i128
    }

    /// Project this point onto the segment `a`-`b`, clamped to its endpoints.
    pub fn project_onto_segment(&self, a: Point, b: Point) -> Point {
        let ab = b - a;
        let len2 = ab.length_squared();
        if len2 == 0 {
            return a;
        }
        let t = ((*self - a).dot(&ab)) as CoordF / len2 as CoordF;
        let t = t.clamp(0.0, 1.0);
        Point::new(
            a.x + (ab.x as CoordF * t).round() as Coord,
            a.y + (ab.y as CoordF * t).round() as Coord,
        )
    }
}

impl fmt::Debug for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

impl Add for Point {
    type Output = Point;
    #[inline]
    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl AddAssign for Point {
    #[inline]
    fn add_assign(&mut self, rhs: Point) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl Sub for Point {
    type Output = Point;
    #[inline]
    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl SubAssign for Point {
    #[inline]
    fn sub_assign(&mut self, rhs: Point) {
        self.x -= rhs.x;
        self.y -= rhs.y;
    }
}

impl Neg for Point {
    type Output = Point;
    #[inline]
    fn neg(self) -> Point {
        Point::new(-self.x, -self.y)
    }
}

impl Mul<Coord> for Point {
    type Output = Point;
    #[inline]
    fn mul(self, rhs: Coord) -> Point {
        Point::new(self.x * rhs, self.y * rhs)
    }
}

impl Div<Coord> for Point {
    type Output = Point;
    #[inline]
    fn div(self, rhs: Coord) -> Point {
        Point::new(self.x / rhs, self.y / rhs)
    }
}

/// A 2D point in floating point millimeters.
#[derive(Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PointF {
    pub x: CoordF,
    pub y: CoordF,
}

impl PointF {
    #[inline]
    pub const fn new(x: CoordF, y: CoordF) -> Self {
        Self { x, y }
    }

    #[inline]
    pub fn to_scaled(&self) -> Point {
        Point::new(scale(self.x), scale(self.y))
    }

    #[inline]
    pub fn distance(&self, other: &PointF) -> CoordF {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    #[inline]
    pub fn length(&self) -> CoordF {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    pub fn normalize(&self) -> Self {
        let len = self.length();
        if len < 1e-12 {
            Self::new(0.0, 0.0)
        } else {
            Self::new(self.x / len, self.y / len)
        }
    }

    #[inline]
    pub fn dot(&self, other: &PointF) -> CoordF {
        self.x * other.x + self.y * other.y
    }
}

impl fmt::Debug for PointF {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.4}, {:.4})", self.x, self.y)
    }
}

impl Add for PointF {
    type Output = PointF;
    #[inline]
    fn add(self, rhs: PointF) -> PointF {
        PointF::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for PointF {
    type Output = PointF;
    #[inline]
    fn sub(self, rhs: PointF) -> PointF {
        PointF::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<CoordF> for PointF {
    type Output = PointF;
    #[inline]
    fn mul(self, rhs: CoordF) -> PointF {
        PointF::new(self.x * rhs, self.y * rhs)
    }
}

/// A 3D point in floating point millimeters, used by the organic tube mesh.
#[derive(Clone, Copy, PartialEq, Debug, Default)]
pub struct Point3F {
    pub x: CoordF,
    pub y: CoordF,
    pub z: CoordF,
}

impl Point3F {
    #[inline]
    pub const fn new(x: CoordF, y: CoordF, z: CoordF) -> Self {
        Self { x, y, z }
    }

    #[inline]
    pub fn to_2d(&self) -> PointF {
        PointF::new(self.x, self.y)
    }

    #[inline]
    pub fn dot(&self, other: &Point3F) -> CoordF {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    #[inline]
    pub fn cross(&self, other: &Point3F) -> Point3F {
        Point3F::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    #[inline]
    pub fn length(&self) -> CoordF {
        self.dot(self).sqrt()
    }

    pub fn normalize(&self) -> Point3F {
        let len = self.length();
        if len < 1e-12 {
            // Degenerate direction, default to up.
            Point3F::new(0.0, 0.0, 1.0)
        } else {
            Point3F::new(self.x / len, self.y / len, self.z / len)
        }
    }

    #[inline]
    pub fn distance_squared(&self, other: &Point3F) -> CoordF {
        let d = *self - *other;
        d.dot(&d)
    }
}

impl Add for Point3F {
    type Output = Point3F;
    #[inline]
    fn add(self, rhs: Point3F) -> Point3F {
        Point3F::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Point3F {
    type Output = Point3F;
    #[inline]
    fn sub(self, rhs: Point3F) -> Point3F {
        Point3F::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<CoordF> for Point3F {
    type Output = Point3F;
    #[inline]
    fn mul(self, rhs: CoordF) -> Point3F {
        Point3F::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_arithmetic() {
        let a = Point::new(3, 4);
        let b = Point::new(1, 2);
        assert_eq!(a + b, Point::new(4, 6));
        assert_eq!(a - b, Point::new(2, 2));
        assert_eq!(-a, Point::new(-3, -4));
        assert_eq!(a * 2, Point::new(6, 8));
        assert_eq!(a / 2, Point::new(1, 2));
    }

    #[test]
    fn test_point_distance() {
        let a = Point::new(0, 0);
        let b = Point::new(3, 4);
        assert_eq!(a.distance_squared(&b), 25);
        assert!((a.distance(&b) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_project_onto_segment() {
        let a = Point::new(0, 0);
        let b = Point::new(10, 0);
        assert_eq!(Point::new(5, 7).project_onto_segment(a, b), Point::new(5, 0));
        assert_eq!(Point::new(-5, 7).project_onto_segment(a, b), a);
        assert_eq!(Point::new(15, 7).project_onto_segment(a, b), b);
        // Degenerate segment.
        assert_eq!(Point::new(5, 5).project_onto_segment(a, a), a);
    }

    #[test]
    fn test_point3f_normalize() {
        let v = Point3F::new(3.0, 4.0, 0.0);
        let n = v.normalize();
        assert!((n.length() - 1.0).abs() < 1e-9);
        // Zero vector falls back to up.
        let up = Point3F::default().normalize();
        assert!((up.z - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_cross_product() {
        let x = Point3F::new(1.0, 0.0, 0.0);
        let y = Point3F::new(0.0, 1.0, 0.0);
        let z = x.cross(&y);
        assert!((z.z - 1.0).abs() < 1e-12);
    }
}
