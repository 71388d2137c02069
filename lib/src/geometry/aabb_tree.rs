//! 2D AABB trees.
//!
//! Two flavors are needed by the pipeline:
//!
//! - an in-place tree ordering over arbitrary bbox'd items, used to bucket
//!   influence areas before merging so that spatially close areas land in the
//!   same bucket;
//! - a distance tree over line segments, used by the organic smoother to find
//!   the deepest model penetration of a branch sphere on a layer.
//!
//! Both split on the longest axis of the combined bounding box, the same
//! balancing rule the mesh AABB tree uses.

use super::line::LineF;
use super::{BoundingBox, PointF};
use crate::CoordF;

/// Recursively reorder `items` into AABB-tree order: each power-of-two span
/// holds a spatially coherent subtree. Sorting is by bbox center along the
/// longest axis of the span's combined bounds.
pub fn sort_into_box_tree_order<T, F>(items: &mut [T], bbox: F)
where
    F: Fn(&T) -> BoundingBox + Copy,
{
    if items.len() <= 2 {
        return;
    }
    let mut bounds = BoundingBox::new();
    for item in items.iter() {
        bounds.merge(&bbox(item));
    }
    let split_x = bounds.width() >= bounds.height();
    let mid = items.len() / 2;
    items.select_nth_unstable_by_key(mid, |item| {
        let c = bbox(item).center();
        if split_x {
            (c.x, c.y)
        } else {
            (c.y, c.x)
        }
    });
    let (left, right) = items.split_at_mut(mid);
    sort_into_box_tree_order(left, bbox);
    sort_into_box_tree_order(right, bbox);
}

/// Bounding box of a float segment.
fn line_bbox(line: &LineF) -> (PointF, PointF) {
    (
        PointF::new(line.a.x.min(line.b.x), line.a.y.min(line.b.y)),
        PointF::new(line.a.x.max(line.b.x), line.a.y.max(line.b.y)),
    )
}

#[derive(Debug, Clone)]
struct LineTreeNode {
    min: PointF,
    max: PointF,
    /// Leaf: index into the segment list. Inner: usize::MAX.
    segment: usize,
    left: usize,
    right: usize,
}

/// A static distance tree over 2D line segments.
#[derive(Debug, Clone, Default)]
pub struct LineTree2D {
    lines: Vec<LineF>,
    nodes: Vec<LineTreeNode>,
    root: usize,
}

impl LineTree2D {
    pub fn build(lines: Vec<LineF>) -> Self {
        let mut tree = Self {
            lines,
            nodes: Vec::new(),
            root: usize::MAX,
        };
        if !tree.lines.is_empty() {
            let mut order: Vec<usize> = (0..tree.lines.len()).collect();
            tree.root = tree.build_recursive(&mut order);
        }
        tree
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    #[inline]
    pub fn lines(&self) -> &[LineF] {
        &self.lines
    }

    fn build_recursive(&mut self, order: &mut [usize]) -> usize {
        if order.len() == 1 {
            let (min, max) = line_bbox(&self.lines[order[0]]);
            self.nodes.push(LineTreeNode {
                min,
                max,
                segment: order[0],
                left: usize::MAX,
                right: usize::MAX,
            });
            return self.nodes.len() - 1;
        }

        let mut min = PointF::new(CoordF::MAX, CoordF::MAX);
        let mut max = PointF::new(CoordF::MIN, CoordF::MIN);
        for &i in order.iter() {
            let (lmin, lmax) = line_bbox(&self.lines[i]);
            min = PointF::new(min.x.min(lmin.x), min.y.min(lmin.y));
            max = PointF::new(max.x.max(lmax.x), max.y.max(lmax.y));
        }

        let split_x = (max.x - min.x) >= (max.y - min.y);
        let mid = order.len() / 2;
        order.select_nth_unstable_by(mid, |&a, &b| {
            let ca = self.lines[a].a + self.lines[a].b;
            let cb = self.lines[b].a + self.lines[b].b;
            let (ka, kb) = if split_x { (ca.x, cb.x) } else { (ca.y, cb.y) };
            ka.partial_cmp(&kb).unwrap_or(std::cmp::Ordering::Equal)
        });

        // Split into two owned halves; recursion borrows self mutably.
        let (left_order, right_order) = order.split_at_mut(mid);
        let mut left_order = left_order.to_vec();
        let mut right_order = right_order.to_vec();
        let left = self.build_recursive(&mut left_order);
        let right = self.build_recursive(&mut right_order);
        self.nodes.push(LineTreeNode {
            min,
            max,
            segment: usize::MAX,
            left,
            right,
        });
        self.nodes.len() - 1
    }

    fn bbox_distance_squared(node: &LineTreeNode, p: PointF) -> CoordF {
        let dx = (node.min.x - p.x).max(0.0).max(p.x - node.max.x);
        let dy = (node.min.y - p.y).max(0.0).max(p.y - node.max.y);
        dx * dx + dy * dy
    }

    /// Closest point on any segment to `p`, or `None` for an empty tree.
    /// Returns `(distance, closest_point)`.
    pub fn closest_point(&self, p: PointF) -> Option<(CoordF, PointF)> {
        if self.root == usize::MAX {
            return None;
        }
        let mut best_dist = CoordF::MAX;
        let mut best_point = PointF::default();
        let mut stack = vec![self.root];
        while let Some(node_idx) = stack.pop() {
            let node = &self.nodes[node_idx];
            if Self::bbox_distance_squared(node, p) >= best_dist * best_dist {
                continue;
            }
            if node.segment != usize::MAX {
                let (dist, closest) = self.lines[node.segment].closest_point(p);
                if dist < best_dist {
                    best_dist = dist;
                    best_point = closest;
                }
            } else {
                // Descend into the nearer child first for tighter pruning.
                let dl = Self::bbox_distance_squared(&self.nodes[node.left], p);
                let dr = Self::bbox_distance_squared(&self.nodes[node.right], p);
                if dl <= dr {
                    stack.push(node.right);
                    stack.push(node.left);
                } else {
                    stack.push(node.left);
                    stack.push(node.right);
                }
            }
        }
        Some((best_dist, best_point))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point;

    #[test]
    fn test_sort_into_box_tree_order() {
        let mut points: Vec<Point> = vec![
            Point::new(100, 0),
            Point::new(0, 0),
            Point::new(50, 0),
            Point::new(75, 0),
            Point::new(25, 0),
        ];
        sort_into_box_tree_order(&mut points, |p| BoundingBox::from_points(&[*p]));
        // Left half entirely left of right half.
        let mid = points.len() / 2;
        let left_max = points[..mid].iter().map(|p| p.x).max().unwrap();
        let right_min = points[mid..].iter().map(|p| p.x).min().unwrap();
        assert!(left_max <= right_min);
    }

    #[test]
    fn test_line_tree_empty() {
        let tree = LineTree2D::build(Vec::new());
        assert!(tree.is_empty());
        assert!(tree.closest_point(PointF::new(0.0, 0.0)).is_none());
    }

    #[test]
    fn test_line_tree_closest() {
        // A unit square boundary.
        let corners = [
            PointF::new(0.0, 0.0),
            PointF::new(10.0, 0.0),
            PointF::new(10.0, 10.0),
            PointF::new(0.0, 10.0),
        ];
        let lines: Vec<LineF> = (0..4)
            .map(|i| LineF::new(corners[i], corners[(i + 1) % 4]))
            .collect();
        let tree = LineTree2D::build(lines.clone());

        let query = PointF::new(5.0, 3.0);
        let (dist, closest) = tree.closest_point(query).unwrap();

        // Compare against brute force.
        let (bf_dist, bf_closest) = lines
            .iter()
            .map(|l| l.closest_point(query))
            .min_by(|a, b| a.0.partial_cmp(&b.0).unwrap())
            .unwrap();
        assert!((dist - bf_dist).abs() < 1e-9);
        assert!((closest.x - bf_closest.x).abs() < 1e-9);
        assert!((closest.y - bf_closest.y).abs() < 1e-9);
        assert!((dist - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_line_tree_many_segments() {
        // A jittered horizontal fence; nearest distance is the vertical gap.
        let lines: Vec<LineF> = (0..64)
            .map(|i| {
                let x = i as CoordF;
                LineF::new(PointF::new(x, 0.0), PointF::new(x + 1.0, 0.0))
            })
            .collect();
        let tree = LineTree2D::build(lines);
        let (dist, _) = tree.closest_point(PointF::new(31.4, 2.5)).unwrap();
        assert!((dist - 2.5).abs() < 1e-9);
    }
}
