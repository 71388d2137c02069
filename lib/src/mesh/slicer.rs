//! Plane slicing of triangle meshes.
//!
//! Intersection segments are keyed by the mesh edges they lie on, so loops
//! chain exactly without distance tolerances. The slicing mode is positive:
//! open chains are closed rather than discarded, which suits the re-sliced
//! support tube mesh where caps may touch a slicing plane.

use crate::clipper::{self, OffsetJoinType};
use crate::geometry::{ExPolygons, Point, Polygon};
use crate::mesh::TriangleMesh;
use crate::{scale, Coord, CoordF};
use std::collections::HashMap;

/// Identifier of an intersection endpoint: the undirected mesh edge it sits on.
type EdgeKey = (u32, u32);

fn edge_key(a: u32, b: u32) -> EdgeKey {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

#[derive(Debug, Clone, Copy)]
struct SliceSegment {
    a: Point,
    b: Point,
    a_edge: EdgeKey,
    b_edge: EdgeKey,
}

/// Intersection point of a mesh edge with the plane, computed from the lower
/// vertex index first so shared edges produce bit-identical points.
fn edge_plane_intersection(mesh: &TriangleMesh, key: EdgeKey, z: CoordF) -> Point {
    let va = mesh.vertex(key.0);
    let vb = mesh.vertex(key.1);
    let t = (z - va.z) / (vb.z - va.z);
    Point::new(
        scale(va.x + (vb.x - va.x) * t),
        scale(va.y + (vb.y - va.y) * t),
    )
}

/// Collect the intersection segments of all triangles with the plane at `z`.
/// Segments are oriented so that solid interior lies to their left.
fn slice_plane_segments(mesh: &TriangleMesh, z: CoordF) -> Vec<SliceSegment> {
    let mut segments = Vec::new();
    for tri_idx in 0..mesh.triangle_count() {
        let idx = mesh.indices()[tri_idx];
        let v = mesh.triangle_vertices(tri_idx);

        // Directed edges of the triangle; with outward normals, taking the
        // above->below crossing as the segment start makes solid loops wind
        // counter-clockwise.
        let mut start: Option<(Point, EdgeKey)> = None;
        let mut end: Option<(Point, EdgeKey)> = None;
        for e in 0..3 {
            let (i0, i1) = (idx[e], idx[(e + 1) % 3]);
            let (z0, z1) = (v[e].z, v[(e + 1) % 3].z);
            if (z0 < z) == (z1 < z) {
                continue;
            }
            let key = edge_key(i0, i1);
            let p = edge_plane_intersection(mesh, key, z);
            if z0 < z {
                end = Some((p, key));
            } else {
                start = Some((p, key));
            }
        }
        if let (Some((pa, ka)), Some((pb, kb))) = (start, end) {
            if pa != pb {
                segments.push(SliceSegment {
                    a: pa,
                    b: pb,
                    a_edge: ka,
                    b_edge: kb,
                });
            }
        }
    }
    segments
}

/// Chain segments into loops by their edge keys.
fn chain_segments(segments: Vec<SliceSegment>) -> Vec<Polygon> {
    let mut by_start: HashMap<EdgeKey, Vec<usize>> = HashMap::new();
    for (i, seg) in segments.iter().enumerate() {
        by_start.entry(seg.a_edge).or_default().push(i);
    }
    let mut used = vec![false; segments.len()];
    let mut polygons = Vec::new();

    for seed in 0..segments.len() {
        if used[seed] {
            continue;
        }
        used[seed] = true;
        let mut points = vec![segments[seed].a];
        let mut cursor = segments[seed];
        loop {
            points.push(cursor.b);
            let next = by_start
                .get(&cursor.b_edge)
                .and_then(|candidates| candidates.iter().find(|&&i| !used[i]).copied());
            match next {
                Some(i) => {
                    used[i] = true;
                    cursor = segments[i];
                    if cursor.a_edge == segments[seed].a_edge {
                        // Loop closed.
                        break;
                    }
                }
                // Open chain; positive mode closes it with the implicit edge.
                None => break,
            }
        }
        if points.len() > 2 && points.first() == points.last() {
            points.pop();
        }
        if points.len() >= 3 {
            polygons.push(Polygon::from_points(points));
        }
    }
    polygons
}

/// Assemble raw loops into expolygons: counter-clockwise loops are solids,
/// clockwise loops are holes.
fn make_expolygons(polygons: Vec<Polygon>, closing_radius: Coord) -> ExPolygons {
    let mut solids: ExPolygons = Vec::new();
    let mut holes: ExPolygons = Vec::new();
    for polygon in polygons {
        if polygon.is_counter_clockwise() {
            solids.push(crate::geometry::ExPolygon::new(polygon));
        } else {
            let mut reversed = polygon;
            reversed.reverse();
            holes.push(crate::geometry::ExPolygon::new(reversed));
        }
    }
    let mut result = clipper::difference(&clipper::union_all(&solids), &clipper::union_all(&holes));
    if closing_radius > 0 {
        // Morphological closing seals tiny self-intersection gaps.
        result = clipper::offset(
            &clipper::offset(&result, closing_radius, OffsetJoinType::Round),
            -closing_radius,
            OffsetJoinType::Round,
        );
    }
    result
}

/// Slice the mesh at every height in `zs`.
pub fn slice_mesh(mesh: &TriangleMesh, zs: &[CoordF], closing_radius: Coord) -> Vec<ExPolygons> {
    if mesh.is_empty() {
        return vec![Vec::new(); zs.len()];
    }
    zs.iter()
        .map(|&z| {
            // Keep the plane off exact vertex heights.
            let z = z + 1e-7;
            let segments = slice_plane_segments(mesh, z);
            if segments.is_empty() {
                Vec::new()
            } else {
                make_expolygons(chain_segments(segments), closing_radius)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipper::area;
    use crate::SCALING_FACTOR;

    #[test]
    fn test_slice_cube_midplane() {
        let mesh = TriangleMesh::cube(10.0);
        let slices = slice_mesh(&mesh, &[0.0], 0);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), 1);
        let expected = 100.0 * SCALING_FACTOR * SCALING_FACTOR;
        assert!((area(&slices[0]) - expected).abs() < expected * 0.01);
    }

    #[test]
    fn test_slice_cube_outside() {
        let mesh = TriangleMesh::cube(10.0);
        let slices = slice_mesh(&mesh, &[7.0, -7.0], 0);
        assert!(slices[0].is_empty());
        assert!(slices[1].is_empty());
    }

    #[test]
    fn test_slice_multiple_heights() {
        let mesh = TriangleMesh::cube(10.0);
        let zs: Vec<CoordF> = (-4..=4).map(|i| i as CoordF).collect();
        let slices = slice_mesh(&mesh, &zs, 0);
        assert_eq!(slices.len(), zs.len());
        for layer in &slices {
            assert_eq!(layer.len(), 1);
        }
    }

    #[test]
    fn test_slice_two_disjoint_cubes() {
        let mut mesh = TriangleMesh::cube(4.0);
        // A second cube shifted 10mm in x.
        let cube = TriangleMesh::cube(4.0);
        let mut shifted = TriangleMesh::new();
        for v in cube.vertices() {
            shifted.add_vertex(crate::geometry::Point3F::new(v.x + 10.0, v.y, v.z));
        }
        for tri in cube.indices() {
            shifted.add_triangle(tri[0], tri[1], tri[2]);
        }
        mesh.merge(&shifted);

        let slices = slice_mesh(&mesh, &[0.0], 0);
        assert_eq!(slices[0].len(), 2, "two disjoint contours expected");
    }

    #[test]
    fn test_slice_empty_mesh() {
        let mesh = TriangleMesh::new();
        let slices = slice_mesh(&mesh, &[0.0, 1.0], 0);
        assert_eq!(slices.len(), 2);
        assert!(slices.iter().all(Vec::is_empty));
    }

    #[test]
    fn test_closing_radius_seals_gap() {
        let mesh = TriangleMesh::cube(10.0);
        let plain = slice_mesh(&mesh, &[0.0], 0);
        let closed = slice_mesh(&mesh, &[0.0], scale(0.05));
        // Closing a solid square is a no-op up to rounding.
        assert!((area(&plain[0]) - area(&closed[0])).abs() < area(&plain[0]) * 0.02);
    }
}
