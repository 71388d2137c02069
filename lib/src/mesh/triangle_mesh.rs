//! Indexed triangle mesh.

use crate::geometry::Point3F;
use crate::CoordF;

/// An indexed triangle set in floating point millimeters.
#[derive(Debug, Clone, Default)]
pub struct TriangleMesh {
    vertices: Vec<Point3F>,
    indices: Vec<[u32; 3]>,
}

impl TriangleMesh {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn vertices(&self) -> &[Point3F] {
        &self.vertices
    }

    #[inline]
    pub fn indices(&self) -> &[[u32; 3]] {
        &self.indices
    }

    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.indices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn add_vertex(&mut self, v: Point3F) -> u32 {
        self.vertices.push(v);
        (self.vertices.len() - 1) as u32
    }

    pub fn add_triangle(&mut self, v0: u32, v1: u32, v2: u32) {
        self.indices.push([v0, v1, v2]);
    }

    #[inline]
    pub fn vertex(&self, idx: u32) -> Point3F {
        self.vertices[idx as usize]
    }

    pub fn triangle_vertices(&self, tri_idx: usize) -> [Point3F; 3] {
        let tri = self.indices[tri_idx];
        [
            self.vertices[tri[0] as usize],
            self.vertices[tri[1] as usize],
            self.vertices[tri[2] as usize],
        ]
    }

    /// Append another mesh, rewriting its indices.
    pub fn merge(&mut self, other: &TriangleMesh) {
        let offset = self.vertices.len() as u32;
        self.vertices.extend_from_slice(&other.vertices);
        self.indices.extend(
            other
                .indices
                .iter()
                .map(|tri| [tri[0] + offset, tri[1] + offset, tri[2] + offset]),
        );
    }

    pub fn z_span(&self) -> (CoordF, CoordF) {
        let mut min_z = CoordF::MAX;
        let mut max_z = CoordF::MIN;
        for v in &self.vertices {
            min_z = min_z.min(v.z);
            max_z = max_z.max(v.z);
        }
        (min_z, max_z)
    }

    /// An axis-aligned cube of the given edge length centered at the origin.
    pub fn cube(size: CoordF) -> Self {
        let h = size / 2.0;
        let mut mesh = Self::new();
        let corners = [
            Point3F::new(-h, -h, -h),
            Point3F::new(h, -h, -h),
            Point3F::new(h, h, -h),
            Point3F::new(-h, h, -h),
            Point3F::new(-h, -h, h),
            Point3F::new(h, -h, h),
            Point3F::new(h, h, h),
            Point3F::new(-h, h, h),
        ];
        for c in corners {
            mesh.add_vertex(c);
        }
        let faces: [[u32; 3]; 12] = [
            [0, 2, 1],
            [0, 3, 2], // bottom
            [4, 5, 6],
            [4, 6, 7], // top
            [0, 1, 5],
            [0, 5, 4], // front
            [1, 2, 6],
            [1, 6, 5], // right
            [2, 3, 7],
            [2, 7, 6], // back
            [3, 0, 4],
            [3, 4, 7], // left
        ];
        for f in faces {
            mesh.add_triangle(f[0], f[1], f[2]);
        }
        mesh
    }
}
