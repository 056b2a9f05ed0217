use crate::error::{Result, SonoTraceError};
use crate::math::Vec3;

/// Indexed triangle mesh in its local frame (cm).
#[derive(Debug, Clone, PartialEq)]
pub struct TriangleMesh {
    positions: Vec<Vec3>,
    triangles: Vec<[u32; 3]>,
    vertex_normals: Option<Vec<Vec3>>,
}

impl TriangleMesh {
    /// # Errors
    ///
    /// Returns an error if a triangle references a missing vertex or a position
    /// is not finite
    pub fn new(positions: Vec<Vec3>, triangles: Vec<[u32; 3]>) -> Result<Self> {
        if let Some(bad) = positions.iter().position(|p| !p.is_finite()) {
            return Err(SonoTraceError::InvalidMesh(format!(
                "Vertex {} is not finite",
                bad
            )));
        }
        let vertex_count = positions.len();
        if let Some((index, triangle)) = triangles
            .iter()
            .enumerate()
            .find(|(_, t)| t.iter().any(|&v| v as usize >= vertex_count))
        {
            return Err(SonoTraceError::InvalidMesh(format!(
                "Triangle {} references {:?} but the mesh has {} vertices",
                index, triangle, vertex_count
            )));
        }
        Ok(Self {
            positions,
            triangles,
            vertex_normals: None,
        })
    }

    /// Attaches authored vertex normals, used to orient triangle normals.
    pub fn with_vertex_normals(mut self, normals: Vec<Vec3>) -> Result<Self> {
        if normals.len() != self.positions.len() {
            return Err(SonoTraceError::InvalidMesh(format!(
                "{} vertex normals for {} vertices",
                normals.len(),
                self.positions.len()
            )));
        }
        self.vertex_normals = Some(normals);
        Ok(self)
    }

    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    pub fn triangles(&self) -> &[[u32; 3]] {
        &self.triangles
    }

    pub fn vertex_normals(&self) -> Option<&[Vec3]> {
        self.vertex_normals.as_deref()
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }

    /// Corner positions of triangle `index`.
    pub fn triangle(&self, index: usize) -> Option<[Vec3; 3]> {
        let [a, b, c] = *self.triangles.get(index)?;
        Some([
            self.positions[a as usize],
            self.positions[b as usize],
            self.positions[c as usize],
        ])
    }

    /// Local-space bounding sphere as `(center, radius)`.
    pub fn bounding_sphere(&self) -> (Vec3, f32) {
        if self.positions.is_empty() {
            return (Vec3::ZERO, 0.0);
        }
        let (min, max) = self.positions.iter().fold(
            (Vec3::splat(f32::MAX), Vec3::splat(f32::MIN)),
            |(min, max), &p| (min.min(p), max.max(p)),
        );
        let center = (min + max) * 0.5;
        let radius = self
            .positions
            .iter()
            .map(|p| p.distance(center))
            .fold(0.0, f32::max);
        (center, radius)
    }

    /// Square in the XY plane centred on the origin, facing +Z.
    pub fn plane(width: f32, depth: f32) -> Self {
        let (hw, hd) = (width * 0.5, depth * 0.5);
        Self {
            positions: vec![
                Vec3::new(-hw, -hd, 0.0),
                Vec3::new(hw, -hd, 0.0),
                Vec3::new(hw, hd, 0.0),
                Vec3::new(-hw, hd, 0.0),
            ],
            triangles: vec![[0, 1, 2], [0, 2, 3]],
            vertex_normals: Some(vec![Vec3::Z; 4]),
        }
    }

    /// Axis-aligned box with shared corner vertices and outward winding.
    pub fn cuboid(half_extents: Vec3) -> Self {
        let h = half_extents;
        let positions = vec![
            Vec3::new(-h.x, -h.y, -h.z),
            Vec3::new(h.x, -h.y, -h.z),
            Vec3::new(h.x, h.y, -h.z),
            Vec3::new(-h.x, h.y, -h.z),
            Vec3::new(-h.x, -h.y, h.z),
            Vec3::new(h.x, -h.y, h.z),
            Vec3::new(h.x, h.y, h.z),
            Vec3::new(-h.x, h.y, h.z),
        ];
        let triangles = vec![
            [0, 2, 1],
            [0, 3, 2],
            [4, 5, 6],
            [4, 6, 7],
            [0, 1, 5],
            [0, 5, 4],
            [1, 2, 6],
            [1, 6, 5],
            [2, 3, 7],
            [2, 7, 6],
            [3, 0, 4],
            [3, 4, 7],
        ];
        let vertex_normals = positions.iter().map(|p| p.normalize_or_zero()).collect();
        Self {
            positions,
            triangles,
            vertex_normals: Some(vertex_normals),
        }
    }

    /// Latitude/longitude sphere with outward winding.
    pub fn uv_sphere(radius: f32, segments: u32, rings: u32) -> Self {
        let segments = segments.max(3);
        let rings = rings.max(2);
        let mut positions = Vec::new();

        positions.push(Vec3::new(0.0, 0.0, radius));
        for ring in 1..rings {
            let polar = std::f32::consts::PI * ring as f32 / rings as f32;
            for segment in 0..segments {
                let azimuth = std::f32::consts::TAU * segment as f32 / segments as f32;
                positions.push(
                    Vec3::new(
                        polar.sin() * azimuth.cos(),
                        polar.sin() * azimuth.sin(),
                        polar.cos(),
                    ) * radius,
                );
            }
        }
        positions.push(Vec3::new(0.0, 0.0, -radius));

        let south = positions.len() as u32 - 1;
        let ring_start = |ring: u32| 1 + (ring - 1) * segments;
        let mut triangles = Vec::new();
        for segment in 0..segments {
            let next = (segment + 1) % segments;
            triangles.push([0, ring_start(1) + segment, ring_start(1) + next]);
        }
        for ring in 1..rings - 1 {
            let (upper, lower) = (ring_start(ring), ring_start(ring + 1));
            for segment in 0..segments {
                let next = (segment + 1) % segments;
                triangles.push([upper + segment, lower + segment, lower + next]);
                triangles.push([upper + segment, lower + next, upper + next]);
            }
        }
        let last = ring_start(rings - 1);
        for segment in 0..segments {
            let next = (segment + 1) % segments;
            triangles.push([south, last + next, last + segment]);
        }

        let vertex_normals = positions.iter().map(|p| p.normalize_or_zero()).collect();
        Self {
            positions,
            triangles,
            vertex_normals: Some(vertex_normals),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outward(mesh: &TriangleMesh) -> bool {
        (0..mesh.triangle_count()).all(|i| {
            let Some([a, b, c]) = mesh.triangle(i) else {
                return false;
            };
            let normal = (b - a).cross(c - a);
            normal.dot((a + b + c) / 3.0) > 0.0
        })
    }

    #[test]
    fn test_new_rejects_bad_indices() {
        let positions = vec![Vec3::ZERO, Vec3::X, Vec3::Y];
        assert!(TriangleMesh::new(positions.clone(), vec![[0, 1, 2]]).is_ok());
        assert!(TriangleMesh::new(positions.clone(), vec![[0, 1, 3]]).is_err());
        assert!(TriangleMesh::new(vec![Vec3::NAN], vec![]).is_err());

        let mesh = TriangleMesh::new(positions, vec![[0, 1, 2]]).unwrap();
        assert!(mesh.clone().with_vertex_normals(vec![Vec3::Z]).is_err());
        assert!(mesh.with_vertex_normals(vec![Vec3::Z; 3]).is_ok());
    }

    #[test]
    fn test_cuboid() {
        let mesh = TriangleMesh::cuboid(Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(mesh.vertex_count(), 8);
        assert_eq!(mesh.triangle_count(), 12);
        assert!(outward(&mesh));
        let (center, radius) = mesh.bounding_sphere();
        assert_eq!(center, Vec3::ZERO);
        assert!((radius - 14.0_f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn test_uv_sphere() {
        let mesh = TriangleMesh::uv_sphere(10.0, 12, 6);
        assert_eq!(mesh.vertex_count(), 2 + 12 * 5);
        assert_eq!(mesh.triangle_count(), 2 * 12 + 2 * 12 * 4);
        assert!(outward(&mesh));
        assert!(
            mesh.positions()
                .iter()
                .all(|p| (p.length() - 10.0).abs() < 1e-4)
        );
    }

    #[test]
    fn test_plane() {
        let mesh = TriangleMesh::plane(4.0, 2.0);
        assert_eq!(mesh.triangle_count(), 2);
        let [a, b, c] = mesh.triangle(0).unwrap();
        assert!((b - a).cross(c - a).normalize().abs_diff_eq(Vec3::Z, 1e-6));
        assert!(mesh.triangle(2).is_none());
    }
}
