//! Per-triangle acoustic tables derived once per mesh resource.

use crate::config::{CurvatureSettings, ResolvedProfile};
use crate::error::{Result, SonoTraceError};
use crate::math::Vec3;
use crate::scene::mesh::TriangleMesh;

/// Acoustic description of a mesh, shared by every instance of the resource.
///
/// All geometric values are in the mesh's local frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshAcousticData {
    pub triangle_centroids: Vec<Vec3>,
    pub triangle_normals: Vec<Vec3>,
    /// Triangle area (cm²)
    pub triangle_sizes: Vec<f32>,
    pub triangle_curvatures: Vec<f32>,
    /// BRDF exponent per triangle, per frequency
    pub triangle_brdf: Vec<Vec<f32>>,
    /// Material strength per triangle, per frequency
    pub triangle_material: Vec<Vec<f32>>,
    /// Normalised diffraction importance, ascending
    pub importance_values: Vec<f32>,
    /// Triangle index for each entry of `importance_values`
    pub importance_order: Vec<usize>,
}

impl MeshAcousticData {
    /// Builds the tables for `mesh` under `profile`.
    ///
    /// # Errors
    ///
    /// Returns an error if the mesh has no triangles
    pub fn from_mesh(
        mesh: &TriangleMesh,
        profile: &ResolvedProfile,
        curvature: &CurvatureSettings,
        diffraction_size_threshold: f32,
    ) -> Result<Self> {
        if mesh.is_empty() {
            return Err(SonoTraceError::InvalidMesh(
                "Cannot derive acoustic data from a mesh without triangles".into(),
            ));
        }

        let vertex_curvatures = vertex_mean_curvatures(mesh);
        let vertex_normals = mesh.vertex_normals();
        let triangle_count = mesh.triangle_count();

        let mut data = Self {
            triangle_centroids: Vec::with_capacity(triangle_count),
            triangle_normals: Vec::with_capacity(triangle_count),
            triangle_sizes: Vec::with_capacity(triangle_count),
            triangle_curvatures: Vec::with_capacity(triangle_count),
            triangle_brdf: Vec::with_capacity(triangle_count),
            triangle_material: Vec::with_capacity(triangle_count),
            importance_values: Vec::new(),
            importance_order: Vec::new(),
        };

        for &[ia, ib, ic] in mesh.triangles() {
            let (ia, ib, ic) = (ia as usize, ib as usize, ic as usize);
            let positions = mesh.positions();
            let (a, b, c) = (positions[ia], positions[ib], positions[ic]);

            let cross = (b - a).cross(c - a);
            let area = cross.length() * 0.5;
            let mut normal = cross.normalize_or_zero();
            if let Some(normals) = vertex_normals {
                if normal.dot(normals[ia]) < 0.0 {
                    normal = -normal;
                }
            }

            let corner = [
                vertex_curvatures[ia],
                vertex_curvatures[ib],
                vertex_curvatures[ic],
            ];
            let spread = corner.iter().copied().fold(f32::MIN, f32::max)
                - corner.iter().copied().fold(f32::MAX, f32::min);
            let size_effect = curvature
                .size_scaler
                .map(|s| s.effect(area, diffraction_size_threshold))
                .unwrap_or(1.0);
            let triangle_curvature = spread * size_effect * curvature.scale;

            data.triangle_centroids.push((a + b + c) / 3.0);
            data.triangle_normals.push(normal);
            data.triangle_sizes.push(area);
            data.triangle_curvatures.push(triangle_curvature);
            data.triangle_brdf.push(
                (0..profile.frequency_count())
                    .map(|f| profile.surface_brdf(triangle_curvature, f))
                    .collect(),
            );
            data.triangle_material.push(
                (0..profile.frequency_count())
                    .map(|f| profile.surface_material(triangle_curvature, f))
                    .collect(),
            );
        }

        data.build_importance();
        Ok(data)
    }

    /// Sharper triangles (higher first-band BRDF) get higher importance.
    fn build_importance(&mut self) {
        let mut values: Vec<f32> = self
            .triangle_brdf
            .iter()
            .map(|brdf| brdf.first().copied().unwrap_or(0.0))
            .collect();

        let min = values.iter().copied().fold(f32::MAX, f32::min);
        values.iter_mut().for_each(|v| *v -= min);
        let max = values.iter().copied().fold(0.0, f32::max);
        if max > 0.0 {
            values.iter_mut().for_each(|v| *v /= max);
        }
        values.iter_mut().for_each(|v| *v = v.powi(4));

        let min = values.iter().copied().fold(f32::MAX, f32::min);
        let max = values.iter().copied().fold(f32::MIN, f32::max);
        let range = max - min;
        if range > 0.0 {
            values.iter_mut().for_each(|v| *v = (*v - min) / range);
        }

        let mut order: Vec<usize> = (0..values.len()).collect();
        order.sort_by(|&a, &b| values[a].total_cmp(&values[b]).then(a.cmp(&b)));
        self.importance_values = order.iter().map(|&i| values[i]).collect();
        self.importance_order = order;
    }

    pub fn triangle_count(&self) -> usize {
        self.triangle_centroids.len()
    }

    pub fn max_curvature(&self) -> f32 {
        self.triangle_curvatures.iter().copied().fold(0.0, f32::max)
    }
}

/// Mean curvature magnitude per vertex from the cotangent Laplacian.
fn vertex_mean_curvatures(mesh: &TriangleMesh) -> Vec<f32> {
    let positions = mesh.positions();
    let mut laplacian = vec![Vec3::ZERO; positions.len()];
    let mut areas = vec![0.0_f32; positions.len()];

    let cotangent = |apex: Vec3, p: Vec3, q: Vec3| {
        let (u, v) = (p - apex, q - apex);
        let sine = u.cross(v).length();
        if sine <= f32::EPSILON {
            0.0
        } else {
            u.dot(v) / sine
        }
    };

    for &[a, b, c] in mesh.triangles() {
        let corners = [a as usize, b as usize, c as usize];
        let (pa, pb, pc) = (positions[corners[0]], positions[corners[1]], positions[corners[2]]);
        let area = (pb - pa).cross(pc - pa).length() * 0.5;

        for k in 0..3 {
            let apex = corners[k];
            let i = corners[(k + 1) % 3];
            let j = corners[(k + 2) % 3];
            let weight = cotangent(positions[apex], positions[i], positions[j]);
            let edge = positions[i] - positions[j];
            laplacian[i] += weight * edge;
            laplacian[j] -= weight * edge;
            areas[apex] += area / 3.0;
        }
    }

    laplacian
        .iter()
        .zip(&areas)
        .map(|(l, &area)| {
            if area <= f32::EPSILON {
                0.0
            } else {
                (*l / (2.0 * area)).length() * 0.5
            }
        })
        .collect()
}
