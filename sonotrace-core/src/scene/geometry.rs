use std::sync::Arc;

use crate::math::{Pose, Vec3};
use crate::scene::mesh::TriangleMesh;
use crate::scene::{Mobility, PersistentPrimitiveId};

/// Möller–Trumbore determinant threshold.
const EPSILON: f32 = 1e-6;
/// Minimum hit distance (cm), keeps rays from re-hitting their origin surface.
const MIN_HIT_DISTANCE: f32 = 1e-3;

/// One placed mesh in a geometry snapshot.
#[derive(Debug, Clone)]
pub struct GeometryInstance {
    pub persistent_id: PersistentPrimitiveId,
    pub owner: String,
    pub resource: String,
    pub mesh: Arc<TriangleMesh>,
    pub pose: Pose,
    pub mobility: Mobility,
    bounds_center: Vec3,
    bounds_radius: f32,
}

impl GeometryInstance {
    pub fn new(
        persistent_id: PersistentPrimitiveId,
        owner: impl Into<String>,
        resource: impl Into<String>,
        mesh: Arc<TriangleMesh>,
        pose: Pose,
        mobility: Mobility,
    ) -> Self {
        let (local_center, radius) = mesh.bounding_sphere();
        Self {
            persistent_id,
            owner: owner.into(),
            resource: resource.into(),
            bounds_center: pose.transform_point(local_center),
            bounds_radius: radius,
            mesh,
            pose,
            mobility,
        }
    }

    pub fn bounds(&self) -> (Vec3, f32) {
        (self.bounds_center, self.bounds_radius)
    }

    fn may_intersect(&self, origin: Vec3, direction: Vec3, max_distance: f32) -> bool {
        let to_center = self.bounds_center - origin;
        let along = to_center.dot(direction);
        if along + self.bounds_radius < 0.0 || along - self.bounds_radius > max_distance {
            return false;
        }
        to_center.length_squared() - along * along <= self.bounds_radius * self.bounds_radius
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometryHit {
    pub distance: f32,
    pub position: Vec3,
    /// Unit geometric normal in world space, following the triangle winding
    pub normal: Vec3,
    pub scene_index: usize,
    pub triangle_index: usize,
}

/// Immutable snapshot of the traceable scene.
///
/// The position of an instance in the snapshot is its scene primitive index,
/// which is only valid for cycles traced against this snapshot.
#[derive(Debug, Clone, Default)]
pub struct SceneGeometry {
    instances: Vec<GeometryInstance>,
    generation: u64,
}

impl SceneGeometry {
    pub fn new(instances: Vec<GeometryInstance>, generation: u64) -> Self {
        Self {
            instances,
            generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn instances(&self) -> &[GeometryInstance] {
        &self.instances
    }

    pub fn instance(&self, scene_index: usize) -> Option<&GeometryInstance> {
        self.instances.get(scene_index)
    }

    pub fn scene_index_of(&self, id: PersistentPrimitiveId) -> Option<usize> {
        self.instances.iter().position(|i| i.persistent_id == id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Closest intersection along a unit `direction` within `max_distance`.
    pub fn cast_ray(&self, origin: Vec3, direction: Vec3, max_distance: f32) -> Option<GeometryHit> {
        self.cast_ray_ignoring(origin, direction, max_distance, None)
    }

    pub fn cast_ray_ignoring(
        &self,
        origin: Vec3,
        direction: Vec3,
        max_distance: f32,
        ignore: Option<PersistentPrimitiveId>,
    ) -> Option<GeometryHit> {
        let mut closest: Option<GeometryHit> = None;
        for (scene_index, instance) in self.instances.iter().enumerate() {
            if Some(instance.persistent_id) == ignore {
                continue;
            }
            let limit = closest.map_or(max_distance, |c| c.distance);
            if !instance.may_intersect(origin, direction, limit) {
                continue;
            }

            // rigid transforms keep distances, so local t equals world t
            let local_origin = instance.pose.inverse_transform_point(origin);
            let local_direction = instance.pose.unrotate(direction);
            let mesh = &instance.mesh;

            for triangle_index in 0..mesh.triangle_count() {
                let Some([a, b, c]) = mesh.triangle(triangle_index) else {
                    continue;
                };
                let Some(t) = ray_triangle_intersection(local_origin, local_direction, a, b, c)
                else {
                    continue;
                };
                if t < MIN_HIT_DISTANCE || t > closest.map_or(max_distance, |c| c.distance) {
                    continue;
                }
                let normal = instance.pose.rotate((b - a).cross(c - a)).normalize_or_zero();
                closest = Some(GeometryHit {
                    distance: t,
                    position: origin + direction * t,
                    normal,
                    scene_index,
                    triangle_index,
                });
            }
        }
        closest
    }

    /// Whether the segment `from → to` is free of geometry.
    pub fn has_line_of_sight(
        &self,
        from: Vec3,
        to: Vec3,
        ignore: Option<PersistentPrimitiveId>,
    ) -> bool {
        let delta = to - from;
        let distance = delta.length();
        if distance <= MIN_HIT_DISTANCE {
            return true;
        }
        let direction = delta / distance;
        self.cast_ray_ignoring(from, direction, distance - MIN_HIT_DISTANCE, ignore)
            .is_none()
    }

    /// Instances whose bounding sphere overlaps the sphere at `center`.
    pub fn instances_within(
        &self,
        center: Vec3,
        radius: f32,
    ) -> impl Iterator<Item = &GeometryInstance> + '_ {
        self.instances.iter().filter(move |instance| {
            let reach = radius + instance.bounds_radius;
            instance.bounds_center.distance_squared(center) <= reach * reach
        })
    }
}

/// Two-sided Möller–Trumbore test, returns the ray parameter of the hit.
pub fn ray_triangle_intersection(
    origin: Vec3,
    direction: Vec3,
    v0: Vec3,
    v1: Vec3,
    v2: Vec3,
) -> Option<f32> {
    let edge1 = v1 - v0;
    let edge2 = v2 - v0;
    let h = direction.cross(edge2);
    let a = edge1.dot(h);
    if a.abs() < EPSILON {
        return None;
    }
    let f = 1.0 / a;
    let s = origin - v0;
    let u = f * s.dot(h);
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(edge1);
    let v = f * direction.dot(q);
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = f * edge2.dot(q);
    (t > EPSILON).then_some(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wall_at(x: f32, id: u64) -> GeometryInstance {
        // plane faces +Z; yaw it to face the origin along -X
        let pose = Pose::from_euler_degrees(Vec3::new(x, 0.0, 0.0), 0.0, -90.0, 0.0);
        GeometryInstance::new(
            PersistentPrimitiveId(id),
            format!("wall{id}"),
            "plane",
            Arc::new(TriangleMesh::plane(100.0, 100.0)),
            pose,
            Mobility::Static,
        )
    }

    #[test]
    fn test_ray_triangle_intersection() {
        let (a, b, c) = (Vec3::ZERO, Vec3::X, Vec3::Y);
        let origin = Vec3::new(0.2, 0.2, 5.0);
        let t = ray_triangle_intersection(origin, -Vec3::Z, a, b, c).unwrap();
        assert!((t - 5.0).abs() < 1e-5);
        assert!(ray_triangle_intersection(origin, Vec3::Z, a, b, c).is_none());
        assert!(ray_triangle_intersection(origin, Vec3::X, a, b, c).is_none());
        assert!(ray_triangle_intersection(Vec3::new(2.0, 2.0, 5.0), -Vec3::Z, a, b, c).is_none());
    }

    #[test]
    fn test_cast_ray_finds_closest() {
        let scene = SceneGeometry::new(vec![wall_at(300.0, 2), wall_at(200.0, 1)], 0);
        let hit = scene.cast_ray(Vec3::ZERO, Vec3::X, 500.0).unwrap();
        assert!((hit.distance - 200.0).abs() < 1e-3);
        assert_eq!(hit.scene_index, 1);
        assert!(hit.position.abs_diff_eq(Vec3::new(200.0, 0.0, 0.0), 1e-3));
        assert!((hit.normal.dot(Vec3::X).abs() - 1.0).abs() < 1e-5);

        assert!(scene.cast_ray(Vec3::ZERO, Vec3::X, 150.0).is_none());
        assert!(scene.cast_ray(Vec3::ZERO, -Vec3::X, 500.0).is_none());

        let ignoring = scene
            .cast_ray_ignoring(Vec3::ZERO, Vec3::X, 500.0, Some(PersistentPrimitiveId(1)))
            .unwrap();
        assert_eq!(ignoring.scene_index, 0);
    }

    #[test]
    fn test_line_of_sight() {
        let scene = SceneGeometry::new(vec![wall_at(200.0, 1)], 0);
        assert!(scene.has_line_of_sight(Vec3::ZERO, Vec3::new(100.0, 0.0, 0.0), None));
        assert!(!scene.has_line_of_sight(Vec3::ZERO, Vec3::new(300.0, 0.0, 0.0), None));
        assert!(scene.has_line_of_sight(
            Vec3::ZERO,
            Vec3::new(300.0, 0.0, 0.0),
            Some(PersistentPrimitiveId(1))
        ));
        // a point on the wall itself is visible
        assert!(scene.has_line_of_sight(Vec3::ZERO, Vec3::new(200.0, 10.0, 0.0), None));
    }

    #[test]
    fn test_instances_within() {
        let scene = SceneGeometry::new(vec![wall_at(200.0, 1), wall_at(2_000.0, 2)], 0);
        let near: Vec<_> = scene
            .instances_within(Vec3::ZERO, 500.0)
            .map(|i| i.persistent_id)
            .collect();
        assert_eq!(near, vec![PersistentPrimitiveId(1)]);
        assert_eq!(scene.scene_index_of(PersistentPrimitiveId(2)), Some(1));
    }
}
