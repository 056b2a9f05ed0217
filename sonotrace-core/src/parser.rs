//! Turns a raw hit readback into labelled reflection points.

use std::collections::HashSet;

use crate::math::{Pose, Vec3};
use crate::output::{PointKind, ReflectedPoint};
use crate::propagation::directivity;
use crate::scene::{ObjectIdentity, PersistentPrimitiveId, SceneGeometry, SceneRegistry};
use crate::trace::{RawHit, ReadbackView};

/// Line of sight from the sensor to one receiver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectPathSight {
    pub line_of_sight: bool,
    /// First obstruction on the way, NaN when the path is clear
    pub obstruction: Vec3,
}

impl DirectPathSight {
    fn clear() -> Self {
        Self {
            line_of_sight: true,
            obstruction: Vec3::NAN,
        }
    }

    fn blocked(obstruction: Vec3) -> Self {
        Self {
            line_of_sight: false,
            obstruction,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedHits {
    pub points: Vec<ReflectedPoint>,
    /// Objects with a hit the sensor can hear, in first-hit order
    pub hit_objects: Vec<PersistentPrimitiveId>,
    pub direct_path: Vec<DirectPathSight>,
    /// Identities created lazily while parsing
    pub new_identities: Vec<(PersistentPrimitiveId, ObjectIdentity)>,
}

/// Cycle parameters the parser interprets the readback with.
#[derive(Debug, Clone, Copy)]
pub struct ParseContext<'a> {
    pub num_distribution_rays: usize,
    pub num_direct_path_rays: usize,
    pub max_bounces: usize,
    pub max_ray_distance: f32,
    pub sensor: Pose,
    /// World emitter positions
    pub emitter_positions: &'a [Vec3],
    pub emitter_directivities: Option<&'a [f32]>,
    /// World receiver positions, one per direct-path ray
    pub receiver_positions: &'a [Vec3],
}

#[derive(Default)]
struct Inconsistencies {
    unknown_objects: usize,
    triangles_out_of_range: usize,
    missing_rows: usize,
}

pub struct HitParser<'a> {
    context: ParseContext<'a>,
}

impl<'a> HitParser<'a> {
    pub fn new(context: ParseContext<'a>) -> Self {
        Self { context }
    }

    /// Walks every ray's bounce chain and the direct-path rows.
    ///
    /// Rows that cannot be resolved are labelled `UNKNOWN` or fall back to
    /// default surface values; nothing here aborts the cycle.
    pub fn parse(
        &self,
        view: &ReadbackView<'_>,
        geometry: &SceneGeometry,
        registry: &mut SceneRegistry,
    ) -> ParsedHits {
        let mut parsed = ParsedHits::default();
        let mut issues = Inconsistencies::default();
        let mut seen_objects = HashSet::new();
        let ctx = &self.context;

        for ray in 0..ctx.num_distribution_rays {
            let mut last_point = None;
            let mut directivities = vec![1.0; ctx.emitter_positions.len()];

            for bounce in 0..ctx.max_bounces {
                let Some(row) = view.row(ray * ctx.max_bounces + bounce) else {
                    issues.missing_rows += 1;
                    break;
                };
                if !row.is_hit() {
                    break;
                }

                if !row.has_line_of_sight() {
                    continue;
                }

                let id = scene_instance_id(geometry, row);
                if let Some(id) = id {
                    if seen_objects.insert(id) {
                        parsed.hit_objects.push(id);
                    }
                }
                if bounce == 0 {
                    directivities = self.emitter_directivities_towards(row.position());
                }

                let point = self.build_point(
                    row,
                    ray,
                    bounce,
                    id,
                    &directivities,
                    registry,
                    &mut parsed,
                    &mut issues,
                );
                parsed.points.push(point);
                last_point = Some(parsed.points.len() - 1);
            }

            if let Some(index) = last_point {
                parsed.points[index].is_last_hit = true;
            }
        }

        parsed.direct_path = self.parse_direct_path(view, &mut issues);
        report(&issues);
        parsed
    }

    fn emitter_directivities_towards(&self, hit: Vec3) -> Vec<f32> {
        let ctx = &self.context;
        match ctx.emitter_directivities {
            Some(blends) => ctx
                .emitter_positions
                .iter()
                .zip(blends)
                .map(|(&emitter, &blend)| {
                    directivity(blend, ctx.sensor.forward(), (hit - emitter).normalize_or_zero())
                })
                .collect(),
            None => vec![1.0; ctx.emitter_positions.len()],
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_point(
        &self,
        row: &RawHit,
        ray: usize,
        bounce: usize,
        id: Option<PersistentPrimitiveId>,
        directivities: &[f32],
        registry: &mut SceneRegistry,
        parsed: &mut ParsedHits,
        issues: &mut Inconsistencies,
    ) -> ReflectedPoint {
        let ctx = &self.context;
        let identity = match id {
            Some(id) => resolve_identity(id, registry, parsed),
            None => None,
        };
        let (identity, id) = match identity {
            Some(identity) => (identity, id),
            None => {
                issues.unknown_objects += 1;
                (ObjectIdentity::unknown(), None)
            }
        };

        let fallback = registry.profiles().get_or_default(identity.object_type);
        let mut curvature = 0.0;
        let mut brdf = fallback.default_triangle_brdf.clone();
        let mut material = fallback.default_triangle_material.clone();
        if let Some(data) = id.and_then(|id| registry.mesh_data_for(id)) {
            match usize::try_from(row.triangle_index)
                .ok()
                .filter(|&t| t < data.triangle_count())
            {
                Some(triangle) => {
                    curvature = data.triangle_curvatures[triangle];
                    brdf.clone_from(&data.triangle_brdf[triangle]);
                    material.clone_from(&data.triangle_material[triangle]);
                }
                None => issues.triangles_out_of_range += 1,
            }
        }

        let emitter_count = ctx.emitter_positions.len().min(row.emitter_distances.len());
        let mut point = ReflectedPoint::new(PointKind::Specular, row.position(), identity.label);
        point.reflection_direction = row.reflection();
        point.object_type = Some(identity.object_type);
        point.persistent_id = id;
        point.ray_index = ray;
        point.bounce_index = bounce;
        point.total_distance = row.cumulative_distance;
        point.distance_to_sensor = row.position().distance(ctx.sensor.position);
        point.distances_from_emitters = row.emitter_distances[..emitter_count].to_vec();
        point.curvature = curvature;
        point.surface_brdf = brdf;
        point.surface_material = material;
        point.emitter_directivities = directivities.to_vec();
        point
    }

    fn parse_direct_path(
        &self,
        view: &ReadbackView<'_>,
        issues: &mut Inconsistencies,
    ) -> Vec<DirectPathSight> {
        let ctx = &self.context;
        (0..ctx.num_direct_path_rays)
            .map(|receiver| {
                let Some(&receiver_position) = ctx.receiver_positions.get(receiver) else {
                    return DirectPathSight::blocked(Vec3::NAN);
                };
                let expected = ctx.sensor.position.distance(receiver_position);
                let row_index = (ctx.num_distribution_rays + receiver) * ctx.max_bounces;
                match view.row(row_index) {
                    None => {
                        issues.missing_rows += 1;
                        DirectPathSight::blocked(Vec3::NAN)
                    }
                    // backends write every direct-path row as a hit; a miss
                    // row means nothing was in range
                    Some(row) if !row.is_hit() || row.is_direct_path() => {
                        if expected < 2.0 * ctx.max_ray_distance {
                            DirectPathSight::clear()
                        } else {
                            DirectPathSight::blocked(Vec3::NAN)
                        }
                    }
                    Some(row) if expected < row.cumulative_distance => DirectPathSight::clear(),
                    Some(row) => DirectPathSight::blocked(row.position()),
                }
            })
            .collect()
    }
}

fn scene_instance_id(geometry: &SceneGeometry, row: &RawHit) -> Option<PersistentPrimitiveId> {
    let index = usize::try_from(row.scene_primitive_index).ok()?;
    geometry.instance(index).map(|i| i.persistent_id)
}

fn resolve_identity(
    id: PersistentPrimitiveId,
    registry: &mut SceneRegistry,
    parsed: &mut ParsedHits,
) -> Option<ObjectIdentity> {
    if let Some(identity) = registry.resolve_identity(id) {
        return Some(identity.clone());
    }
    let identity = registry.passive_identity(id)?;
    log::info!("Identified {} as '{}' on first hit", id, identity.label);
    registry.register_identity(id, identity.clone());
    parsed.new_identities.push((id, identity.clone()));
    Some(identity)
}

fn report(issues: &Inconsistencies) {
    if issues.unknown_objects > 0 {
        log::warn!(
            "{} hits could not be resolved to a registered object",
            issues.unknown_objects
        );
    }
    if issues.triangles_out_of_range > 0 {
        log::warn!(
            "{} hits reference triangles outside their mesh data, default surface values used",
            issues.triangles_out_of_range
        );
    }
    if issues.missing_rows > 0 {
        log::warn!("{} rows missing from the readback", issues.missing_rows);
    }
}
