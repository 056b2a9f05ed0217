//! Monte-Carlo diffraction points on the objects around the sensor.
//!
//! Each object's triangles are importance sampled through the inverse of a
//! cumulative distribution built from their curvature-driven importance values.
//! A sampled triangle becomes a diffraction point when it is small enough, in
//! range, inside the field of view, optionally visible from the sensor, and seen
//! edge-on or from behind by at least one emitter.

use std::time::Instant;

use rand::Rng;

use crate::config::{FieldOfView, SonoTraceDesc};
use crate::math::{Vec3, angles_from_direction, interpolate};
use crate::output::{PointKind, ReflectedPoint, StrengthMatrix, SubOutput};
use crate::propagation::{
    CENTIMETRES_PER_METRE, PropagationInputs, absorption_loss, angle_between_degrees,
    mean_square, spreading_loss,
};
use crate::scene::{
    MeshAcousticData, Mobility, PersistentPrimitiveId, SceneGeometry, SceneRegistry,
};

/// Weight of the per-triangle noise that breaks ties in the distribution.
const IMPORTANCE_NOISE: f32 = 1e-5;
/// Squared distances (cm²) below this are treated as coincident.
const MIN_DISTANCE_SQUARED: f32 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffractionSettings {
    /// Triangles drawn per object
    pub sample_count: usize,
    /// Triangles with this area (cm²) or more never diffract
    pub size_threshold: f32,
    pub max_distance: f32,
    /// Points must exceed this summed strength to be kept
    pub min_strength: f32,
    pub requires_line_of_sight: bool,
    pub include_dynamic: bool,
    pub field_of_view: FieldOfView,
}

impl DiffractionSettings {
    /// Draws `ceil(|initial_rays| / division_factor)` samples per object.
    pub fn from_desc(desc: &SonoTraceDesc) -> Self {
        let rays = desc.initial_rays.unsigned_abs() as f32;
        Self {
            sample_count: (rays / desc.diffraction_division_factor).ceil() as usize,
            size_threshold: desc.diffraction_triangle_size_threshold,
            max_distance: desc.max_ray_distance,
            min_strength: desc.diffraction_min_strength,
            requires_line_of_sight: desc.diffraction_requires_line_of_sight,
            include_dynamic: desc.diffraction_for_dynamic_objects,
            field_of_view: desc.field_of_view,
        }
    }
}

/// Objects that take part in diffraction this cycle.
///
/// `hit_objects` are the objects rays hit; without them every instance whose
/// bounds overlap the sensor's range is considered. Only objects with acoustic
/// data qualify, and dynamic ones only when enabled.
pub fn select_diffraction_objects(
    hit_objects: Option<&[PersistentPrimitiveId]>,
    registry: &SceneRegistry,
    geometry: &SceneGeometry,
    inputs: &PropagationInputs<'_>,
    settings: &DiffractionSettings,
) -> Vec<PersistentPrimitiveId> {
    let candidates: Vec<PersistentPrimitiveId> = match hit_objects {
        Some(ids) => ids.to_vec(),
        None => geometry
            .instances_within(inputs.sensor.position, settings.max_distance)
            .map(|instance| instance.persistent_id)
            .collect(),
    };

    candidates
        .into_iter()
        .filter(|&id| registry.mesh_data_for(id).is_some())
        .filter(|&id| {
            settings.include_dynamic
                || geometry
                    .scene_index_of(id)
                    .and_then(|index| geometry.instance(index))
                    .is_none_or(|instance| instance.mobility == Mobility::Static)
        })
        .collect()
}

/// Samples and evaluates diffraction points on `objects`.
pub fn simulate_diffraction<R: Rng + ?Sized>(
    objects: &[PersistentPrimitiveId],
    registry: &SceneRegistry,
    geometry: &SceneGeometry,
    inputs: &PropagationInputs<'_>,
    settings: &DiffractionSettings,
    rng: &mut R,
) -> SubOutput {
    let started = Instant::now();
    let mut points = Vec::new();

    for &id in objects {
        let Some(data) = registry.mesh_data_for(id) else {
            log::debug!("{} has no acoustic data, skipping diffraction", id);
            continue;
        };
        let Some(identity) = registry.resolve_identity(id) else {
            log::warn!("{} has acoustic data but no identity, skipping diffraction", id);
            continue;
        };
        let Some(pose) = geometry
            .scene_index_of(id)
            .and_then(|index| geometry.instance(index))
            .map(|instance| instance.pose)
            .or_else(|| registry.instance_pose(id))
        else {
            continue;
        };
        let diffraction_strengths = &registry
            .profiles()
            .get_or_default(identity.object_type)
            .material_strengths_diffraction;

        for triangle in sample_triangles(data, settings.sample_count, rng) {
            let location = pose.transform_point(data.triangle_centroids[triangle]);
            let to_point = location - inputs.sensor.position;
            let distance_squared = to_point.length_squared();
            if distance_squared > settings.max_distance * settings.max_distance
                || distance_squared <= MIN_DISTANCE_SQUARED
                || data.triangle_sizes[triangle] >= settings.size_threshold
            {
                continue;
            }

            let (azimuth, elevation) =
                angles_from_direction(inputs.sensor.unrotate(to_point.normalize()));
            if !settings
                .field_of_view
                .covers_degrees(azimuth.to_degrees(), elevation.to_degrees())
            {
                continue;
            }

            if settings.requires_line_of_sight
                && !geometry.has_line_of_sight(inputs.sensor.position, location, Some(id))
            {
                continue;
            }

            let normal = pose.rotate(data.triangle_normals[triangle]);
            let Some(mut point) = evaluate_point(location, normal, diffraction_strengths, inputs)
            else {
                continue;
            };
            if point.summed_strength <= settings.min_strength {
                continue;
            }

            let distance_to_sensor = distance_squared.sqrt();
            point.label = identity.label.clone();
            point.object_type = Some(identity.object_type);
            point.persistent_id = Some(id);
            point.is_last_hit = true;
            point.total_distance = distance_to_sensor;
            point.distance_to_sensor = distance_to_sensor;
            point.curvature = data.triangle_curvatures[triangle];
            point.surface_brdf = data.triangle_brdf[triangle].clone();
            point.surface_material = data.triangle_material[triangle].clone();
            points.push(point);
        }
    }

    log::debug!(
        "Diffraction: {} points on {} objects in {:?}",
        points.len(),
        objects.len(),
        started.elapsed()
    );
    SubOutput::from_points(points, objects.to_vec())
}

/// Triangle indexes drawn in proportion to their importance.
fn sample_triangles<R: Rng + ?Sized>(
    data: &MeshAcousticData,
    count: usize,
    rng: &mut R,
) -> Vec<usize> {
    let triangles = data.importance_values.len();
    if triangles == 0 || count == 0 {
        return Vec::new();
    }
    if triangles == 1 {
        return vec![data.importance_order[0]; count];
    }

    let mut cumulative = 0.0;
    let mut cdf: Vec<f32> = data
        .importance_values
        .iter()
        .map(|&value| {
            cumulative += value + IMPORTANCE_NOISE * rng.r#gen::<f32>();
            cumulative
        })
        .collect();
    let max = cdf.iter().copied().fold(f32::MIN, f32::max);
    if max > 0.0 {
        cdf.iter_mut().for_each(|v| *v /= max);
    }

    let positions: Vec<f32> = (0..triangles).map(|i| i as f32).collect();
    let uniform: Vec<f32> = (0..count).map(|_| rng.r#gen::<f32>()).collect();
    interpolate(&cdf, &positions, &uniform)
        .into_iter()
        .filter_map(|position| data.importance_order.get(position.round() as usize).copied())
        .collect()
}

/// Strengths of a candidate point, `None` when no emitter sees it edge-on or from behind.
fn evaluate_point(
    location: Vec3,
    normal: Vec3,
    diffraction_strengths: &[f32],
    inputs: &PropagationInputs<'_>,
) -> Option<ReflectedPoint> {
    let mut reflection_direction = Vec3::ZERO;
    let mut distances_from_emitters = vec![0.0; inputs.emitter_count()];
    let mut valid = false;

    for (emitter_index, &emitter) in inputs.emitter_positions.iter().enumerate() {
        let incoming = location - emitter;
        let distance = incoming.length();
        let unit = if distance > f32::EPSILON {
            incoming / distance
        } else {
            Vec3::ZERO
        };
        // the recorded direction always follows the first emitter
        if emitter_index == 0 {
            reflection_direction = unit;
        }
        if angle_between_degrees(normal, unit) > 90.0 {
            valid = true;
            distances_from_emitters[emitter_index] = distance;
        }
    }
    if !valid {
        return None;
    }

    let mut point = ReflectedPoint::new(PointKind::Diffraction, location, "");
    point.reflection_direction = reflection_direction;
    point.distances_from_emitters = distances_from_emitters;
    point.strengths = StrengthMatrix::zeros(
        inputs.emitter_count(),
        inputs.receiver_count(),
        inputs.frequency_count(),
    );
    point.distances_to_receivers = vec![vec![0.0; inputs.receiver_count()]; inputs.emitter_count()];

    let mut sum_of_squares = 0.0;
    let mut computed = 0;
    for (emitter_index, &emitter) in inputs.emitter_positions.iter().enumerate() {
        let to_emitter = emitter.distance(location);
        for (receiver_index, receiver) in inputs.receivers.iter().enumerate() {
            if receiver.position.is_nan() {
                continue;
            }
            let path = to_emitter + receiver.position.distance(location);
            point.distances_to_receivers[emitter_index][receiver_index] = path;
            let metres = path / CENTIMETRES_PER_METRE;
            let spreading = spreading_loss(metres);
            for (frequency_index, &frequency) in inputs.frequencies.iter().enumerate() {
                let material = diffraction_strengths
                    .get(frequency_index)
                    .copied()
                    .unwrap_or(0.0);
                let strength = material * spreading * absorption_loss(frequency, metres);
                point
                    .strengths
                    .set(emitter_index, receiver_index, frequency_index, strength);
                sum_of_squares += strength * strength;
                computed += 1;
            }
        }
    }
    point.summed_strength = mean_square(sum_of_squares, computed);
    Some(point)
}
