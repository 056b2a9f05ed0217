use std::time::Instant;

use rayon::prelude::*;

use crate::output::{ReflectedPoint, StrengthMatrix, SubOutput};
use crate::propagation::{
    CENTIMETRES_PER_METRE, PropagationInputs, absorption_loss, angle_between_degrees, brdf_lobe,
    directivity, mean_square, spreading_loss,
};
use crate::scene::PersistentPrimitiveId;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpecularSettings {
    /// Only the terminal hit of each ray is simulated
    pub only_last_hits: bool,
    /// Points whose summed strength falls below this are discarded
    pub min_strength: f32,
}

impl Default for SpecularSettings {
    fn default() -> Self {
        Self {
            only_last_hits: false,
            min_strength: 0.0,
        }
    }
}

/// Computes specular strengths for the points found by the hit parser.
///
/// Per-point results are independent, so the pass runs in parallel over
/// pre-sized points; the minimum-strength filter is applied afterwards.
pub fn simulate_specular(
    points: Vec<ReflectedPoint>,
    hit_objects: Vec<PersistentPrimitiveId>,
    inputs: &PropagationInputs<'_>,
    settings: &SpecularSettings,
) -> SubOutput {
    let started = Instant::now();

    let mut points: Vec<ReflectedPoint> = if settings.only_last_hits {
        points.into_iter().filter(|p| p.is_last_hit).collect()
    } else {
        points
    };

    let (emitters, receivers, frequencies) = (
        inputs.emitter_count(),
        inputs.receiver_count(),
        inputs.frequency_count(),
    );
    for point in &mut points {
        point.strengths = StrengthMatrix::zeros(emitters, receivers, frequencies);
        point.distances_to_receivers = vec![vec![0.0; receivers]; emitters];
    }

    points
        .par_iter_mut()
        .for_each(|point| compute_point(point, inputs));

    let computed = points.len();
    points.retain(|p| p.summed_strength >= settings.min_strength);
    log::debug!(
        "Specular: {} of {} points kept in {:?}",
        points.len(),
        computed,
        started.elapsed()
    );

    SubOutput::from_points(points, hit_objects)
}

fn compute_point(point: &mut ReflectedPoint, inputs: &PropagationInputs<'_>) {
    let mut sum_of_squares = 0.0;
    let mut computed = 0;

    for (receiver_index, receiver) in inputs.receivers.iter().enumerate() {
        if receiver.position.is_nan() {
            continue;
        }
        let to_receiver = (receiver.position - point.location).normalize_or_zero();
        let receiver_gain = inputs
            .receiver_directivities
            .and_then(|blends| blends.get(receiver_index))
            .map_or(1.0, |&blend| directivity(blend, receiver.forward(), -to_receiver));
        let angle = angle_between_degrees(point.reflection_direction, to_receiver);
        let leg = point.location.distance(receiver.position);

        for emitter_index in 0..inputs.emitter_count() {
            let source_gain = point
                .emitter_directivities
                .get(emitter_index)
                .copied()
                .unwrap_or(1.0);
            let path = point
                .distances_from_emitters
                .get(emitter_index)
                .copied()
                .unwrap_or(point.total_distance)
                + leg;
            point.distances_to_receivers[emitter_index][receiver_index] = path;

            let metres = path / CENTIMETRES_PER_METRE;
            let spreading = spreading_loss(metres);
            for (frequency_index, &frequency) in inputs.frequencies.iter().enumerate() {
                let (Some(&brdf), Some(&material)) = (
                    point.surface_brdf.get(frequency_index),
                    point.surface_material.get(frequency_index),
                ) else {
                    continue;
                };
                let strength = brdf_lobe(angle, brdf)
                    * material
                    * spreading
                    * absorption_loss(frequency, metres)
                    * receiver_gain
                    * source_gain;
                point
                    .strengths
                    .set(emitter_index, receiver_index, frequency_index, strength);
                sum_of_squares += strength * strength;
                computed += 1;
            }
        }
    }

    point.summed_strength = mean_square(sum_of_squares, computed);
}
