use crate::output::{PointKind, ReflectedPoint, StrengthMatrix, SubOutput};
use crate::propagation::{
    CENTIMETRES_PER_METRE, PropagationInputs, absorption_loss, mean_square, spreading_loss,
};

/// One point per emitter carrying the straight emitter → receiver strengths.
///
/// Only receivers with line of sight from the sensor get a non-zero strength.
/// The summed strength averages over the whole emitter × receiver × frequency
/// matrix.
pub fn simulate_direct_path(
    line_of_sight: &[bool],
    inputs: &PropagationInputs<'_>,
    base_strength: f32,
) -> SubOutput {
    let (emitters, receivers, frequencies) = (
        inputs.emitter_count(),
        inputs.receiver_count(),
        inputs.frequency_count(),
    );

    let distances: Vec<Vec<f32>> = inputs
        .emitter_positions
        .iter()
        .map(|emitter| {
            inputs
                .receivers
                .iter()
                .map(|receiver| emitter.distance(receiver.position))
                .collect()
        })
        .collect();

    let mut points = Vec::with_capacity(emitters);
    for (emitter_index, &emitter) in inputs.emitter_positions.iter().enumerate() {
        let mut strengths = StrengthMatrix::zeros(emitters, receivers, frequencies);
        let mut sum_of_squares = 0.0;

        for receiver_index in 0..receivers {
            if !line_of_sight.get(receiver_index).copied().unwrap_or(false) {
                continue;
            }
            let metres = distances[emitter_index][receiver_index] / CENTIMETRES_PER_METRE;
            let spreading = spreading_loss(metres);
            for (frequency_index, &frequency) in inputs.frequencies.iter().enumerate() {
                let strength = base_strength * spreading * absorption_loss(frequency, metres);
                strengths.set(emitter_index, receiver_index, frequency_index, strength);
                sum_of_squares += strength * strength;
            }
        }

        let distance_to_sensor = emitter.distance(inputs.sensor.position);
        let mut point = ReflectedPoint::new(
            PointKind::DirectPath,
            emitter,
            format!("DIRECT_EMITTER_{}", emitter_index),
        );
        point.reflection_direction = inputs.sensor.forward();
        point.total_distance = distance_to_sensor;
        point.distance_to_sensor = distance_to_sensor;
        point.distances_to_receivers = distances.clone();
        point.strengths = strengths;
        point.summed_strength = mean_square(sum_of_squares, emitters * receivers * frequencies);
        points.push(point);
    }

    SubOutput::from_points(points, Vec::new())
}
