//! Reflection points and the per-cycle simulation output.

use serde::{Deserialize, Serialize};

use crate::math::{Pose, Vec3};
use crate::scene::PersistentPrimitiveId;

/// Dense emitter × receiver × frequency table of strengths.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrengthMatrix {
    emitters: usize,
    receivers: usize,
    frequencies: usize,
    values: Vec<f32>,
}

impl StrengthMatrix {
    pub fn zeros(emitters: usize, receivers: usize, frequencies: usize) -> Self {
        Self {
            emitters,
            receivers,
            frequencies,
            values: vec![0.0; emitters * receivers * frequencies],
        }
    }

    pub fn dimensions(&self) -> (usize, usize, usize) {
        (self.emitters, self.receivers, self.frequencies)
    }

    fn offset(&self, emitter: usize, receiver: usize, frequency: usize) -> Option<usize> {
        (emitter < self.emitters && receiver < self.receivers && frequency < self.frequencies)
            .then(|| (emitter * self.receivers + receiver) * self.frequencies + frequency)
    }

    pub fn get(&self, emitter: usize, receiver: usize, frequency: usize) -> Option<f32> {
        self.offset(emitter, receiver, frequency)
            .map(|offset| self.values[offset])
    }

    /// Writes one entry; out-of-range indexes are ignored.
    pub fn set(&mut self, emitter: usize, receiver: usize, frequency: usize, value: f32) {
        if let Some(offset) = self.offset(emitter, receiver, frequency) {
            self.values[offset] = value;
        }
    }

    /// Strengths of one emitter/receiver pair over all frequencies.
    pub fn spectrum(&self, emitter: usize, receiver: usize) -> &[f32] {
        match self.offset(emitter, receiver, 0) {
            Some(start) => &self.values[start..start + self.frequencies],
            None => &[],
        }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointKind {
    Specular,
    Diffraction,
    DirectPath,
}

/// A point sound is reflected from, diffracted at or emitted from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectedPoint {
    pub kind: PointKind,
    pub location: Vec3,
    pub reflection_direction: Vec3,
    pub label: String,
    /// Profile index, `None` for points that do not belong to an object
    pub object_type: Option<usize>,
    pub persistent_id: Option<PersistentPrimitiveId>,
    pub ray_index: usize,
    pub bounce_index: usize,
    /// Position among the points of its component
    pub index: usize,
    pub is_last_hit: bool,
    /// Path length from the sensor along the ray (cm)
    pub total_distance: f32,
    pub distance_to_sensor: f32,
    /// Path length from each emitter to the point (cm)
    pub distances_from_emitters: Vec<f32>,
    /// Full emitter → point → receiver path length, `[emitter][receiver]` (cm)
    pub distances_to_receivers: Vec<Vec<f32>>,
    pub curvature: f32,
    pub surface_brdf: Vec<f32>,
    pub surface_material: Vec<f32>,
    /// Directivity factor of each emitter towards the point
    pub emitter_directivities: Vec<f32>,
    pub strengths: StrengthMatrix,
    pub summed_strength: f32,
}

impl ReflectedPoint {
    pub fn new(kind: PointKind, location: Vec3, label: impl Into<String>) -> Self {
        Self {
            kind,
            location,
            reflection_direction: Vec3::ZERO,
            label: label.into(),
            object_type: None,
            persistent_id: None,
            ray_index: 0,
            bounce_index: 0,
            index: 0,
            is_last_hit: false,
            total_distance: 0.0,
            distance_to_sensor: 0.0,
            distances_from_emitters: Vec::new(),
            distances_to_receivers: Vec::new(),
            curvature: 0.0,
            surface_brdf: Vec::new(),
            surface_material: Vec::new(),
            emitter_directivities: Vec::new(),
            strengths: StrengthMatrix::default(),
            summed_strength: 0.0,
        }
    }

    pub fn is_specular(&self) -> bool {
        self.kind == PointKind::Specular
    }

    pub fn is_diffraction(&self) -> bool {
        self.kind == PointKind::Diffraction
    }

    pub fn is_direct_path(&self) -> bool {
        self.kind == PointKind::DirectPath
    }

    /// Re-expresses location and direction in the frame of `sensor`.
    pub fn into_sensor_frame(mut self, sensor: &Pose) -> Self {
        self.location = sensor.inverse_transform_point(self.location);
        self.reflection_direction = sensor.unrotate(self.reflection_direction);
        self
    }
}

/// Result of one propagation component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubOutput {
    pub points: Vec<ReflectedPoint>,
    /// Objects the component considered this cycle
    pub hit_objects: Vec<PersistentPrimitiveId>,
    pub maximum_strength: f32,
    pub maximum_curvature: f32,
    pub maximum_total_distance: f32,
}

impl SubOutput {
    /// Wraps `points`, renumbering them and computing the maxima.
    pub fn from_points(mut points: Vec<ReflectedPoint>, hit_objects: Vec<PersistentPrimitiveId>) -> Self {
        let mut output = Self {
            hit_objects,
            ..Default::default()
        };
        for (index, point) in points.iter_mut().enumerate() {
            point.index = index;
            output.maximum_strength = output.maximum_strength.max(point.summed_strength);
            output.maximum_curvature = output.maximum_curvature.max(point.curvature);
            output.maximum_total_distance = output.maximum_total_distance.max(point.total_distance);
        }
        output.points = points;
        output
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Everything captured and computed for one completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationOutput {
    pub index: u64,
    /// Seconds since the session started
    pub timestamp: f64,
    pub sensor_pose: Pose,
    pub owner_pose: Option<Pose>,
    pub emitter_poses: Vec<Pose>,
    pub receiver_poses: Vec<Pose>,
    pub emitter_signal_indexes: Vec<usize>,
    /// Line of sight from the sensor to each receiver
    pub direct_path_line_of_sight: Vec<bool>,
    /// Specular, then diffraction, then direct path points
    pub reflected_points: Vec<ReflectedPoint>,
    pub specular: Option<SubOutput>,
    pub diffraction: Option<SubOutput>,
    pub direct_path: Option<SubOutput>,
    pub maximum_strength: f32,
    pub maximum_curvature: f32,
    pub maximum_total_distance: f32,
}

impl SimulationOutput {
    pub fn points_of(&self, kind: PointKind) -> impl Iterator<Item = &ReflectedPoint> {
        self.reflected_points.iter().filter(move |p| p.kind == kind)
    }
}

/// State captured when a cycle was dispatched.
#[derive(Debug, Clone, Default)]
pub struct CaptureFrame {
    pub index: u64,
    pub timestamp: f64,
    pub sensor_pose: Pose,
    pub owner_pose: Option<Pose>,
    pub emitter_poses: Vec<Pose>,
    pub receiver_poses: Vec<Pose>,
    pub emitter_signal_indexes: Vec<usize>,
}

/// Merges component results into a [`SimulationOutput`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputAssembler {
    pub points_in_sensor_frame: bool,
    pub keep_sub_outputs: bool,
}

impl OutputAssembler {
    pub fn new(points_in_sensor_frame: bool, keep_sub_outputs: bool) -> Self {
        Self {
            points_in_sensor_frame,
            keep_sub_outputs,
        }
    }

    pub fn assemble(
        &self,
        frame: CaptureFrame,
        direct_path_line_of_sight: Vec<bool>,
        specular: Option<SubOutput>,
        diffraction: Option<SubOutput>,
        direct_path: Option<SubOutput>,
    ) -> SimulationOutput {
        let mut output = SimulationOutput {
            index: frame.index,
            timestamp: frame.timestamp,
            sensor_pose: frame.sensor_pose,
            owner_pose: frame.owner_pose,
            emitter_poses: frame.emitter_poses,
            receiver_poses: frame.receiver_poses,
            emitter_signal_indexes: frame.emitter_signal_indexes,
            direct_path_line_of_sight,
            ..Default::default()
        };

        for sub in [&specular, &diffraction, &direct_path].into_iter().flatten() {
            output.maximum_strength = output.maximum_strength.max(sub.maximum_strength);
            output.maximum_curvature = output.maximum_curvature.max(sub.maximum_curvature);
            output.maximum_total_distance =
                output.maximum_total_distance.max(sub.maximum_total_distance);
            output.reflected_points.extend(sub.points.iter().cloned());
        }

        if self.points_in_sensor_frame {
            let sensor = output.sensor_pose;
            output.reflected_points = std::mem::take(&mut output.reflected_points)
                .into_iter()
                .map(|p| p.into_sensor_frame(&sensor))
                .collect();
        }

        if self.keep_sub_outputs {
            output.specular = specular;
            output.diffraction = diffraction;
            output.direct_path = direct_path;
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(kind: PointKind, strength: f32, curvature: f32, distance: f32) -> ReflectedPoint {
        let mut point = ReflectedPoint::new(kind, Vec3::new(100.0, 0.0, 0.0), "p");
        point.summed_strength = strength;
        point.curvature = curvature;
        point.total_distance = distance;
        point
    }

    #[test]
    fn test_strength_matrix_indexing() {
        let mut matrix = StrengthMatrix::zeros(2, 3, 4);
        matrix.set(1, 2, 3, 5.0);
        matrix.set(2, 0, 0, 9.0);
        assert_eq!(matrix.get(1, 2, 3), Some(5.0));
        assert_eq!(matrix.get(2, 0, 0), None);
        assert_eq!(matrix.spectrum(1, 2), &[0.0, 0.0, 0.0, 5.0]);
        assert!(matrix.spectrum(5, 0).is_empty());
        assert_eq!(matrix.values().len(), 24);
    }

    #[test]
    fn test_sub_output_maxima() {
        let sub = SubOutput::from_points(
            vec![
                point(PointKind::Specular, 2.0, 0.1, 300.0),
                point(PointKind::Specular, 1.0, 0.7, 450.0),
            ],
            vec![],
        );
        assert_eq!(sub.maximum_strength, 2.0);
        assert_eq!(sub.maximum_curvature, 0.7);
        assert_eq!(sub.maximum_total_distance, 450.0);
        assert_eq!(sub.points[1].index, 1);

        let empty = SubOutput::from_points(vec![], vec![]);
        assert_eq!(empty.maximum_strength, 0.0);
    }

    #[test]
    fn test_assemble_orders_and_merges() {
        let frame = CaptureFrame {
            index: 4,
            sensor_pose: Pose::from_position(Vec3::new(10.0, 0.0, 0.0)),
            ..Default::default()
        };
        let specular = SubOutput::from_points(vec![point(PointKind::Specular, 1.0, 0.2, 100.0)], vec![]);
        let diffraction =
            SubOutput::from_points(vec![point(PointKind::Diffraction, 3.0, 0.9, 50.0)], vec![]);
        let direct = SubOutput::from_points(vec![point(PointKind::DirectPath, 0.5, 0.0, 700.0)], vec![]);

        let assembler = OutputAssembler::new(true, false);
        let output = assembler.assemble(
            frame,
            vec![true],
            Some(specular),
            Some(diffraction),
            Some(direct),
        );
        assert_eq!(output.index, 4);
        let kinds: Vec<_> = output.reflected_points.iter().map(|p| p.kind).collect();
        assert_eq!(
            kinds,
            vec![PointKind::Specular, PointKind::Diffraction, PointKind::DirectPath]
        );
        assert_eq!(output.maximum_strength, 3.0);
        assert_eq!(output.maximum_curvature, 0.9);
        assert_eq!(output.maximum_total_distance, 700.0);
        // moved into the sensor frame
        assert_eq!(output.reflected_points[0].location, Vec3::new(90.0, 0.0, 0.0));
        assert!(output.specular.is_none());
        assert_eq!(output.points_of(PointKind::Diffraction).count(), 1);
    }

    #[test]
    fn test_assemble_keeps_sub_outputs_in_world_frame() {
        let specular = SubOutput::from_points(vec![point(PointKind::Specular, 1.0, 0.0, 1.0)], vec![]);
        let output = OutputAssembler::new(false, true).assemble(
            CaptureFrame::default(),
            vec![],
            Some(specular.clone()),
            None,
            None,
        );
        assert_eq!(output.specular, Some(specular));
        assert!(output.diffraction.is_none());
        assert_eq!(output.reflected_points[0].location, Vec3::new(100.0, 0.0, 0.0));
    }

    #[test]
    fn test_output_roundtrip() {
        let mut reflected = point(PointKind::Specular, 1.5, 0.3, 250.0);
        reflected.persistent_id = Some(PersistentPrimitiveId(9));
        reflected.object_type = Some(1);
        reflected.strengths = StrengthMatrix::zeros(1, 2, 3);
        reflected.strengths.set(0, 1, 2, 0.25);
        reflected.distances_to_receivers = vec![vec![410.0, 420.0]];

        let json = serde_json::to_string(&reflected).unwrap();
        let back: ReflectedPoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reflected);

        let output = OutputAssembler::new(false, true).assemble(
            CaptureFrame {
                index: 2,
                timestamp: 0.4,
                ..Default::default()
            },
            vec![false],
            Some(SubOutput::from_points(vec![reflected], vec![PersistentPrimitiveId(9)])),
            None,
            None,
        );
        let json = serde_json::to_string(&output).unwrap();
        let back: SimulationOutput = serde_json::from_str(&json).unwrap();
        assert_eq!(back, output);
    }
}
