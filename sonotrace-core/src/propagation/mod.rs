//! Strength computation for the specular, diffraction and direct-path components.
//!
//! Scene distances are centimetres; every loss term works in metres.

pub mod diffraction;
pub mod direct_path;
pub mod specular;

pub use diffraction::{DiffractionSettings, select_diffraction_objects, simulate_diffraction};
pub use direct_path::simulate_direct_path;
pub use specular::{SpecularSettings, simulate_specular};

use crate::math::{Pose, Vec3};

pub const CENTIMETRES_PER_METRE: f32 = 100.0;

/// Paths shorter than this (m) are clamped before computing spreading loss.
const MIN_SPREADING_DISTANCE: f32 = 0.01;

/// Shared, read-only inputs of one propagation pass. All positions are world space.
#[derive(Debug, Clone, Copy)]
pub struct PropagationInputs<'a> {
    pub frequencies: &'a [f32],
    pub sensor: Pose,
    pub emitter_positions: &'a [Vec3],
    /// Receivers with a NaN position are skipped
    pub receivers: &'a [Pose],
    pub receiver_directivities: Option<&'a [f32]>,
}

impl PropagationInputs<'_> {
    pub fn emitter_count(&self) -> usize {
        self.emitter_positions.len()
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.len()
    }

    pub fn frequency_count(&self) -> usize {
        self.frequencies.len()
    }
}

/// Atmospheric absorption coefficient (dB/m) at `frequency_hz`.
pub fn absorption_coefficient(frequency_hz: f32) -> f32 {
    0.038 * (frequency_hz / 1000.0) - 0.3
}

/// Amplitude factor after travelling `distance_m` metres.
pub fn absorption_loss(frequency_hz: f32, distance_m: f32) -> f32 {
    10f32.powf(-(absorption_coefficient(frequency_hz) * distance_m) / 20.0)
}

/// Inverse-square spreading over `distance_m` metres.
pub fn spreading_loss(distance_m: f32) -> f32 {
    1.0 / distance_m.max(MIN_SPREADING_DISTANCE).powi(2)
}

/// Cosine directivity blended with an omnidirectional pattern, never negative.
///
/// `blend` 0 is omnidirectional, 1 a pure cosine lobe around `axis`.
pub fn directivity(blend: f32, axis: Vec3, direction: Vec3) -> f32 {
    ((1.0 - blend) + blend * axis.dot(direction)).max(0.0)
}

/// Angular falloff of a specular reflection.
///
/// `angle_degrees` is measured between the reflection axis and the direction to
/// the receiver, so the lobe peaks at 180°. Larger `brdf` exponents widen it.
pub fn brdf_lobe(angle_degrees: f32, brdf: f32) -> f32 {
    let deviation = angle_degrees - 180.0;
    if brdf <= f32::EPSILON {
        return if deviation.abs() <= f32::EPSILON { 1.0 } else { 0.0 };
    }
    let k = -1.0 / (2.0 * brdf * brdf);
    let x = deviation * k;
    (-(x * x)).exp()
}

/// Angle in degrees between two unit vectors.
pub(crate) fn angle_between_degrees(a: Vec3, b: Vec3) -> f32 {
    a.dot(b).clamp(-1.0, 1.0).acos().to_degrees()
}

/// Mean of squared strengths, zero when nothing was computed.
pub(crate) fn mean_square(sum_of_squares: f32, count: usize) -> f32 {
    if count == 0 {
        0.0
    } else {
        sum_of_squares / count as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absorption() {
        assert!((absorption_coefficient(20_000.0) - 0.46).abs() < 1e-6);
        assert!((absorption_coefficient(40_000.0) - 1.22).abs() < 1e-6);
        assert_eq!(absorption_loss(40_000.0, 0.0), 1.0);
        let loss = absorption_loss(20_000.0, 1.0);
        assert!((loss - 10f32.powf(-0.46 / 20.0)).abs() < 1e-6);
    }

    #[test]
    fn test_spreading() {
        assert_eq!(spreading_loss(1.0), 1.0);
        assert_eq!(spreading_loss(2.0), 0.25);
        assert!(spreading_loss(0.0).is_finite());
    }

    #[test]
    fn test_directivity() {
        assert_eq!(directivity(0.0, Vec3::X, -Vec3::X), 1.0);
        assert_eq!(directivity(1.0, Vec3::X, Vec3::X), 1.0);
        assert_eq!(directivity(1.0, Vec3::X, -Vec3::X), 0.0);
        assert!((directivity(0.5, Vec3::X, Vec3::Y) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_brdf_lobe() {
        assert_eq!(brdf_lobe(180.0, 1.0), 1.0);
        assert!(brdf_lobe(170.0, 1.0) < brdf_lobe(175.0, 1.0));
        // a wide lobe barely falls off
        assert!(brdf_lobe(90.0, 1e4) > 0.99);
        assert_eq!(brdf_lobe(179.0, 0.0), 0.0);
        assert_eq!(brdf_lobe(180.0, 0.0), 1.0);
    }
}
