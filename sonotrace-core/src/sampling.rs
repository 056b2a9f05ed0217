//! Ray direction sampling over the sensor's field of view.
//!
//! Distribution rays are generated once per field-of-view setting and cached by
//! the session. Direct-path rays are recomputed every cycle because they follow
//! the receiver poses.

use crate::config::FieldOfView;
use crate::math::{Pose, Vec3, angles_from_direction};

/// Azimuth/elevation pairs (radians) of the distribution rays.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RaySet {
    pub azimuths: Vec<f32>,
    pub elevations: Vec<f32>,
}

impl RaySet {
    pub fn len(&self) -> usize {
        self.azimuths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.azimuths.is_empty()
    }

    /// Generates the distribution for a configured ray count.
    ///
    /// A negative count selects a horizontal slice of `|count|` rays.
    pub fn generate(initial_rays: i32, field_of_view: &FieldOfView) -> Self {
        let rays = if initial_rays < 0 {
            sample_horizontal_slice(
                initial_rays.unsigned_abs() as usize,
                field_of_view.azimuth_min,
                field_of_view.azimuth_max,
            )
        } else {
            sample_sphere_cap(initial_rays as usize, field_of_view)
        };
        if rays.is_empty() {
            log::warn!(
                "Ray sampling produced no rays for count {} and {:?}",
                initial_rays,
                field_of_view
            );
        }
        rays
    }

    /// Returns a copy with the direct-path angles appended after the distribution rays.
    pub fn with_direct_path(&self, direct_path: &RaySet) -> RaySet {
        let mut combined = self.clone();
        combined.azimuths.extend_from_slice(&direct_path.azimuths);
        combined.elevations.extend_from_slice(&direct_path.elevations);
        combined
    }
}

/// Spiral (golden-angle) sampling of a sphere cap.
///
/// The forward direction is always emitted first. The spiral is oversampled by
/// the ratio of the full sphere to the cap so that roughly `num_rays` candidates
/// land inside the window; sampling stops at exactly `num_rays` or when the
/// candidates run out, which can leave the set short for narrow windows.
pub fn sample_sphere_cap(num_rays: usize, field_of_view: &FieldOfView) -> RaySet {
    let mut rays = RaySet::default();
    if num_rays == 0 {
        return rays;
    }
    rays.azimuths.push(0.0);
    rays.elevations.push(0.0);

    let surface_scaler = 4.0 * std::f32::consts::PI / field_of_view.solid_angle();
    let sphere_points = (num_rays as f32 * surface_scaler).ceil() as usize;
    if sphere_points == 0 {
        return rays;
    }

    let offset = 2.0 / sphere_points as f32;
    let increment = std::f32::consts::PI * (3.0 - 5.0_f32.sqrt());

    for i in 1..=sphere_points {
        if rays.len() == num_rays {
            break;
        }
        let y = i as f32 * offset - 1.0 + offset / 2.0;
        let r = (1.0 - y * y).max(0.0).sqrt();
        let phi = ((i + 1) % sphere_points) as f32 * increment;
        let x = phi.cos() * r;
        let z = phi.sin() * r;

        let (azimuth, elevation) = angles_from_direction(Vec3::new(x, y, z));
        if field_of_view.contains_degrees(azimuth.to_degrees(), elevation.to_degrees()) {
            rays.azimuths.push(azimuth);
            rays.elevations.push(elevation);
        }
    }

    if rays.len() < num_rays {
        log::debug!(
            "Sphere cap sampling returned {} of {} requested rays",
            rays.len(),
            num_rays
        );
    }
    rays
}

/// Linear azimuth sweep at zero elevation, limits in degrees.
pub fn sample_horizontal_slice(num_rays: usize, azimuth_min: f32, azimuth_max: f32) -> RaySet {
    let step = if num_rays > 1 {
        (azimuth_max - azimuth_min) / (num_rays - 1) as f32
    } else {
        0.0
    };
    RaySet {
        azimuths: (0..num_rays)
            .map(|i| (azimuth_min + i as f32 * step).to_radians())
            .collect(),
        elevations: vec![0.0; num_rays],
    }
}

/// Direction of every receiver as seen from the sensor, in sensor-local angles.
///
/// A receiver sitting exactly on the sensor yields the forward direction.
pub fn direct_path_angles(sensor: &Pose, receivers: &[Pose]) -> RaySet {
    let mut rays = RaySet::default();
    for receiver in receivers {
        let local = sensor.unrotate((receiver.position - sensor.position).normalize_or_zero());
        let (azimuth, elevation) = if local == Vec3::ZERO {
            (0.0, 0.0)
        } else {
            angles_from_direction(local)
        };
        rays.azimuths.push(azimuth);
        rays.elevations.push(elevation);
    }
    rays
}

#[cfg(test)]
mod tests {
    use super::*;

    fn within_window(rays: &RaySet, fov: &FieldOfView) -> bool {
        rays.azimuths
            .iter()
            .zip(&rays.elevations)
            .skip(1)
            .all(|(az, el)| fov.contains_degrees(az.to_degrees(), el.to_degrees()))
    }

    #[test]
    fn test_sphere_cap_includes_forward_first() {
        let fov = FieldOfView::default();
        let rays = sample_sphere_cap(500, &fov);
        assert_eq!(rays.azimuths[0], 0.0);
        assert_eq!(rays.elevations[0], 0.0);
        assert!(rays.len() <= 500);
        assert!(within_window(&rays, &fov));
    }

    #[test]
    fn test_sphere_cap_hits_requested_count_for_wide_window() {
        let fov = FieldOfView::symmetric(90.0, 60.0);
        let rays = sample_sphere_cap(2_000, &fov);
        assert!(rays.len() > 1_900, "got {}", rays.len());
        assert!(rays.len() <= 2_000);
    }

    #[test]
    fn test_sphere_cap_bounds_for_many_windows() {
        for &(az, el) in &[(5.0, 5.0), (30.0, 10.0), (120.0, 80.0), (180.0, 90.0)] {
            let fov = FieldOfView::symmetric(az, el);
            for &count in &[1usize, 7, 250] {
                let rays = sample_sphere_cap(count, &fov);
                assert!(!rays.is_empty());
                assert!(rays.len() <= count);
                assert!(within_window(&rays, &fov));
            }
        }
    }

    #[test]
    fn test_sphere_cap_zero_rays() {
        assert!(sample_sphere_cap(0, &FieldOfView::default()).is_empty());
    }

    #[test]
    fn test_horizontal_slice() {
        let rays = sample_horizontal_slice(5, -40.0, 40.0);
        assert_eq!(rays.len(), 5);
        assert!((rays.azimuths[0] - (-40.0_f32).to_radians()).abs() < 1e-6);
        assert!((rays.azimuths[4] - 40.0_f32.to_radians()).abs() < 1e-6);
        assert!(rays.elevations.iter().all(|&e| e == 0.0));
        assert_eq!(sample_horizontal_slice(1, -40.0, 40.0).len(), 1);
    }

    #[test]
    fn test_generate_selects_slice_for_negative_count() {
        let rays = RaySet::generate(-16, &FieldOfView::default());
        assert_eq!(rays.len(), 16);
        assert!(rays.elevations.iter().all(|&e| e == 0.0));
    }

    #[test]
    fn test_direct_path_angles() {
        let sensor = Pose::from_euler_degrees(Vec3::ZERO, 0.0, 0.0, 90.0);
        let receivers = [
            Pose::from_position(Vec3::new(0.0, 100.0, 0.0)),
            Pose::from_position(Vec3::new(0.0, 0.0, 100.0)),
            Pose::from_position(Vec3::ZERO),
        ];
        let rays = direct_path_angles(&sensor, &receivers);
        assert_eq!(rays.len(), 3);
        // straight ahead of the rotated sensor
        assert!(rays.azimuths[0].abs() < 1e-5);
        assert!(rays.elevations[0].abs() < 1e-5);
        // straight up
        assert!((rays.elevations[1] - std::f32::consts::FRAC_PI_2).abs() < 1e-5);
        assert_eq!((rays.azimuths[2], rays.elevations[2]), (0.0, 0.0));
    }

    #[test]
    fn test_with_direct_path_appends() {
        let base = sample_horizontal_slice(3, -10.0, 10.0);
        let direct = RaySet {
            azimuths: vec![0.5],
            elevations: vec![0.25],
        };
        let combined = base.with_direct_path(&direct);
        assert_eq!(combined.len(), 4);
        assert_eq!(combined.azimuths[3], 0.5);
        assert_eq!(combined.elevations[3], 0.25);
    }
}
