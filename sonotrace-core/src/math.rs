//! Math types and numeric helpers for SonoTrace
//!
//! Sensor-local frames use +X forward, +Y left and +Z up. Angles handed to the
//! trace backend are radians; configuration angles are degrees.

pub use glam::{EulerRot, Quat, Vec3};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Pose {
    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }

    pub fn identity() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
        }
    }

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
        }
    }

    pub fn from_rotation(rotation: Quat) -> Self {
        Self {
            position: Vec3::ZERO,
            rotation,
        }
    }

    /// Builds a pose from roll/pitch/yaw in degrees (rotation order Z, Y, X).
    pub fn from_euler_degrees(position: Vec3, roll: f32, pitch: f32, yaw: f32) -> Self {
        Self {
            position,
            rotation: Quat::from_euler(
                EulerRot::ZYX,
                yaw.to_radians(),
                pitch.to_radians(),
                roll.to_radians(),
            ),
        }
    }

    /// Returns `(roll, pitch, yaw)` in degrees.
    pub fn euler_degrees(&self) -> (f32, f32, f32) {
        let (yaw, pitch, roll) = self.rotation.to_euler(EulerRot::ZYX);
        (roll.to_degrees(), pitch.to_degrees(), yaw.to_degrees())
    }

    pub fn forward(&self) -> Vec3 {
        self.rotation * Vec3::X
    }

    pub fn left(&self) -> Vec3 {
        self.rotation * Vec3::Y
    }

    pub fn up(&self) -> Vec3 {
        self.rotation * Vec3::Z
    }

    pub fn distance(&self, other: &Self) -> f32 {
        self.position.distance(other.position)
    }

    /// Maps a point from this pose's local frame into the parent frame.
    pub fn transform_point(&self, local: Vec3) -> Vec3 {
        self.position + self.rotation * local
    }

    /// Maps a point from the parent frame into this pose's local frame.
    pub fn inverse_transform_point(&self, world: Vec3) -> Vec3 {
        self.rotation.inverse() * (world - self.position)
    }

    pub fn rotate(&self, local: Vec3) -> Vec3 {
        self.rotation * local
    }

    pub fn unrotate(&self, world: Vec3) -> Vec3 {
        self.rotation.inverse() * world
    }

    /// Composes `self` (parent) with a pose expressed in the parent's frame.
    pub fn compose(&self, child: &Pose) -> Pose {
        Pose {
            position: self.transform_point(child.position),
            rotation: (self.rotation * child.rotation).normalize(),
        }
    }

    /// Expresses `self` in the frame of `parent`.
    pub fn relative_to(&self, parent: &Pose) -> Pose {
        Pose {
            position: parent.inverse_transform_point(self.position),
            rotation: (parent.rotation.inverse() * self.rotation).normalize(),
        }
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

/// Unit direction in a sensor-local frame for an azimuth/elevation pair in radians.
pub fn direction_from_angles(azimuth: f32, elevation: f32) -> Vec3 {
    let (sin_el, cos_el) = elevation.sin_cos();
    let (sin_az, cos_az) = azimuth.sin_cos();
    Vec3::new(cos_el * cos_az, cos_el * sin_az, sin_el)
}

/// Azimuth and elevation in radians of a sensor-local direction.
pub fn angles_from_direction(direction: Vec3) -> (f32, f32) {
    let azimuth = direction.y.atan2(direction.x);
    let elevation = direction
        .z
        .atan2((direction.x * direction.x + direction.y * direction.y).sqrt());
    (azimuth, elevation)
}

/// `count` evenly spaced values from `start` to `end` inclusive.
///
/// A count of one or less yields just `start`.
pub fn linspace(start: f32, end: f32, count: usize) -> Vec<f32> {
    if count <= 1 {
        return vec![start];
    }
    let step = (end - start) / (count - 1) as f32;
    (0..count).map(|i| start + i as f32 * step).collect()
}

/// Logistic blend between `high` (for `x` well above `center`) and `low`.
pub fn sigmoid_mix(x: f32, slope: f32, center: f32, high: f32, low: f32) -> f32 {
    let weight = 1.0 / (1.0 + (-slope * (x - center)).exp());
    weight * high + (1.0 - weight) * low
}

/// Piecewise-linear interpolation of `(x, y)` at every query in `xq`.
///
/// Queries outside the sampled range clamp to the end values. Returns an empty
/// vector when `x` and `y` differ in length or hold fewer than two samples.
/// `x` is scanned in order, so it only needs to be close to monotonic.
pub fn interpolate(x: &[f32], y: &[f32], xq: &[f32]) -> Vec<f32> {
    if x.len() != y.len() || x.len() < 2 {
        return Vec::new();
    }
    let (first_x, last_x) = (x[0], x[x.len() - 1]);
    let (first_y, last_y) = (y[0], y[y.len() - 1]);

    xq.iter()
        .map(|&query| {
            if query <= first_x {
                return first_y;
            }
            if query >= last_x {
                return last_y;
            }
            x.windows(2)
                .zip(y.windows(2))
                .find(|(xs, _)| query >= xs[0] && query <= xs[1])
                .map(|(xs, ys)| {
                    let span = xs[1] - xs[0];
                    if span.abs() <= f32::EPSILON {
                        ys[0]
                    } else {
                        ys[0] + (ys[1] - ys[0]) * (query - xs[0]) / span
                    }
                })
                .unwrap_or(last_y)
        })
        .collect()
}
