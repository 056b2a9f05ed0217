use std::fmt;
use std::sync::Arc;

use crate::error::{Result, SonoTraceError};
use crate::math::{Pose, Vec3};
use crate::scene::SceneGeometry;
use crate::trace::raw_hit::{MAX_EMITTER_COUNT, RawHit};

/// Number of floats in a packed sensor configuration buffer.
pub const SENSOR_CONFIG_LEN: usize = 7 + 3 * MAX_EMITTER_COUNT;

/// Opaque handle for one submitted trace cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CycleHandle(u64);

impl CycleHandle {
    pub(crate) fn new(index: u64) -> Self {
        Self(index)
    }

    /// Execution counter value the cycle was dispatched with.
    pub fn index(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CycleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cycle#{}", self.0)
    }
}

/// Sensor state handed to the backend for one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorConfig {
    pub pose: Pose,
    pub max_distance: f32,
    /// Emitter positions relative to the sensor
    pub emitter_positions: Vec<Vec3>,
}

impl SensorConfig {
    /// Packs into the flat layout backends read:
    /// `[x, y, z, roll, pitch, yaw, max_distance, e0x, e0y, e0z, ...]`.
    /// Unused emitter slots stay zero.
    pub fn pack(&self) -> Vec<f32> {
        let mut buffer = vec![0.0; SENSOR_CONFIG_LEN];
        let (roll, pitch, yaw) = self.pose.euler_degrees();
        buffer[0..3].copy_from_slice(&self.pose.position.to_array());
        buffer[3] = roll;
        buffer[4] = pitch;
        buffer[5] = yaw;
        buffer[6] = self.max_distance;
        for (slot, position) in self
            .emitter_positions
            .iter()
            .take(MAX_EMITTER_COUNT)
            .enumerate()
        {
            let start = 7 + 3 * slot;
            buffer[start..start + 3].copy_from_slice(&position.to_array());
        }
        buffer
    }

    /// # Errors
    ///
    /// Returns an error if the buffer is not a full sensor configuration or the
    /// emitter count exceeds its capacity
    pub fn unpack(buffer: &[f32], emitter_count: usize) -> Result<Self> {
        if buffer.len() != SENSOR_CONFIG_LEN {
            return Err(SonoTraceError::Backend(format!(
                "Sensor configuration holds {} floats, expected {}",
                buffer.len(),
                SENSOR_CONFIG_LEN
            )));
        }
        if emitter_count > MAX_EMITTER_COUNT {
            return Err(SonoTraceError::InvalidIndex {
                kind: "emitter",
                index: emitter_count,
                len: MAX_EMITTER_COUNT,
            });
        }
        let position = Vec3::new(buffer[0], buffer[1], buffer[2]);
        let pose = Pose::from_euler_degrees(position, buffer[3], buffer[4], buffer[5]);
        let emitter_positions = (0..emitter_count)
            .map(|slot| {
                let start = 7 + 3 * slot;
                Vec3::new(buffer[start], buffer[start + 1], buffer[start + 2])
            })
            .collect();
        Ok(Self {
            pose,
            max_distance: buffer[6],
            emitter_positions,
        })
    }

    pub fn emitter_world_positions(&self) -> Vec<Vec3> {
        self.emitter_positions
            .iter()
            .map(|&p| self.pose.transform_point(p))
            .collect()
    }
}

/// Everything a backend needs to run one trace cycle.
///
/// Angles are sensor-local radians. The first `num_distribution_rays` entries
/// are distribution rays; any remaining entries are direct-path rays, one per
/// receiver.
#[derive(Debug, Clone, Default)]
pub struct TraceRequest {
    pub azimuths: Vec<f32>,
    pub elevations: Vec<f32>,
    pub num_distribution_rays: usize,
    pub max_bounces: usize,
    pub emitter_count: usize,
    pub sensor_buffer: Vec<f32>,
}

impl TraceRequest {
    pub fn num_rays(&self) -> usize {
        self.azimuths.len()
    }

    pub fn num_direct_path_rays(&self) -> usize {
        self.num_rays().saturating_sub(self.num_distribution_rays)
    }

    /// Row count of a complete readback for this request.
    pub fn expected_rows(&self) -> usize {
        self.num_rays() * self.max_bounces
    }

    pub fn sensor_config(&self) -> Result<SensorConfig> {
        SensorConfig::unpack(&self.sensor_buffer, self.emitter_count)
    }
}

pub enum TracePoll {
    Pending,
    Ready(Vec<RawHit>),
}

/// Trait for parallel ray-intersection engines.
///
/// Implementations run asynchronously: `submit` must not block on the trace and
/// `poll` is called at most once per tick until it returns `Ready`.
///
/// # Example
///
/// ```ignore
/// struct NullBackend;
///
/// impl TraceBackend for NullBackend {
///     fn submit(&mut self, _handle: CycleHandle, _request: TraceRequest) -> Result<()> {
///         Ok(())
///     }
///
///     fn poll(&mut self, _handle: CycleHandle) -> TracePoll {
///         TracePoll::Pending
///     }
/// }
/// ```
pub trait TraceBackend: Send {
    /// Starts tracing `request`. The result is later retrieved with the same handle.
    fn submit(&mut self, handle: CycleHandle, request: TraceRequest) -> Result<()>;

    /// Non-blocking check for a finished readback.
    fn poll(&mut self, handle: CycleHandle) -> TracePoll;

    /// Replaces the geometry traced by subsequent submissions.
    ///
    /// The default implementation ignores updates; backends that own their
    /// acceleration structures elsewhere do not need them.
    fn update_scene(&mut self, _geometry: Arc<SceneGeometry>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensor_config_pack_layout() {
        let config = SensorConfig {
            pose: Pose::from_euler_degrees(Vec3::new(1.0, 2.0, 3.0), 0.0, 0.0, 30.0),
            max_distance: 500.0,
            emitter_positions: vec![Vec3::new(4.0, 5.0, 6.0)],
        };
        let buffer = config.pack();
        assert_eq!(buffer.len(), SENSOR_CONFIG_LEN);
        assert_eq!(&buffer[0..3], &[1.0, 2.0, 3.0]);
        assert!((buffer[5] - 30.0).abs() < 1e-4);
        assert_eq!(buffer[6], 500.0);
        assert_eq!(&buffer[7..10], &[4.0, 5.0, 6.0]);
        assert!(buffer[10..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_sensor_config_unpack() {
        let config = SensorConfig {
            pose: Pose::from_euler_degrees(Vec3::new(-3.0, 0.5, 10.0), 5.0, -10.0, 45.0),
            max_distance: 250.0,
            emitter_positions: vec![Vec3::X, Vec3::new(0.0, -2.0, 1.0)],
        };
        let unpacked = SensorConfig::unpack(&config.pack(), 2).unwrap();
        assert!(unpacked.pose.position.abs_diff_eq(config.pose.position, 1e-5));
        assert!(unpacked.pose.forward().abs_diff_eq(config.pose.forward(), 1e-4));
        assert_eq!(unpacked.max_distance, 250.0);
        assert_eq!(unpacked.emitter_positions, config.emitter_positions);

        assert!(SensorConfig::unpack(&[0.0; 3], 1).is_err());
        assert!(SensorConfig::unpack(&config.pack(), MAX_EMITTER_COUNT + 1).is_err());
    }

    #[test]
    fn test_trace_request_sizes() {
        let request = TraceRequest {
            azimuths: vec![0.0; 12],
            elevations: vec![0.0; 12],
            num_distribution_rays: 10,
            max_bounces: 3,
            emitter_count: 1,
            sensor_buffer: Vec::new(),
        };
        assert_eq!(request.num_rays(), 12);
        assert_eq!(request.num_direct_path_rays(), 2);
        assert_eq!(request.expected_rows(), 36);
        assert!(request.sensor_config().is_err());
    }
}
