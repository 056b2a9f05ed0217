use crate::config::array_pattern::ReceiverArrayPattern;
use crate::config::profile::ObjectProfile;
use crate::error::{Result, SonoTraceError};
use crate::math::Vec3;
use crate::trace::MAX_EMITTER_COUNT;

/// Angular window of the sensor in degrees, relative to its forward axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldOfView {
    pub azimuth_min: f32,
    pub azimuth_max: f32,
    pub elevation_min: f32,
    pub elevation_max: f32,
}

impl FieldOfView {
    pub fn symmetric(half_azimuth: f32, half_elevation: f32) -> Self {
        Self {
            azimuth_min: -half_azimuth,
            azimuth_max: half_azimuth,
            elevation_min: -half_elevation,
            elevation_max: half_elevation,
        }
    }

    /// Strict containment test for angles given in degrees.
    pub fn contains_degrees(&self, azimuth: f32, elevation: f32) -> bool {
        azimuth > self.azimuth_min
            && azimuth < self.azimuth_max
            && elevation > self.elevation_min
            && elevation < self.elevation_max
    }

    /// Same as [`Self::contains_degrees`] but accepting the window edges.
    pub fn covers_degrees(&self, azimuth: f32, elevation: f32) -> bool {
        (self.azimuth_min..=self.azimuth_max).contains(&azimuth)
            && (self.elevation_min..=self.elevation_max).contains(&elevation)
    }

    /// Solid angle of the window in steradians.
    pub fn solid_angle(&self) -> f32 {
        (self.azimuth_max.to_radians() - self.azimuth_min.to_radians())
            * (self.elevation_max.to_radians().sin() - self.elevation_min.to_radians().sin())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let azimuth_ok = self.azimuth_min >= -180.0
            && self.azimuth_max <= 180.0
            && self.azimuth_min < self.azimuth_max;
        let elevation_ok = self.elevation_min >= -90.0
            && self.elevation_max <= 90.0
            && self.elevation_min < self.elevation_max;
        if !azimuth_ok || !elevation_ok {
            return Err(SonoTraceError::Configuration(format!(
                "Invalid field of view: {:?}",
                self
            )));
        }
        Ok(())
    }
}

impl Default for FieldOfView {
    fn default() -> Self {
        Self::symmetric(45.0, 45.0)
    }
}

/// Piecewise scaling of curvature by triangle area (cm²).
///
/// Very small triangles are damped towards `min_effect`, mid-sized ones are
/// boosted up to `max_effect`, and the effect fades to zero at the diffraction
/// size threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurvatureSizeScaler {
    pub min_effect: f32,
    pub max_effect: f32,
    pub lower_size_threshold: f32,
    pub upper_size_threshold: f32,
}

impl CurvatureSizeScaler {
    pub fn effect(&self, triangle_size: f32, diffraction_size_threshold: f32) -> f32 {
        if triangle_size <= self.lower_size_threshold {
            self.min_effect
                + (1.0 - self.min_effect) / self.lower_size_threshold * triangle_size
        } else if triangle_size <= self.upper_size_threshold {
            1.0 + (self.max_effect - 1.0) / (self.upper_size_threshold - self.lower_size_threshold)
                * (triangle_size - self.lower_size_threshold)
        } else if triangle_size <= diffraction_size_threshold {
            self.max_effect
                - self.max_effect / (diffraction_size_threshold - self.upper_size_threshold)
                    * (triangle_size - self.upper_size_threshold)
        } else {
            0.0
        }
    }
}

impl Default for CurvatureSizeScaler {
    fn default() -> Self {
        Self {
            min_effect: 0.02,
            max_effect: 2.0,
            lower_size_threshold: 0.5,
            upper_size_threshold: 5.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurvatureSettings {
    /// Final multiplier applied to every triangle curvature
    pub scale: f32,
    /// Optional triangle-size based damping, `None` disables it
    pub size_scaler: Option<CurvatureSizeScaler>,
}

impl Default for CurvatureSettings {
    fn default() -> Self {
        Self {
            scale: 1.0,
            size_scaler: Some(CurvatureSizeScaler::default()),
        }
    }
}

/// Receivers that stay put instead of following the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticReceivers {
    /// Positions are world coordinates rather than offsets from the starting sensor pose
    pub world_coordinates: bool,
}

/// Configuration descriptor for a SonoTrace session.
///
/// All distances are centimetres, angles are degrees and frequencies are Hz.
#[derive(Debug, Clone)]
pub struct SonoTraceDesc {
    /// Master switch; a disabled session never dispatches or simulates
    pub enable_simulation: bool,
    /// Dispatch trace cycles. Forced on when specular or direct path is enabled.
    pub enable_ray_tracing: bool,
    pub enable_specular: bool,
    pub enable_diffraction: bool,
    pub enable_direct_path: bool,
    /// Run only on explicit triggers; the periodic clock is ignored entirely
    pub trigger_only: bool,
    /// Express output points in the sensor frame instead of world space
    pub points_in_sensor_frame: bool,
    /// Keep the per-component sub-outputs in the assembled output
    pub enable_sub_outputs: bool,
    /// Periodic run rate used when not in trigger-only mode
    pub simulation_rate_hz: f32,
    pub frequency_count: usize,
    pub min_frequency_hz: f32,
    pub max_frequency_hz: f32,
    /// Base strength of the emitter to receiver direct path
    pub direct_path_strength: f32,
    pub specular_min_strength: f32,
    pub diffraction_min_strength: f32,
    /// Triangles with a larger area (cm²) never diffract
    pub diffraction_triangle_size_threshold: f32,
    /// Diffraction draws `ceil(initial_rays / division_factor)` samples per object
    pub diffraction_division_factor: f32,
    pub diffraction_requires_line_of_sight: bool,
    pub diffraction_for_dynamic_objects: bool,
    pub specular_only_last_hits: bool,
    /// Attempts to generate acoustic data for meshes that are not ready yet
    pub mesh_generation_attempts: u32,
    pub curvature: CurvatureSettings,
    pub field_of_view: FieldOfView,
    /// Number of distribution rays. A negative count selects a horizontal slice.
    pub initial_rays: i32,
    pub max_ray_distance: f32,
    pub max_bounces: usize,
    /// Emitter positions relative to the sensor
    pub emitter_positions: Vec<Vec3>,
    pub emitter_offset: Vec3,
    /// Per-emitter directivity blend in [0, 1], `None` for omnidirectional emitters
    pub emitter_directivities: Option<Vec<f32>>,
    /// Receiver positions relative to the sensor (or world, see `static_receivers`)
    pub receiver_positions: Vec<Vec3>,
    pub receiver_offset: Vec3,
    pub receiver_directivities: Option<Vec<f32>>,
    /// Expands every receiver into a virtual array
    pub receiver_pattern: Option<ReceiverArrayPattern>,
    pub static_receivers: Option<StaticReceivers>,
    /// Signal waveforms emitters can be switched between
    pub emitter_signals: Vec<Vec<f32>>,
    pub default_signal_indexes: Vec<usize>,
    /// Profiles available in addition to the default one at index 0
    pub profiles: Vec<ObjectProfile>,
    /// Seed for diffraction sampling, `None` draws one from entropy
    pub random_seed: Option<u64>,
}

impl Default for SonoTraceDesc {
    fn default() -> Self {
        Self {
            enable_simulation: true,
            enable_ray_tracing: true,
            enable_specular: true,
            enable_diffraction: true,
            enable_direct_path: false,
            trigger_only: true,
            points_in_sensor_frame: true,
            enable_sub_outputs: false,
            simulation_rate_hz: 5.0,
            frequency_count: 14,
            min_frequency_hz: 20_000.0,
            max_frequency_hz: 85_000.0,
            direct_path_strength: 100.0,
            specular_min_strength: 0.0,
            diffraction_min_strength: 0.0,
            diffraction_triangle_size_threshold: 200.0,
            diffraction_division_factor: 25.0,
            diffraction_requires_line_of_sight: true,
            diffraction_for_dynamic_objects: false,
            specular_only_last_hits: false,
            mesh_generation_attempts: 5,
            curvature: CurvatureSettings::default(),
            field_of_view: FieldOfView::default(),
            initial_rays: 50_000,
            max_ray_distance: 500.0,
            max_bounces: 3,
            emitter_positions: vec![Vec3::ZERO],
            emitter_offset: Vec3::ZERO,
            emitter_directivities: None,
            receiver_positions: vec![Vec3::ZERO],
            receiver_offset: Vec3::ZERO,
            receiver_directivities: None,
            receiver_pattern: None,
            static_receivers: None,
            emitter_signals: Vec::new(),
            default_signal_indexes: Vec::new(),
            profiles: Vec::new(),
            random_seed: None,
        }
    }
}

impl SonoTraceDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger_only(mut self, trigger_only: bool) -> Self {
        self.trigger_only = trigger_only;
        self
    }

    pub fn simulation_rate(mut self, rate_hz: f32) -> Self {
        self.simulation_rate_hz = rate_hz;
        self
    }

    pub fn components(mut self, specular: bool, diffraction: bool, direct_path: bool) -> Self {
        self.enable_specular = specular;
        self.enable_diffraction = diffraction;
        self.enable_direct_path = direct_path;
        self
    }

    pub fn frequencies(mut self, count: usize, min_hz: f32, max_hz: f32) -> Self {
        self.frequency_count = count;
        self.min_frequency_hz = min_hz;
        self.max_frequency_hz = max_hz;
        self
    }

    pub fn initial_rays(mut self, rays: i32) -> Self {
        self.initial_rays = rays;
        self
    }

    pub fn max_bounces(mut self, bounces: usize) -> Self {
        self.max_bounces = bounces;
        self
    }

    pub fn max_ray_distance(mut self, distance: f32) -> Self {
        self.max_ray_distance = distance;
        self
    }

    pub fn field_of_view(mut self, field_of_view: FieldOfView) -> Self {
        self.field_of_view = field_of_view;
        self
    }

    pub fn emitters(mut self, positions: Vec<Vec3>) -> Self {
        self.emitter_positions = positions;
        self
    }

    pub fn receivers(mut self, positions: Vec<Vec3>) -> Self {
        self.receiver_positions = positions;
        self
    }

    pub fn emitter_signals(mut self, signals: Vec<Vec<f32>>, default_indexes: Vec<usize>) -> Self {
        self.emitter_signals = signals;
        self.default_signal_indexes = default_indexes;
        self
    }

    pub fn profile(mut self, profile: ObjectProfile) -> Self {
        self.profiles.push(profile);
        self
    }

    pub fn random_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }

    /// Ray tracing is required whenever specular or direct path output is wanted.
    pub fn ray_tracing_required(&self) -> bool {
        self.enable_ray_tracing || self.enable_specular || self.enable_direct_path
    }

    /// Checks every value that would make the pipeline meaningless.
    ///
    /// Mismatched directivity or signal index arrays are not errors here; they are
    /// replaced with safe defaults when inputs are generated.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(SonoTraceError::Configuration(message));

        if !(self.simulation_rate_hz.is_finite() && self.simulation_rate_hz > 0.0) {
            return invalid(format!(
                "Simulation rate must be positive, got {}",
                self.simulation_rate_hz
            ));
        }
        if self.frequency_count == 0 {
            return invalid("At least one simulation frequency is required".into());
        }
        if !(self.min_frequency_hz > 0.0 && self.max_frequency_hz >= self.min_frequency_hz) {
            return invalid(format!(
                "Invalid frequency range {}..{}",
                self.min_frequency_hz, self.max_frequency_hz
            ));
        }
        if self.max_bounces == 0 {
            return invalid("Maximum bounces must be at least 1".into());
        }
        if !(self.max_ray_distance.is_finite() && self.max_ray_distance > 0.0) {
            return invalid(format!(
                "Maximum ray distance must be positive, got {}",
                self.max_ray_distance
            ));
        }
        if self.initial_rays == 0 {
            return invalid("Initial ray count must not be zero".into());
        }
        if self.diffraction_division_factor <= 0.0 {
            return invalid("Diffraction division factor must be positive".into());
        }
        if self.emitter_positions.len() > MAX_EMITTER_COUNT {
            return invalid(format!(
                "At most {} emitters are supported, got {}",
                MAX_EMITTER_COUNT,
                self.emitter_positions.len()
            ));
        }
        if let Some(pattern) = &self.receiver_pattern {
            pattern.validate()?;
        }
        for profile in &self.profiles {
            profile.parameters().validate().map_err(|reason| {
                SonoTraceError::Configuration(format!("Profile '{}': {}", profile.name(), reason))
            })?;
        }
        self.field_of_view.validate()
    }
}
