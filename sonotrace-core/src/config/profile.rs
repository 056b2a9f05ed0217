//! Acoustic object profiles.
//!
//! A profile describes how a surface responds as its curvature changes: flat
//! areas behave specularly (narrow BRDF lobe, strong reflection) while sharp
//! features behave like diffraction sources (wide lobe, weak scattering). Each
//! parameter is given as a start/end pair that is spread linearly over the
//! simulated frequency bands.

use crate::error::{Result, SonoTraceError};
use crate::math::{linspace, sigmoid_mix};

/// Steepens the configured transition slopes; a raw slope of 1 transitions too slowly.
pub const SIGMOID_SLOPE_MULTIPLIER: f32 = 8.0;

/// Raw profile parameters, given at the lowest and highest simulated frequency.
///
/// # Example
///
/// ```
/// use sonotrace_core::config::ProfileParameters;
///
/// let glossy = ProfileParameters {
///     brdf_exponent_specular: (4.0, 3.0),
///     ..ProfileParameters::DEFAULT
/// };
/// assert!(glossy.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfileParameters {
    /// Curvature at which the BRDF switches from specular to diffraction behaviour
    pub brdf_transition_position: f32,
    pub brdf_transition_slope: f32,
    /// BRDF exponent of flat surfaces (start, end)
    pub brdf_exponent_specular: (f32, f32),
    /// BRDF exponent of sharp features (start, end)
    pub brdf_exponent_diffraction: (f32, f32),
    pub material_transition_position: f32,
    pub material_transition_slope: f32,
    /// Reflection strength of flat surfaces (start, end)
    pub material_strength_specular: (f32, f32),
    /// Scattering strength of sharp features (start, end)
    pub material_strength_diffraction: (f32, f32),
}

impl ProfileParameters {
    pub const DEFAULT: Self = Self {
        brdf_transition_position: 0.4,
        brdf_transition_slope: 2.0,
        brdf_exponent_specular: (8.0, 5.0),
        brdf_exponent_diffraction: (70.0, 70.0),
        material_transition_position: 0.4,
        material_transition_slope: 2.0,
        material_strength_specular: (10.0, 8.0),
        material_strength_diffraction: (0.025, 0.05),
    };

    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        let exponents = [
            self.brdf_exponent_specular.0,
            self.brdf_exponent_specular.1,
            self.brdf_exponent_diffraction.0,
            self.brdf_exponent_diffraction.1,
        ];
        if exponents.iter().any(|&e| !(e.is_finite() && e > 0.0)) {
            return Err("BRDF exponents must be positive");
        }

        let strengths = [
            self.material_strength_specular.0,
            self.material_strength_specular.1,
            self.material_strength_diffraction.0,
            self.material_strength_diffraction.1,
        ];
        if strengths.iter().any(|&s| !(s.is_finite() && s >= 0.0)) {
            return Err("Material strengths must be non-negative");
        }

        if !(self.brdf_transition_slope.is_finite() && self.material_transition_slope.is_finite())
        {
            return Err("Transition slopes must be finite");
        }
        Ok(())
    }
}

impl Default for ProfileParameters {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Closed set of object profiles a mesh resource can be assigned.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ObjectProfile {
    /// Applied to everything without an explicit assignment
    #[default]
    Default,
    Custom {
        name: String,
        description: String,
        parameters: ProfileParameters,
    },
}

impl ObjectProfile {
    pub fn custom(name: impl Into<String>, parameters: ProfileParameters) -> Self {
        Self::Custom {
            name: name.into(),
            description: String::new(),
            parameters,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Default => "Default",
            Self::Custom { name, .. } => name,
        }
    }

    pub fn parameters(&self) -> ProfileParameters {
        match self {
            Self::Default => ProfileParameters::DEFAULT,
            Self::Custom { parameters, .. } => *parameters,
        }
    }
}

/// A profile expanded over the simulated frequency bands.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedProfile {
    pub name: String,
    pub brdf_transition_position: f32,
    pub brdf_transition_slope: f32,
    pub material_transition_position: f32,
    pub material_transition_slope: f32,
    pub brdf_exponents_specular: Vec<f32>,
    pub brdf_exponents_diffraction: Vec<f32>,
    pub material_strengths_specular: Vec<f32>,
    pub material_strengths_diffraction: Vec<f32>,
    /// BRDF used for triangles without acoustic data (flat surface)
    pub default_triangle_brdf: Vec<f32>,
    /// Material strength used for triangles without acoustic data (flat surface)
    pub default_triangle_material: Vec<f32>,
}

impl ResolvedProfile {
    pub fn resolve(profile: &ObjectProfile, frequency_count: usize) -> Self {
        let p = profile.parameters();
        let spread = |(start, end): (f32, f32)| linspace(start, end, frequency_count);

        let mut resolved = Self {
            name: profile.name().to_string(),
            brdf_transition_position: p.brdf_transition_position,
            brdf_transition_slope: p.brdf_transition_slope,
            material_transition_position: p.material_transition_position,
            material_transition_slope: p.material_transition_slope,
            brdf_exponents_specular: spread(p.brdf_exponent_specular),
            brdf_exponents_diffraction: spread(p.brdf_exponent_diffraction),
            material_strengths_specular: spread(p.material_strength_specular),
            material_strengths_diffraction: spread(p.material_strength_diffraction),
            default_triangle_brdf: Vec::new(),
            default_triangle_material: Vec::new(),
        };
        resolved.default_triangle_brdf = (0..resolved.frequency_count())
            .map(|f| resolved.surface_brdf(0.0, f))
            .collect();
        resolved.default_triangle_material = (0..resolved.frequency_count())
            .map(|f| resolved.surface_material(0.0, f))
            .collect();
        resolved
    }

    pub fn frequency_count(&self) -> usize {
        self.brdf_exponents_specular.len()
    }

    /// BRDF exponent of a surface with the given curvature at a frequency band.
    pub fn surface_brdf(&self, curvature: f32, frequency_index: usize) -> f32 {
        sigmoid_mix(
            curvature,
            SIGMOID_SLOPE_MULTIPLIER * self.brdf_transition_slope,
            self.brdf_transition_position,
            self.brdf_exponents_diffraction[frequency_index],
            self.brdf_exponents_specular[frequency_index],
        )
    }

    /// Material strength of a surface with the given curvature at a frequency band.
    pub fn surface_material(&self, curvature: f32, frequency_index: usize) -> f32 {
        sigmoid_mix(
            curvature,
            SIGMOID_SLOPE_MULTIPLIER * self.material_transition_slope,
            self.material_transition_position,
            self.material_strengths_diffraction[frequency_index],
            self.material_strengths_specular[frequency_index],
        )
    }
}

/// Lookup table from object type index to resolved profile.
///
/// Index 0 always holds the default profile.
#[derive(Debug, Clone)]
pub struct ProfileTable {
    frequency_count: usize,
    profiles: Vec<ResolvedProfile>,
}

impl ProfileTable {
    pub fn new(frequency_count: usize) -> Self {
        Self {
            frequency_count,
            profiles: vec![ResolvedProfile::resolve(
                &ObjectProfile::Default,
                frequency_count,
            )],
        }
    }

    /// Adds a profile and returns its object type index.
    ///
    /// # Errors
    ///
    /// Returns an error if the profile's parameters are invalid
    pub fn add(&mut self, profile: &ObjectProfile) -> Result<usize> {
        profile.parameters().validate().map_err(|reason| {
            SonoTraceError::Configuration(format!("Profile '{}': {}", profile.name(), reason))
        })?;
        self.profiles
            .push(ResolvedProfile::resolve(profile, self.frequency_count));
        Ok(self.profiles.len() - 1)
    }

    pub fn get(&self, index: usize) -> Option<&ResolvedProfile> {
        self.profiles.get(index)
    }

    pub fn default_profile(&self) -> &ResolvedProfile {
        &self.profiles[0]
    }

    /// Returns the profile at `index`, or the default one if it does not exist.
    pub fn get_or_default(&self, index: usize) -> &ResolvedProfile {
        self.get(index).unwrap_or_else(|| self.default_profile())
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.profiles.iter().position(|p| p.name == name)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &ResolvedProfile)> {
        self.profiles.iter().enumerate()
    }
}
