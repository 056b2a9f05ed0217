use crate::config::desc::SonoTraceDesc;
use crate::config::profile::ProfileTable;
use crate::error::Result;
use crate::math::{Vec3, linspace};
use crate::sampling::RaySet;

/// Values derived from a [`SonoTraceDesc`] once per session.
#[derive(Debug, Clone)]
pub struct GeneratedInputs {
    pub frequencies: Vec<f32>,
    /// Emitter positions relative to the sensor, offset applied
    pub emitter_positions: Vec<Vec3>,
    pub emitter_directivities: Option<Vec<f32>>,
    /// Receiver positions with offset and array pattern applied
    pub receiver_positions: Vec<Vec3>,
    pub receiver_directivities: Option<Vec<f32>>,
    pub rays: RaySet,
    pub default_signal_indexes: Vec<usize>,
    pub profiles: ProfileTable,
}

impl GeneratedInputs {
    /// # Errors
    ///
    /// Returns an error if the descriptor fails validation
    pub fn from_desc(desc: &SonoTraceDesc) -> Result<Self> {
        desc.validate()?;

        let frequencies = linspace(
            desc.min_frequency_hz,
            desc.max_frequency_hz,
            desc.frequency_count,
        );

        let emitter_positions: Vec<Vec3> = desc
            .emitter_positions
            .iter()
            .map(|&p| p + desc.emitter_offset)
            .collect();
        let emitter_directivities =
            checked_directivities("emitter", &desc.emitter_directivities, emitter_positions.len());

        let base_directivities = checked_directivities(
            "receiver",
            &desc.receiver_directivities,
            desc.receiver_positions.len(),
        );
        let offsets = desc
            .receiver_pattern
            .map(|pattern| pattern.offsets())
            .unwrap_or_else(|| vec![Vec3::ZERO]);
        let mut receiver_positions = Vec::with_capacity(desc.receiver_positions.len() * offsets.len());
        let mut receiver_directivities = base_directivities.as_ref().map(|_| Vec::new());
        for (index, &base) in desc.receiver_positions.iter().enumerate() {
            for &offset in &offsets {
                receiver_positions.push(base + desc.receiver_offset + offset);
                if let (Some(out), Some(blends)) = (&mut receiver_directivities, &base_directivities)
                {
                    out.push(blends[index]);
                }
            }
        }

        let mut profiles = ProfileTable::new(desc.frequency_count);
        for profile in &desc.profiles {
            profiles.add(profile)?;
        }

        Ok(Self {
            frequencies,
            default_signal_indexes: default_signal_indexes(desc, emitter_positions.len()),
            emitter_positions,
            emitter_directivities,
            receiver_positions,
            receiver_directivities,
            rays: RaySet::generate(desc.initial_rays, &desc.field_of_view),
            profiles,
        })
    }
}

/// Directivity blends clamped to [0, 1]. A count mismatch disables directivity
/// for every element rather than guessing which entry belongs where.
fn checked_directivities(kind: &str, values: &Option<Vec<f32>>, count: usize) -> Option<Vec<f32>> {
    let values = values.as_ref()?;
    if values.len() != count {
        log::error!(
            "{} {} directivities given for {} {}s, using omnidirectional patterns",
            values.len(),
            kind,
            count,
            kind
        );
        return Some(vec![0.0; count]);
    }
    Some(values.iter().map(|v| v.clamp(0.0, 1.0)).collect())
}

fn default_signal_indexes(desc: &SonoTraceDesc, emitter_count: usize) -> Vec<usize> {
    if !desc.default_signal_indexes.is_empty() && desc.default_signal_indexes.len() != emitter_count
    {
        log::warn!(
            "{} default signal indexes for {} emitters, missing entries use signal 0",
            desc.default_signal_indexes.len(),
            emitter_count
        );
    }
    (0..emitter_count)
        .map(|emitter| {
            let index = desc.default_signal_indexes.get(emitter).copied().unwrap_or(0);
            if index != 0 && index >= desc.emitter_signals.len() {
                log::error!(
                    "Default signal index {} of emitter {} is out of range ({} signals), using 0",
                    index,
                    emitter,
                    desc.emitter_signals.len()
                );
                0
            } else {
                index
            }
        })
        .collect()
}
