//! Raw intersection records written by trace backends.

use crate::error::{Result, SonoTraceError};
use crate::math::Vec3;
use bytemuck::{Pod, Zeroable};

/// Fixed capacity of the per-emitter distance array in every hit row.
pub const MAX_EMITTER_COUNT: usize = 32;

/// One ray × bounce slot of the hit buffer.
///
/// The layout is shared bit-for-bit with GPU backends: every field is four
/// bytes wide and booleans are stored as `u32` (0 or 1). Rows are laid out
/// row-major, `ray * max_bounces + bounce`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct RawHit {
    pub hit: u32,
    /// World hit position (cm)
    pub position: [f32; 3],
    /// Unit reflection axis, pointing away from the outgoing specular lobe
    pub reflection: [f32; 3],
    /// Index of the hit instance in the geometry snapshot used for the cycle
    pub scene_primitive_index: i32,
    pub triangle_index: i32,
    /// Path length travelled by the ray up to this bounce (cm)
    pub cumulative_distance: f32,
    pub line_of_sight_to_sensor: u32,
    /// Set on direct-path rows that reached the end of the ray unobstructed
    pub direct_path: i32,
    /// Path length from each emitter to this hit (cm)
    pub emitter_distances: [f32; MAX_EMITTER_COUNT],
}

impl RawHit {
    /// Size in bytes of a single row.
    pub const SIZE: usize = std::mem::size_of::<RawHit>();

    pub fn miss() -> Self {
        Self::zeroed()
    }

    pub fn is_hit(&self) -> bool {
        self.hit != 0
    }

    pub fn has_line_of_sight(&self) -> bool {
        self.line_of_sight_to_sensor != 0
    }

    pub fn is_direct_path(&self) -> bool {
        self.direct_path == 1
    }

    pub fn position(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }

    pub fn reflection(&self) -> Vec3 {
        Vec3::from_array(self.reflection)
    }

    /// Decodes a host readback of raw bytes into rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the byte count is not a whole number of rows
    pub fn rows_from_bytes(bytes: &[u8]) -> Result<Vec<RawHit>> {
        if bytes.len() % Self::SIZE != 0 {
            return Err(SonoTraceError::Backend(format!(
                "Readback of {} bytes is not a multiple of the {} byte hit row",
                bytes.len(),
                Self::SIZE
            )));
        }
        Ok(bytemuck::pod_collect_to_vec(bytes))
    }

    pub fn rows_as_bytes(rows: &[RawHit]) -> &[u8] {
        bytemuck::cast_slice(rows)
    }
}

impl Default for RawHit {
    fn default() -> Self {
        Self::miss()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn test_raw_hit_layout() {
        assert_eq!(RawHit::SIZE, 4 * (1 + 3 + 3 + 1 + 1 + 1 + 1 + 1 + MAX_EMITTER_COUNT));
        assert_eq!(offset_of!(RawHit, hit), 0);
        assert_eq!(offset_of!(RawHit, position), 4);
        assert_eq!(offset_of!(RawHit, reflection), 16);
        assert_eq!(offset_of!(RawHit, scene_primitive_index), 28);
        assert_eq!(offset_of!(RawHit, triangle_index), 32);
        assert_eq!(offset_of!(RawHit, cumulative_distance), 36);
        assert_eq!(offset_of!(RawHit, line_of_sight_to_sensor), 40);
        assert_eq!(offset_of!(RawHit, direct_path), 44);
        assert_eq!(offset_of!(RawHit, emitter_distances), 48);
    }

    #[test]
    fn test_raw_hit_miss() {
        let miss = RawHit::miss();
        assert!(!miss.is_hit());
        assert!(!miss.has_line_of_sight());
        assert!(!miss.is_direct_path());
        assert_eq!(RawHit::default(), miss);
    }

    #[test]
    fn test_rows_from_bytes() {
        let mut row = RawHit::miss();
        row.hit = 1;
        row.position = [1.0, 2.0, 3.0];
        row.emitter_distances[31] = 9.5;
        let rows = vec![row, RawHit::miss()];

        let decoded = RawHit::rows_from_bytes(RawHit::rows_as_bytes(&rows)).unwrap();
        assert_eq!(decoded, rows);
        assert_eq!(decoded[0].position(), Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_rows_from_truncated_bytes() {
        let bytes = vec![0u8; RawHit::SIZE + 3];
        assert!(RawHit::rows_from_bytes(&bytes).is_err());
    }
}
