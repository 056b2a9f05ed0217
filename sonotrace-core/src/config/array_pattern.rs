//! Virtual receiver arrays laid out on a disc around each configured receiver.

use crate::error::{Result, SonoTraceError};
use crate::math::Vec3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lattice {
    Square,
    #[default]
    Hexagonal,
}

/// Sensor-local plane the array disc lies in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArrayPlane {
    #[default]
    YZ,
    XZ,
    XY,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReceiverArrayPattern {
    /// Distance between neighbouring elements (cm)
    pub spacing: f32,
    /// Radius of the disc holding the elements (cm)
    pub radius: f32,
    pub lattice: Lattice,
    pub plane: ArrayPlane,
}

impl Default for ReceiverArrayPattern {
    fn default() -> Self {
        Self {
            spacing: 1.25,
            radius: 1.25,
            lattice: Lattice::Hexagonal,
            plane: ArrayPlane::YZ,
        }
    }
}

impl ReceiverArrayPattern {
    pub(crate) fn validate(&self) -> Result<()> {
        if !(self.spacing > 0.0 && self.radius >= 0.0) {
            return Err(SonoTraceError::Configuration(format!(
                "Receiver array needs positive spacing and non-negative radius, got {:?}",
                self
            )));
        }
        Ok(())
    }

    /// Offsets (cm) of every array element relative to the array centre.
    pub fn offsets(&self) -> Vec<Vec3> {
        let (row_step, column_step) = match self.lattice {
            Lattice::Square => (self.spacing, self.spacing),
            Lattice::Hexagonal => (3.0_f32.sqrt() / 2.0 * self.spacing, self.spacing),
        };
        let rows = (self.radius / row_step).floor() as i32;
        let mut offsets = Vec::new();

        for row in -rows..=rows {
            let v = row_step * row as f32;
            let half_width = (self.radius * self.radius - v * v).max(0.0).sqrt();

            let staggered = self.lattice == Lattice::Hexagonal && row % 2 != 0;
            let columns: Vec<f32> = if staggered {
                let count = ((half_width - column_step / 2.0) / column_step).floor() as i32;
                (-count - 1..=count)
                    .map(|column| (column as f32 + 0.5) * column_step)
                    .filter(|u| u.abs() <= half_width + 1e-5)
                    .collect()
            } else {
                let count = (half_width / column_step).floor() as i32;
                (-count..=count)
                    .map(|column| column as f32 * column_step)
                    .collect()
            };

            offsets.extend(columns.into_iter().map(|u| match self.plane {
                ArrayPlane::YZ => Vec3::new(0.0, -u, v),
                ArrayPlane::XZ => Vec3::new(-u, 0.0, v),
                ArrayPlane::XY => Vec3::new(-u, v, 0.0),
            }));
        }

        log::debug!(
            "Receiver array pattern expands each receiver into {} virtual receivers",
            offsets.len()
        );
        offsets
    }
}
