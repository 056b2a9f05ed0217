pub mod array_pattern;
pub mod desc;
pub mod generated;
pub mod profile;

pub use array_pattern::{ArrayPlane, Lattice, ReceiverArrayPattern};
pub use desc::{CurvatureSettings, CurvatureSizeScaler, FieldOfView, SonoTraceDesc, StaticReceivers};
pub use generated::GeneratedInputs;
pub use profile::{
    ObjectProfile, ProfileParameters, ProfileTable, ResolvedProfile, SIGMOID_SLOPE_MULTIPLIER,
};
