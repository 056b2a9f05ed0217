pub mod acoustics;
pub mod geometry;
pub mod mesh;
pub mod registry;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use acoustics::MeshAcousticData;
pub use geometry::{GeometryHit, GeometryInstance, SceneGeometry, ray_triangle_intersection};
pub use mesh::TriangleMesh;
pub use registry::{
    MeshDataSettings, MeshInstanceDesc, MeshLoader, MeshSource, Registration, RetryReport,
    SceneRegistry,
};

/// Scene-lifetime identifier of a mesh instance.
///
/// Unlike the scene primitive index written into hit rows, this id does not
/// change when other instances are added or removed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PersistentPrimitiveId(pub u64);

impl fmt::Display for PersistentPrimitiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Primitive({})", self.0)
    }
}

/// Display label and profile index of a hit-able object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectIdentity {
    pub label: String,
    pub object_type: usize,
}

impl ObjectIdentity {
    pub const UNKNOWN_LABEL: &'static str = "UNKNOWN";

    pub fn new(label: impl Into<String>, object_type: usize) -> Self {
        Self {
            label: label.into(),
            object_type,
        }
    }

    /// Placeholder for hits that cannot be resolved to an object.
    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN_LABEL, 0)
    }

    pub fn is_unknown(&self) -> bool {
        self.label == Self::UNKNOWN_LABEL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mobility {
    #[default]
    Static,
    Dynamic,
}
