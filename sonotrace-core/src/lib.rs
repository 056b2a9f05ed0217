//! Acoustic ray tracing for simulated sonar sensors.
//!
//! A [`SonoTraceSession`] samples ray directions over the sensor's field of
//! view, hands them to a [`TraceBackend`], parses the per-bounce hits into
//! reflection points and computes specular, diffraction and direct-path
//! strengths for every emitter, receiver and frequency.

pub mod config;
pub mod error;
pub mod events;
pub mod math;
pub mod output;
pub mod parser;
pub mod propagation;
pub mod sampling;
pub mod scene;
pub mod session;
pub mod trace;

pub use config::{FieldOfView, ObjectProfile, ProfileParameters, SonoTraceDesc, StaticReceivers};
pub use error::{Result, SonoTraceError};
pub use events::SonoTraceEvent;
pub use output::{PointKind, ReflectedPoint, SimulationOutput, StrengthMatrix, SubOutput};
pub use scene::{
    MeshInstanceDesc, Mobility, ObjectIdentity, PersistentPrimitiveId, Registration,
    SceneRegistry, TriangleMesh,
};
pub use session::{CoordinateSpace, SonoTraceSession};
pub use trace::{
    CpuTraceBackend, CycleHandle, InlineTraceBackend, RawHit, RunMode, RunState, TraceBackend,
    TracePoll, TraceRequest,
};
