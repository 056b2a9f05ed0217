//! Trace cycle scheduling and the ray-intersection backends.

pub mod backend;
pub mod cpu;
pub mod dispatcher;
pub mod raw_hit;

pub use backend::{CycleHandle, SENSOR_CONFIG_LEN, SensorConfig, TraceBackend, TracePoll, TraceRequest};
pub use cpu::{CpuTraceBackend, InlineTraceBackend, trace_rays};
pub use dispatcher::{ParseGuard, ReadbackView, RunMode, RunState, TraceDispatcher};
pub use raw_hit::{MAX_EMITTER_COUNT, RawHit};
