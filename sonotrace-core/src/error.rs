//! Error types for SonoTrace

use crate::scene::PersistentPrimitiveId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SonoTraceError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid mesh: {0}")]
    InvalidMesh(String),

    #[error("Object {0} is already registered")]
    DuplicateObject(PersistentPrimitiveId),

    #[error("Object {0} is not registered")]
    UnknownObject(PersistentPrimitiveId),

    #[error("Invalid {kind} index {index} (count: {len})")]
    InvalidIndex {
        kind: &'static str,
        index: usize,
        len: usize,
    },

    #[error("Invalid emitter signal override: {0}")]
    InvalidSignalOverride(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Trace backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, SonoTraceError>;
