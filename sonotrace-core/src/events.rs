//! Event types for SonoTrace

use crate::scene::PersistentPrimitiveId;

#[derive(Debug, Clone, PartialEq)]
pub enum SonoTraceEvent {
    CycleDispatched {
        cycle: u64,
        rays: usize,
    },
    CycleParsed {
        cycle: u64,
        points: usize,
    },
    OutputReady {
        cycle: u64,
        points: usize,
        maximum_strength: f32,
    },
    ObjectRegistered {
        id: PersistentPrimitiveId,
        label: String,
    },
    ObjectRegistrationFailed {
        id: PersistentPrimitiveId,
        error: String,
    },
    ReadbackSizeMismatch {
        cycle: u64,
        expected: usize,
        actual: usize,
    },
    TriggerRejected {
        reason: String,
    },
}

impl SonoTraceEvent {
    pub fn cycle(&self) -> Option<u64> {
        match self {
            Self::CycleDispatched { cycle, .. }
            | Self::CycleParsed { cycle, .. }
            | Self::OutputReady { cycle, .. }
            | Self::ReadbackSizeMismatch { cycle, .. } => Some(*cycle),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::ObjectRegistrationFailed { .. }
                | Self::ReadbackSizeMismatch { .. }
                | Self::TriggerRejected { .. }
        )
    }

    pub fn is_object_event(&self) -> bool {
        matches!(
            self,
            Self::ObjectRegistered { .. } | Self::ObjectRegistrationFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_predicates() {
        let parsed = SonoTraceEvent::CycleParsed { cycle: 3, points: 10 };
        assert_eq!(parsed.cycle(), Some(3));
        assert!(!parsed.is_error());

        let mismatch = SonoTraceEvent::ReadbackSizeMismatch {
            cycle: 4,
            expected: 12,
            actual: 6,
        };
        assert!(mismatch.is_error());
        assert_eq!(mismatch.cycle(), Some(4));

        let failed = SonoTraceEvent::ObjectRegistrationFailed {
            id: PersistentPrimitiveId(2),
            error: "mesh never loaded".into(),
        };
        assert!(failed.is_error());
        assert!(failed.is_object_event());
        assert_eq!(failed.cycle(), None);
    }
}
