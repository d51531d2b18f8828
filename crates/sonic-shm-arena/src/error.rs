//! Error types for shared arena operations.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::layout::{ArenaIndex, ObjectType};

/// Shared arena errors.
///
/// `ResourceExhausted`, `NotFound` and `NotInUse` are ordinary results for
/// the caller to act on. `Corrupted` condemns one slot only. The segment
/// and layout variants mean the arena itself is unusable.
#[derive(Debug, Error)]
pub enum ArenaError {
    /// Every slot of the type is in use.
    #[error("No free slot for {object_type} (capacity {capacity})")]
    ResourceExhausted {
        object_type: ObjectType,
        capacity: u32,
    },

    /// Slot header failed validation.
    #[error("Slot {index} is corrupted: {detail}")]
    Corrupted { index: ArenaIndex, detail: String },

    /// Index out of range, unregistered type, or predicate miss.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Stale reference or double free.
    #[error("Slot {0} is not in use")]
    NotInUse(ArenaIndex),

    /// Payload could not be encoded into or decoded from its slot.
    #[error("Codec error at {index}: {message}")]
    Codec { index: ArenaIndex, message: String },

    #[error("Invalid segment layout: {0}")]
    Layout(String),

    /// The segment on disk was laid out for different types or capacities.
    #[error("Segment layout mismatch: {0}")]
    LayoutMismatch(String),

    #[error("Segment {path}: {source}")]
    Segment {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ArenaError {
    pub(crate) fn segment(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ArenaError::Segment {
            path: path.into(),
            source,
        }
    }

    /// Returns true if the whole segment, not one slot, is unusable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ArenaError::Layout(_) | ArenaError::LayoutMismatch(_) | ArenaError::Segment { .. }
        )
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, ArenaError::Corrupted { .. })
    }
}

/// Result type for shared arena operations.
pub type ArenaResult<T> = std::result::Result<T, ArenaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let index = ArenaIndex::new(ObjectType::new(3), 7);
        let err = ArenaError::NotInUse(index);
        assert_eq!(err.to_string(), "Slot type 3:7 is not in use");
    }

    #[test]
    fn test_terminal_classification() {
        assert!(ArenaError::Layout("zero capacity".into()).is_terminal());
        assert!(!ArenaError::NotFound("x".into()).is_terminal());

        let err = ArenaError::Corrupted {
            index: ArenaIndex::new(ObjectType::new(1), 0),
            detail: "canary".into(),
        };
        assert!(err.is_corruption());
        assert!(!err.is_terminal());
    }
}
