//! Control-plane error taxonomy.

use crate::deps::DeviceMapperError;
use crate::state::UpdateState;
use thiserror::Error;

/// Result alias for control-plane operations.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Control-plane failures. Resource errors abort the triggering operation
/// and leave prior state untouched; consistency problems surface through
/// the update state machine (Cancelled, MergeFailed), not through this
/// enum.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Filesystem I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted record (de)serialization failure
    #[error("Record error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Shared error taxonomy (space, corruption, format)
    #[error(transparent)]
    Core(#[from] snapmerge_core::Error),

    /// Device-mapper collaborator failure
    #[error("Device mapper: {0}")]
    DeviceMapper(#[from] DeviceMapperError),

    /// Daemon-side merge failure
    #[error("Merge: {0}")]
    Merge(#[from] snapmerge_daemon::MergeError),

    /// Overlay parse failure
    #[error("Overlay: {0}")]
    Cow(#[from] snapmerge_cow::CowParseError),

    /// Operation not allowed in the current update state
    #[error("Operation {op} not allowed in state {state:?}")]
    InvalidState {
        /// Operation that was refused
        op: &'static str,
        /// Update state at the time
        state: UpdateState,
    },

    /// Snapshot bookkeeping is missing or inconsistent
    #[error("Unknown snapshot: {0}")]
    UnknownSnapshot(String),
}
