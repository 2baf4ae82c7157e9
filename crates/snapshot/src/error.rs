//! Snapshot engine error types

use crate::metadata::SnapshotId;

/// Errors surfaced by snapshot store operations.
///
/// Chunk-level rejections (bad checksum, identity mismatch) are not
/// errors: `apply` reports them as `Ok(false)` so the caller can retry
/// with a corrected stream or abort.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// Snapshot content failed verification (missing files, mismatched
    /// aggregate checksum). The pending directory is left on disk for
    /// inspection; a subsequent `abort` clears it.
    #[error("corrupted snapshot: {0}")]
    CorruptedSnapshot(String),

    /// Filesystem failure; the operation failed and may be retried at a
    /// higher layer.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Name could not be parsed as a snapshot identifier.
    #[error("invalid snapshot id: {0:?}")]
    InvalidId(String),

    /// A strictly newer snapshot was committed before this one could be
    /// persisted.
    #[error("snapshot {0} superseded by committed snapshot {1}")]
    Superseded(SnapshotId, SnapshotId),

    /// The store's partition task has been closed.
    #[error("snapshot store is closed")]
    Closed,
}

pub type SnapshotResult<T> = Result<T, SnapshotError>;
