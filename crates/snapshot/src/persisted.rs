//! Committed snapshot handles

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::chunk::SnapshotChunkReader;
use crate::error::SnapshotResult;
use crate::metadata::SnapshotId;

/// Immutable handle onto a committed snapshot directory.
///
/// Clones are cheap and share one underlying handle. The handle keeps
/// the directory alive: when the store supersedes the snapshot it marks
/// the handle retired, and the directory is deleted only once the last
/// clone is dropped. A reader holding a handle therefore never observes
/// the files underneath it vanishing.
#[derive(Debug, Clone)]
pub struct PersistedSnapshot {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    id: SnapshotId,
    path: PathBuf,
    checksum: u64,
    retired: AtomicBool,
}

impl PersistedSnapshot {
    pub(crate) fn new(id: SnapshotId, path: PathBuf, checksum: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                path,
                checksum,
                retired: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> SnapshotId {
        self.inner.id
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Aggregate CRC32C over the snapshot's state files, as stored in
    /// the checksum sidecar.
    pub fn checksum(&self) -> u64 {
        self.inner.checksum
    }

    /// Stream this snapshot as chunks in ascending filename order. The
    /// reader clones this handle, keeping the directory alive until the
    /// stream is dropped.
    pub fn chunk_reader(&self) -> SnapshotResult<SnapshotChunkReader> {
        SnapshotChunkReader::new(self.clone())
    }

    /// Mark the directory for deletion once no handle refers to it
    /// anymore. Called by the store after a newer snapshot is durable.
    pub(crate) fn retire(&self) {
        self.inner.retired.store(true, Ordering::Release);
    }
}

impl PartialEq for PersistedSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id() && self.checksum() == other.checksum()
    }
}

impl Eq for PersistedSnapshot {}

impl Drop for Inner {
    fn drop(&mut self) {
        if !self.retired.load(Ordering::Acquire) {
            return;
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => debug!("removed superseded snapshot directory {}", self.path.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                "failed to remove superseded snapshot directory {}: {}",
                self.path.display(),
                err
            ),
        }
    }
}
