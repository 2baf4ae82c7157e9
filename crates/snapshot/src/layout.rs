//! On-disk layout of a partition's snapshot storage
//!
//! Two directories live under the partition root and are owned
//! exclusively by the store:
//!
//! ```text
//! snapshots/            # at most one committed snapshot directory
//!   <id>/
//! pending/              # in-flight receptions and local takes
//!   <id>-<seq>/
//! ```
//!
//! Content only ever enters `snapshots/` through [`SnapshotLayout::commit`],
//! which fsyncs the pending tree, renames it in one atomic step, and
//! fsyncs the parent. A crash at any point therefore leaves either the
//! old committed state or the new one, never a mix.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::SnapshotResult;
use crate::metadata::SnapshotId;

/// Name of the committed snapshots directory under the partition root.
pub const SNAPSHOTS_DIRECTORY: &str = "snapshots";
/// Name of the pending snapshots directory under the partition root.
pub const PENDING_DIRECTORY: &str = "pending";

#[derive(Debug, Clone)]
pub struct SnapshotLayout {
    snapshots_dir: PathBuf,
    pending_dir: PathBuf,
}

impl SnapshotLayout {
    /// Bind to a partition root, creating `snapshots/` and `pending/` if
    /// absent.
    pub fn new(root: &Path) -> SnapshotResult<Self> {
        let snapshots_dir = root.join(SNAPSHOTS_DIRECTORY);
        let pending_dir = root.join(PENDING_DIRECTORY);
        fs::create_dir_all(&snapshots_dir)?;
        fs::create_dir_all(&pending_dir)?;

        Ok(Self {
            snapshots_dir,
            pending_dir,
        })
    }

    pub fn snapshots_dir(&self) -> &Path {
        &self.snapshots_dir
    }

    pub fn pending_dir(&self) -> &Path {
        &self.pending_dir
    }

    /// Reserve a pending path `pending/<id>-<n>` where `n` is the
    /// smallest positive ordinal not yet on disk. The caller creates the
    /// directory; allocation and creation race-free because both happen
    /// on the partition task.
    pub fn allocate_pending_path(&self, id: &SnapshotId) -> PathBuf {
        let mut seq = 1u32;
        loop {
            let path = self.pending_dir.join(format!("{}-{}", id, seq));
            if !path.exists() {
                return path;
            }
            seq += 1;
        }
    }

    /// Atomically promote a pending directory to `snapshots/<final_name>`.
    ///
    /// On any error the pending directory is left intact so the caller
    /// can inspect or retry.
    pub fn commit(&self, pending: &Path, final_name: &str) -> SnapshotResult<PathBuf> {
        let target = self.snapshots_dir.join(final_name);

        sync_directory(pending)?;
        fs::rename(pending, &target)?;
        sync_dir_entry(&self.snapshots_dir)?;

        Ok(target)
    }

    /// Best-effort recursive delete; failures are logged and swallowed.
    pub fn purge(&self, path: &Path) {
        let result = if path.is_dir() {
            fs::remove_dir_all(path)
        } else if path.exists() {
            fs::remove_file(path)
        } else {
            return;
        };

        if let Err(err) = result {
            warn!("failed to purge {}: {}", path.display(), err);
        }
    }
}

/// Fsync every regular file in a directory, then the directory itself.
fn sync_directory(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            File::open(entry.path())?.sync_all()?;
        }
    }
    sync_dir_entry(dir)
}

fn sync_dir_entry(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}
