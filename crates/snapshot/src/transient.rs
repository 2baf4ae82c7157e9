//! Leader-side transient snapshots
//!
//! A transient snapshot is produced locally by a state-machine callback
//! writing files into a pending directory, then promoted atomically by
//! `persist`. Both steps run on the store's partition task; the handle
//! only carries the id and the shared state the task fills in.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{SnapshotError, SnapshotResult};
use crate::metadata::SnapshotId;
use crate::persisted::PersistedSnapshot;
use crate::store::{SnapshotStore, StoreCommand};

/// Callback that materializes the partition's state into the given
/// directory. Returning `false` discards the attempt.
pub type SnapshotWriter = Box<dyn FnOnce(&std::path::Path) -> bool + Send>;

#[derive(Debug, Default)]
pub(crate) struct TransientInner {
    /// Set by the partition task after a successful `take`.
    pub(crate) pending_dir: Option<PathBuf>,
    /// Aggregate checksum computed right after the writer finished; a
    /// deviation at persist time means the callback left a partial write
    /// behind.
    pub(crate) expected_checksum: u64,
}

/// A writable, uncommitted snapshot produced locally.
pub struct TransientSnapshot {
    id: SnapshotId,
    store: SnapshotStore,
    inner: Arc<Mutex<TransientInner>>,
}

impl TransientSnapshot {
    pub(crate) fn new(id: SnapshotId, store: SnapshotStore) -> Self {
        Self {
            id,
            store,
            inner: Arc::new(Mutex::new(TransientInner::default())),
        }
    }

    pub fn id(&self) -> SnapshotId {
        self.id
    }

    /// Run `writer` against a freshly allocated pending directory on the
    /// partition task. Resolves `Ok(false)` and purges the directory
    /// when the writer declines or panics.
    pub async fn take<F>(&self, writer: F) -> SnapshotResult<bool>
    where
        F: FnOnce(&std::path::Path) -> bool + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.store
            .send(StoreCommand::TakeTransient {
                id: self.id,
                inner: self.inner.clone(),
                writer: Box::new(writer),
                reply,
            })
            .await?;
        rx.await.map_err(|_| SnapshotError::Closed)?
    }

    /// Compute the aggregate checksum, write the sidecar and atomically
    /// promote the snapshot into the committed directory.
    ///
    /// # Panics
    ///
    /// Panics when called before a successful `take`; that is a broken
    /// caller contract, not a runtime condition.
    pub async fn persist(&self) -> SnapshotResult<PersistedSnapshot> {
        assert!(
            self.inner.lock().pending_dir.is_some(),
            "persist() without a taken snapshot"
        );

        let (reply, rx) = oneshot::channel();
        self.store
            .send(StoreCommand::PersistTransient {
                id: self.id,
                inner: self.inner.clone(),
                reply,
            })
            .await?;
        rx.await.map_err(|_| SnapshotError::Closed)?
    }

    /// Discard the snapshot and its pending directory. Idempotent.
    pub async fn abort(&self) -> SnapshotResult<()> {
        let (reply, rx) = oneshot::channel();
        self.store
            .send(StoreCommand::AbortTransient {
                inner: self.inner.clone(),
                reply,
            })
            .await?;
        rx.await.map_err(|_| SnapshotError::Closed)?
    }
}
