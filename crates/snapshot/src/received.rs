//! Follower-side received snapshots
//!
//! A received snapshot is populated chunk-by-chunk from a remote
//! sender. The state machine is `Empty → Writing → (Persisted |
//! Aborted)`; transitions are driven exclusively by `apply`, `persist`
//! and `abort`, all of which execute on the store's partition task.
//!
//! Chunk rejections are reported as `Ok(false)` rather than errors: the
//! stream may be retried by the sender, and earlier accepted chunks stay
//! on disk until the receiver either persists or aborts.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::chunk::SnapshotChunk;
use crate::error::{SnapshotError, SnapshotResult};
use crate::metadata::SnapshotId;
use crate::persisted::PersistedSnapshot;
use crate::store::{SnapshotStore, StoreCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReceivedStage {
    Empty,
    Writing,
    Persisted,
    Aborted,
}

#[derive(Debug)]
pub(crate) struct ReceivedInner {
    pub(crate) stage: ReceivedStage,
    pub(crate) pending_dir: Option<PathBuf>,
    /// Expectations recorded from the first accepted chunk; every later
    /// chunk must agree with them.
    pub(crate) expected_total: u32,
    pub(crate) expected_checksum: u64,
    /// Committed handle, cached once persist succeeded.
    pub(crate) persisted: Option<PersistedSnapshot>,
}

impl Default for ReceivedInner {
    fn default() -> Self {
        Self {
            stage: ReceivedStage::Empty,
            pending_dir: None,
            expected_total: 0,
            expected_checksum: 0,
            persisted: None,
        }
    }
}

/// A writable, uncommitted snapshot populated from a remote chunk
/// stream.
pub struct ReceivedSnapshot {
    id: SnapshotId,
    store: SnapshotStore,
    inner: Arc<Mutex<ReceivedInner>>,
}

impl ReceivedSnapshot {
    pub(crate) fn new(id: SnapshotId, store: SnapshotStore) -> Self {
        Self {
            id,
            store,
            inner: Arc::new(Mutex::new(ReceivedInner::default())),
        }
    }

    pub fn id(&self) -> SnapshotId {
        self.id
    }

    /// Validate and write one chunk.
    ///
    /// Returns `Ok(false)` when the chunk is unacceptable (identity,
    /// count, or checksum disagrees with the first accepted chunk, or
    /// the content fails its CRC); previously written chunks are kept. A
    /// duplicate of an already-written chunk succeeds without rewriting.
    ///
    /// # Panics
    ///
    /// Panics when the snapshot was already persisted or aborted.
    pub async fn apply(&self, chunk: SnapshotChunk) -> SnapshotResult<bool> {
        {
            let stage = self.inner.lock().stage;
            assert!(
                stage == ReceivedStage::Empty || stage == ReceivedStage::Writing,
                "chunk applied to a snapshot that was already persisted or aborted"
            );
        }

        let (reply, rx) = oneshot::channel();
        self.store
            .send(StoreCommand::ApplyChunk {
                id: self.id,
                inner: self.inner.clone(),
                chunk,
                reply,
            })
            .await?;
        rx.await.map_err(|_| SnapshotError::Closed)?
    }

    /// Verify completeness and content integrity, then atomically
    /// promote the snapshot. Converges with concurrent receivers of the
    /// same id: whoever persists first wins the rename, later calls
    /// return the already-committed handle.
    ///
    /// # Panics
    ///
    /// Panics when the snapshot was aborted.
    pub async fn persist(&self) -> SnapshotResult<PersistedSnapshot> {
        {
            let inner = self.inner.lock();
            assert!(
                inner.stage != ReceivedStage::Aborted,
                "persist() called on an aborted snapshot"
            );
            if let Some(persisted) = &inner.persisted {
                return Ok(persisted.clone());
            }
        }

        let (reply, rx) = oneshot::channel();
        self.store
            .send(StoreCommand::PersistReceived {
                id: self.id,
                inner: self.inner.clone(),
                reply,
            })
            .await?;
        rx.await.map_err(|_| SnapshotError::Closed)?
    }

    /// Discard the pending directory. Idempotent; aborting after a
    /// successful persist leaves the committed snapshot untouched.
    pub async fn abort(&self) -> SnapshotResult<()> {
        let (reply, rx) = oneshot::channel();
        self.store
            .send(StoreCommand::AbortReceived {
                inner: self.inner.clone(),
                reply,
            })
            .await?;
        rx.await.map_err(|_| SnapshotError::Closed)?
    }
}
