//! Consumer-facing capability views
//!
//! The snapshot store is handed to its two consumers through restricted
//! views: the leader side constructs local snapshots, the follower side
//! receives remote ones. Both observe the committed snapshot and may
//! register promotion listeners. Methods returning futures complete on
//! the store's partition task.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SnapshotResult;
use crate::persisted::PersistedSnapshot;
use crate::received::ReceivedSnapshot;
use crate::transient::TransientSnapshot;

/// Observer of snapshot promotion.
///
/// Invoked on the partition task, in registration order, after a
/// snapshot becomes the committed one. Callbacks never overlap with
/// another store mutation, so each listener observes strictly monotone
/// progress.
pub trait PersistedSnapshotListener: Send + Sync {
    fn on_new_snapshot(&self, snapshot: &PersistedSnapshot);
}

/// Leader-side view: take local snapshots.
#[async_trait]
pub trait ConstructableSnapshotStore: Send + Sync {
    /// Begin a local transient snapshot. Returns `None` when the id is
    /// not strictly newer than the committed snapshot.
    fn new_transient_snapshot(
        &self,
        index: u64,
        term: u64,
        processed_position: u64,
        exported_position: u64,
    ) -> Option<TransientSnapshot>;

    fn current_snapshot(&self) -> Option<PersistedSnapshot>;

    async fn add_snapshot_listener(
        &self,
        listener: Arc<dyn PersistedSnapshotListener>,
    ) -> SnapshotResult<()>;

    async fn remove_snapshot_listener(
        &self,
        listener: Arc<dyn PersistedSnapshotListener>,
    ) -> SnapshotResult<()>;
}

/// Follower-side view: receive snapshots streamed by a leader.
#[async_trait]
pub trait ReceivableSnapshotStore: Send + Sync {
    /// Begin receiving the snapshot with the given textual id. No disk
    /// state is created until the first chunk is applied.
    fn new_received_snapshot(&self, id: &str) -> SnapshotResult<ReceivedSnapshot>;

    /// Remove every pending directory that does not belong to the
    /// committed snapshot. Never touches committed state.
    async fn purge_pending_snapshots(&self) -> SnapshotResult<()>;

    fn current_snapshot(&self) -> Option<PersistedSnapshot>;

    async fn add_snapshot_listener(
        &self,
        listener: Arc<dyn PersistedSnapshotListener>,
    ) -> SnapshotResult<()>;

    async fn remove_snapshot_listener(
        &self,
        listener: Arc<dyn PersistedSnapshotListener>,
    ) -> SnapshotResult<()>;

    /// Drain outstanding operations and stop the partition task.
    async fn close(&self) -> SnapshotResult<()>;
}
