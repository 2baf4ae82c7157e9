//! Per-partition snapshot store factory
//!
//! The broker creates one snapshot store per partition it replicates.
//! The factory resolves the on-disk layout under each partition root,
//! binds every store to a task on the shared runtime, and hands out the
//! capability view each consumer needs: followers get the receivable
//! view at creation, leaders fetch the narrower constructable view of
//! an already-created store.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::error::SnapshotResult;
use crate::store::{PartitionId, SnapshotStore};
use crate::traits::{ConstructableSnapshotStore, ReceivableSnapshotStore};

pub struct SnapshotStoreFactory {
    runtime: tokio::runtime::Handle,
    node_id: u32,
    stores: RwLock<HashMap<PartitionId, SnapshotStore>>,
}

impl SnapshotStoreFactory {
    pub fn new(runtime: tokio::runtime::Handle, node_id: u32) -> Self {
        Self {
            runtime,
            node_id,
            stores: RwLock::new(HashMap::new()),
        }
    }

    /// Open (or recover) the store for a partition under `root` and
    /// spawn its task. The returned view is what the follower-side
    /// replication machinery consumes.
    pub fn create_receivable_snapshot_store(
        &self,
        root: &Path,
        partition_id: PartitionId,
    ) -> SnapshotResult<Arc<dyn ReceivableSnapshotStore>> {
        let store = SnapshotStore::open(&self.runtime, root, partition_id)?;
        self.stores.write().insert(partition_id, store.clone());

        info!(
            "node {}: opened snapshot store for partition {} at {}",
            self.node_id,
            partition_id,
            root.display()
        );

        Ok(Arc::new(store))
    }

    /// Leader-side view of an already-created partition store.
    pub fn constructable_snapshot_store(
        &self,
        partition_id: PartitionId,
    ) -> Option<Arc<dyn ConstructableSnapshotStore>> {
        self.stores
            .read()
            .get(&partition_id)
            .cloned()
            .map(|store| Arc::new(store) as Arc<dyn ConstructableSnapshotStore>)
    }
}
