//! Partition-scoped snapshot store
//!
//! One store exists per partition. All state mutation is serialized on
//! a single cooperative task: the store handle posts commands into a
//! bounded mailbox, the partition task drains it, and callers await the
//! completion through a oneshot. No two mutating operations ever run
//! concurrently for the same store, which is what upholds the
//! at-most-one-committed and monotonicity invariants without locks on
//! the hot path. File I/O is performed inline on the partition task;
//! blocking it is part of the model.
//!
//! Readers are exempt from the mailbox: the committed snapshot lives in
//! a shared cell that `current_snapshot` reads without blocking
//! writers.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::checksum;
use crate::chunk::SnapshotChunk;
use crate::error::{SnapshotError, SnapshotResult};
use crate::layout::SnapshotLayout;
use crate::metadata::{self, SnapshotId};
use crate::persisted::PersistedSnapshot;
use crate::received::{ReceivedInner, ReceivedSnapshot, ReceivedStage};
use crate::traits::{
    ConstructableSnapshotStore, PersistedSnapshotListener, ReceivableSnapshotStore,
};
use crate::transient::{SnapshotWriter, TransientInner, TransientSnapshot};

/// Command mailbox capacity (provides backpressure towards producers).
const COMMAND_CHANNEL_CAPACITY: usize = 1024;

pub type PartitionId = u32;

/// Commands executed on the partition task.
pub(crate) enum StoreCommand {
    TakeTransient {
        id: SnapshotId,
        inner: Arc<Mutex<TransientInner>>,
        writer: SnapshotWriter,
        reply: oneshot::Sender<SnapshotResult<bool>>,
    },
    PersistTransient {
        id: SnapshotId,
        inner: Arc<Mutex<TransientInner>>,
        reply: oneshot::Sender<SnapshotResult<PersistedSnapshot>>,
    },
    AbortTransient {
        inner: Arc<Mutex<TransientInner>>,
        reply: oneshot::Sender<SnapshotResult<()>>,
    },
    ApplyChunk {
        id: SnapshotId,
        inner: Arc<Mutex<ReceivedInner>>,
        chunk: SnapshotChunk,
        reply: oneshot::Sender<SnapshotResult<bool>>,
    },
    PersistReceived {
        id: SnapshotId,
        inner: Arc<Mutex<ReceivedInner>>,
        reply: oneshot::Sender<SnapshotResult<PersistedSnapshot>>,
    },
    AbortReceived {
        inner: Arc<Mutex<ReceivedInner>>,
        reply: oneshot::Sender<SnapshotResult<()>>,
    },
    PurgePending {
        reply: oneshot::Sender<SnapshotResult<()>>,
    },
    AddListener(Arc<dyn PersistedSnapshotListener>),
    RemoveListener(Arc<dyn PersistedSnapshotListener>),
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Handle onto a partition's snapshot store. Cheap to clone; all clones
/// feed the same partition task.
#[derive(Clone)]
pub struct SnapshotStore {
    partition_id: PartitionId,
    commands: mpsc::Sender<StoreCommand>,
    current: Arc<RwLock<Option<PersistedSnapshot>>>,
}

impl SnapshotStore {
    /// Open the store under the given partition root: recover the
    /// committed snapshot from disk, clean up leftovers, and spawn the
    /// partition task on `runtime`.
    ///
    /// Refuses to open when the most recent committed snapshot fails its
    /// checksum verification.
    pub(crate) fn open(
        runtime: &tokio::runtime::Handle,
        root: &Path,
        partition_id: PartitionId,
    ) -> SnapshotResult<Self> {
        let layout = SnapshotLayout::new(root)?;
        let current = recover(&layout, partition_id)?;
        let current = Arc::new(RwLock::new(current));

        let (commands, mailbox) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let actor = StoreActor {
            partition_id,
            layout,
            current: current.clone(),
            listeners: Vec::new(),
            mailbox,
        };
        runtime.spawn(actor.run());

        Ok(Self {
            partition_id,
            commands,
            current,
        })
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    /// The committed snapshot, if any. Never blocks on in-flight
    /// mutations.
    pub fn current_snapshot(&self) -> Option<PersistedSnapshot> {
        self.current.read().clone()
    }

    /// Begin a local transient snapshot; rejected unless the id is
    /// strictly newer than the committed one.
    pub fn new_transient_snapshot(
        &self,
        index: u64,
        term: u64,
        processed_position: u64,
        exported_position: u64,
    ) -> Option<TransientSnapshot> {
        let id = SnapshotId::new(index, term, processed_position, exported_position);

        if let Some(current) = self.current_snapshot() {
            if id <= current.id() {
                debug!(
                    "rejecting transient snapshot {}, not newer than committed {}",
                    id,
                    current.id()
                );
                return None;
            }
        }

        Some(TransientSnapshot::new(id, self.clone()))
    }

    /// Begin receiving a remote snapshot. Creates no disk state; the
    /// pending directory appears with the first applied chunk.
    pub fn new_received_snapshot(&self, id: &str) -> SnapshotResult<ReceivedSnapshot> {
        let id = id.parse::<SnapshotId>()?;
        Ok(ReceivedSnapshot::new(id, self.clone()))
    }

    /// Remove pending directories that do not belong to the committed
    /// snapshot.
    pub async fn purge_pending_snapshots(&self) -> SnapshotResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::PurgePending { reply }).await?;
        rx.await.map_err(|_| SnapshotError::Closed)?
    }

    pub async fn add_snapshot_listener(
        &self,
        listener: Arc<dyn PersistedSnapshotListener>,
    ) -> SnapshotResult<()> {
        self.send(StoreCommand::AddListener(listener)).await
    }

    pub async fn remove_snapshot_listener(
        &self,
        listener: Arc<dyn PersistedSnapshotListener>,
    ) -> SnapshotResult<()> {
        self.send(StoreCommand::RemoveListener(listener)).await
    }

    /// Drain outstanding commands and stop the partition task. Later
    /// operations fail with [`SnapshotError::Closed`].
    pub async fn close(&self) -> SnapshotResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::Close { reply }).await?;
        rx.await.map_err(|_| SnapshotError::Closed)
    }

    pub(crate) async fn send(&self, command: StoreCommand) -> SnapshotResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SnapshotError::Closed)
    }
}

#[async_trait]
impl ConstructableSnapshotStore for SnapshotStore {
    fn new_transient_snapshot(
        &self,
        index: u64,
        term: u64,
        processed_position: u64,
        exported_position: u64,
    ) -> Option<TransientSnapshot> {
        SnapshotStore::new_transient_snapshot(self, index, term, processed_position, exported_position)
    }

    fn current_snapshot(&self) -> Option<PersistedSnapshot> {
        SnapshotStore::current_snapshot(self)
    }

    async fn add_snapshot_listener(
        &self,
        listener: Arc<dyn PersistedSnapshotListener>,
    ) -> SnapshotResult<()> {
        SnapshotStore::add_snapshot_listener(self, listener).await
    }

    async fn remove_snapshot_listener(
        &self,
        listener: Arc<dyn PersistedSnapshotListener>,
    ) -> SnapshotResult<()> {
        SnapshotStore::remove_snapshot_listener(self, listener).await
    }
}

#[async_trait]
impl ReceivableSnapshotStore for SnapshotStore {
    fn new_received_snapshot(&self, id: &str) -> SnapshotResult<ReceivedSnapshot> {
        SnapshotStore::new_received_snapshot(self, id)
    }

    async fn purge_pending_snapshots(&self) -> SnapshotResult<()> {
        SnapshotStore::purge_pending_snapshots(self).await
    }

    fn current_snapshot(&self) -> Option<PersistedSnapshot> {
        SnapshotStore::current_snapshot(self)
    }

    async fn add_snapshot_listener(
        &self,
        listener: Arc<dyn PersistedSnapshotListener>,
    ) -> SnapshotResult<()> {
        SnapshotStore::add_snapshot_listener(self, listener).await
    }

    async fn remove_snapshot_listener(
        &self,
        listener: Arc<dyn PersistedSnapshotListener>,
    ) -> SnapshotResult<()> {
        SnapshotStore::remove_snapshot_listener(self, listener).await
    }

    async fn close(&self) -> SnapshotResult<()> {
        SnapshotStore::close(self).await
    }
}

/// Recover the committed snapshot on open: keep the greatest parsable
/// directory under `snapshots/` after verifying its checksum, purge
/// everything else there and the whole of `pending/`.
fn recover(
    layout: &SnapshotLayout,
    partition_id: PartitionId,
) -> SnapshotResult<Option<PersistedSnapshot>> {
    let mut latest: Option<(SnapshotId, PathBuf)> = None;
    let mut stale: Vec<PathBuf> = Vec::new();

    for entry in fs::read_dir(layout.snapshots_dir())? {
        let entry = entry?;
        let path = entry.path();

        if !entry.file_type()?.is_dir() {
            stale.push(path);
            continue;
        }

        let name = entry.file_name().to_string_lossy().into_owned();
        match name.parse::<SnapshotId>() {
            Ok(id) => match &latest {
                Some((latest_id, _)) if *latest_id >= id => stale.push(path),
                _ => {
                    if let Some((_, previous)) = latest.replace((id, path)) {
                        stale.push(previous);
                    }
                }
            },
            Err(_) => {
                warn!(
                    "partition {}: ignoring unparsable snapshot directory {:?}",
                    partition_id, name
                );
                stale.push(path);
            }
        }
    }

    let current = match latest {
        Some((id, path)) => {
            let stored = checksum::read_sidecar(&path, &id)?;
            let actual = checksum::aggregate_checksum(&path, &id)?;
            if stored != actual {
                error!(
                    "partition {}: snapshot {} failed checksum verification \
                     (stored {:#010x}, computed {:#010x}), refusing to open",
                    partition_id, id, stored, actual
                );
                return Err(SnapshotError::CorruptedSnapshot(format!(
                    "snapshot {} failed checksum verification on recovery",
                    id
                )));
            }
            info!("partition {}: recovered committed snapshot {}", partition_id, id);
            Some(PersistedSnapshot::new(id, path, stored))
        }
        None => None,
    };

    for path in stale {
        layout.purge(&path);
    }
    for entry in fs::read_dir(layout.pending_dir())? {
        layout.purge(&entry?.path());
    }

    Ok(current)
}

struct StoreActor {
    partition_id: PartitionId,
    layout: SnapshotLayout,
    current: Arc<RwLock<Option<PersistedSnapshot>>>,
    listeners: Vec<Arc<dyn PersistedSnapshotListener>>,
    mailbox: mpsc::Receiver<StoreCommand>,
}

impl StoreActor {
    async fn run(mut self) {
        while let Some(command) = self.mailbox.recv().await {
            match command {
                StoreCommand::TakeTransient {
                    id,
                    inner,
                    writer,
                    reply,
                } => {
                    let _ = reply.send(self.take_transient(id, &inner, writer));
                }
                StoreCommand::PersistTransient { id, inner, reply } => {
                    let _ = reply.send(self.persist_transient(id, &inner));
                }
                StoreCommand::AbortTransient { inner, reply } => {
                    if let Some(pending) = inner.lock().pending_dir.take() {
                        self.layout.purge(&pending);
                    }
                    let _ = reply.send(Ok(()));
                }
                StoreCommand::ApplyChunk {
                    id,
                    inner,
                    chunk,
                    reply,
                } => {
                    let _ = reply.send(self.apply_chunk(id, &inner, chunk));
                }
                StoreCommand::PersistReceived { id, inner, reply } => {
                    let _ = reply.send(self.persist_received(id, &inner));
                }
                StoreCommand::AbortReceived { inner, reply } => {
                    let _ = reply.send(Ok(self.abort_received(&inner)));
                }
                StoreCommand::PurgePending { reply } => {
                    let _ = reply.send(self.purge_pending());
                }
                StoreCommand::AddListener(listener) => {
                    self.listeners.push(listener);
                }
                StoreCommand::RemoveListener(listener) => {
                    self.listeners.retain(|l| !Arc::ptr_eq(l, &listener));
                }
                StoreCommand::Close { reply } => {
                    let _ = reply.send(());
                    break;
                }
            }
        }
        debug!("partition {}: snapshot store task stopped", self.partition_id);
    }

    fn current_snapshot(&self) -> Option<PersistedSnapshot> {
        self.current.read().clone()
    }

    fn take_transient(
        &mut self,
        id: SnapshotId,
        inner: &Mutex<TransientInner>,
        writer: SnapshotWriter,
    ) -> SnapshotResult<bool> {
        let pending = self.layout.allocate_pending_path(&id);
        fs::create_dir_all(&pending)?;

        // A panicking writer must not take down the partition task.
        let wrote = catch_unwind(AssertUnwindSafe(|| writer(&pending))).unwrap_or_else(|_| {
            warn!(
                "partition {}: snapshot writer for {} panicked",
                self.partition_id, id
            );
            false
        });

        if !wrote {
            self.layout.purge(&pending);
            return Ok(false);
        }

        match checksum::aggregate_checksum(&pending, &id) {
            Ok(sum) => {
                let mut state = inner.lock();
                state.pending_dir = Some(pending);
                state.expected_checksum = sum;
                Ok(true)
            }
            Err(err) => {
                self.layout.purge(&pending);
                Err(err)
            }
        }
    }

    fn persist_transient(
        &mut self,
        id: SnapshotId,
        inner: &Mutex<TransientInner>,
    ) -> SnapshotResult<PersistedSnapshot> {
        let (pending, expected) = {
            let state = inner.lock();
            let pending = state
                .pending_dir
                .clone()
                .expect("checked by the transient handle before dispatch");
            (pending, state.expected_checksum)
        };

        // The id was strictly newer when the transient was created, but
        // a received snapshot may have been committed in between.
        if let Some(current) = self.current_snapshot() {
            if current.id() >= id {
                info!(
                    "partition {}: transient snapshot {} superseded by committed {}",
                    self.partition_id,
                    id,
                    current.id()
                );
                self.layout.purge(&pending);
                inner.lock().pending_dir = None;
                return Err(SnapshotError::Superseded(id, current.id()));
            }
        }

        let actual = checksum::aggregate_checksum(&pending, &id)?;
        if actual != expected {
            return Err(SnapshotError::CorruptedSnapshot(format!(
                "transient snapshot {} changed between take and persist \
                 (expected checksum {:#010x}, computed {:#010x})",
                id, expected, actual
            )));
        }

        checksum::write_sidecar(&pending, &id, actual)?;
        self.commit_pending(id, &pending, actual)
    }

    fn apply_chunk(
        &mut self,
        id: SnapshotId,
        inner: &Mutex<ReceivedInner>,
        chunk: SnapshotChunk,
    ) -> SnapshotResult<bool> {
        if chunk.snapshot_id != id.to_string() {
            warn!(
                "partition {}: chunk for snapshot {:?} applied to receiver of {}",
                self.partition_id, chunk.snapshot_id, id
            );
            return Ok(false);
        }

        let mut state = inner.lock();
        match state.stage {
            ReceivedStage::Empty => {
                // First chunk: record the sender's expectations and
                // allocate the pending directory.
                let pending = self.layout.allocate_pending_path(&id);
                fs::create_dir_all(&pending)?;
                state.pending_dir = Some(pending);
                state.expected_total = chunk.total_count;
                state.expected_checksum = chunk.snapshot_checksum;
                state.stage = ReceivedStage::Writing;
            }
            ReceivedStage::Writing => {
                if chunk.total_count != state.expected_total {
                    warn!(
                        "partition {}: snapshot {} chunk declares {} total chunks, expected {}",
                        self.partition_id, id, chunk.total_count, state.expected_total
                    );
                    return Ok(false);
                }
                if chunk.snapshot_checksum != state.expected_checksum {
                    warn!(
                        "partition {}: snapshot {} chunk declares snapshot checksum {:#010x}, expected {:#010x}",
                        self.partition_id, id, chunk.snapshot_checksum, state.expected_checksum
                    );
                    return Ok(false);
                }
            }
            // The handle asserts against these before dispatch; a racing
            // abort can still land first, so reject rather than panic on
            // the shared partition task.
            ReceivedStage::Persisted | ReceivedStage::Aborted => {
                warn!(
                    "partition {}: chunk for snapshot {} arrived after persist/abort",
                    self.partition_id, id
                );
                return Ok(false);
            }
        }

        if !chunk.verify() {
            warn!(
                "partition {}: snapshot {} chunk {:?} failed its checksum",
                self.partition_id, id, chunk.chunk_name
            );
            return Ok(false);
        }

        let dir = state
            .pending_dir
            .as_ref()
            .expect("writing snapshot has a pending directory");
        let target = dir.join(&chunk.chunk_name);

        match OpenOptions::new().write(true).create_new(true).open(&target) {
            Ok(mut file) => file.write_all(&chunk.content)?,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                // Duplicate chunk; applying it again is a no-op.
                debug!(
                    "partition {}: duplicate chunk {:?} for snapshot {}",
                    self.partition_id, chunk.chunk_name, id
                );
            }
            Err(err) => return Err(err.into()),
        }

        Ok(true)
    }

    fn persist_received(
        &mut self,
        id: SnapshotId,
        inner: &Mutex<ReceivedInner>,
    ) -> SnapshotResult<PersistedSnapshot> {
        let mut state = inner.lock();

        let pending = match state.stage {
            ReceivedStage::Writing => state
                .pending_dir
                .clone()
                .expect("writing snapshot has a pending directory"),
            ReceivedStage::Empty => {
                return Err(SnapshotError::CorruptedSnapshot(format!(
                    "snapshot {} is partial: no chunks were applied",
                    id
                )))
            }
            ReceivedStage::Persisted => {
                return Ok(state
                    .persisted
                    .clone()
                    .expect("persisted snapshot caches its handle"))
            }
            ReceivedStage::Aborted => {
                return Err(SnapshotError::CorruptedSnapshot(format!(
                    "snapshot {} was aborted",
                    id
                )))
            }
        };

        if let Some(current) = self.current_snapshot() {
            if current.id() == id {
                // A concurrent receiver already committed this snapshot.
                // Contents are interchangeable iff the checksums agree.
                if current.checksum() != state.expected_checksum {
                    return Err(SnapshotError::CorruptedSnapshot(format!(
                        "snapshot {} is already committed with checksum {:#010x}, \
                         received copy has {:#010x}",
                        id,
                        current.checksum(),
                        state.expected_checksum
                    )));
                }
                info!(
                    "partition {}: snapshot {} already committed by a concurrent receiver",
                    self.partition_id, id
                );
                self.layout.purge(&pending);
                state.stage = ReceivedStage::Persisted;
                state.persisted = Some(current.clone());
                return Ok(current);
            }

            if current.id() > id {
                info!(
                    "partition {}: received snapshot {} superseded by committed {}",
                    self.partition_id,
                    id,
                    current.id()
                );
                self.layout.purge(&pending);
                state.stage = ReceivedStage::Persisted;
                state.persisted = Some(current.clone());
                return Ok(current);
            }
        }

        let files = checksum::state_files(&pending, &id)?;
        if files.len() as u32 != state.expected_total {
            return Err(SnapshotError::CorruptedSnapshot(format!(
                "snapshot {} is partial: expected {} chunks, found {}",
                id,
                state.expected_total,
                files.len()
            )));
        }

        let actual = checksum::aggregate_checksum(&pending, &id)?;
        if actual != state.expected_checksum {
            return Err(SnapshotError::CorruptedSnapshot(format!(
                "snapshot {} is corrupted: expected checksum {:#010x}, computed {:#010x}",
                id, state.expected_checksum, actual
            )));
        }

        checksum::write_sidecar(&pending, &id, actual)?;
        let persisted = self.commit_pending(id, &pending, actual)?;

        state.stage = ReceivedStage::Persisted;
        state.persisted = Some(persisted.clone());
        Ok(persisted)
    }

    fn abort_received(&mut self, inner: &Mutex<ReceivedInner>) {
        let mut state = inner.lock();
        if state.stage == ReceivedStage::Persisted {
            debug!(
                "partition {}: abort ignored, snapshot already persisted",
                self.partition_id
            );
            return;
        }
        if let Some(pending) = state.pending_dir.take() {
            self.layout.purge(&pending);
        }
        state.stage = ReceivedStage::Aborted;
    }

    /// Promote a verified pending directory into `snapshots/`, advance
    /// the committed cell, retire the predecessor and notify listeners.
    fn commit_pending(
        &mut self,
        id: SnapshotId,
        pending: &Path,
        checksum: u64,
    ) -> SnapshotResult<PersistedSnapshot> {
        let path = self.layout.commit(pending, &id.to_string())?;
        let persisted = PersistedSnapshot::new(id, path, checksum);

        let previous = self.current.write().replace(persisted.clone());
        match previous {
            Some(old) => {
                info!(
                    "partition {}: committed snapshot {}, replacing {}",
                    self.partition_id,
                    id,
                    old.id()
                );
                // The directory disappears once the last outstanding
                // handle drops; ours drops right here.
                old.retire();
            }
            None => info!("partition {}: committed snapshot {}", self.partition_id, id),
        }

        for listener in &self.listeners {
            listener.on_new_snapshot(&persisted);
        }

        Ok(persisted)
    }

    fn purge_pending(&mut self) -> SnapshotResult<()> {
        let committed = self.current_snapshot().map(|s| s.id());

        for entry in fs::read_dir(self.layout.pending_dir())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();

            let keep = match (metadata::parse_pending_name(&name), committed) {
                (Some((id, _)), Some(current)) => id == current,
                _ => false,
            };

            if !keep {
                self.layout.purge(&entry.path());
            }
        }

        Ok(())
    }
}
