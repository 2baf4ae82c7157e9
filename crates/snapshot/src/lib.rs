//! Snapshot transfer and persistence engine
//!
//! Followers in a replication group receive point-in-time state
//! snapshots from their leader as a sequence of chunks and materialize
//! them atomically into a local store; leaders take the same snapshots
//! locally through a state-machine callback. This crate is that store,
//! one instance per partition.
//!
//! Guarantees, per partition:
//! - at most one committed snapshot under `snapshots/` at any steady
//!   state, entered only via atomic rename from `pending/`;
//! - the committed snapshot id only ever moves forward, across restarts
//!   included;
//! - every committed file is covered by a CRC32C aggregate stored in a
//!   sidecar, verified again on recovery;
//! - all mutations are serialized on one cooperative task, so observers
//!   never see interleaved updates.

pub mod checksum;
pub mod chunk;
pub mod error;
pub mod factory;
pub mod layout;
pub mod metadata;
pub mod persisted;
pub mod received;
pub mod store;
pub mod traits;
pub mod transient;

pub use chunk::{SnapshotChunk, SnapshotChunkReader};
pub use error::{SnapshotError, SnapshotResult};
pub use factory::SnapshotStoreFactory;
pub use metadata::SnapshotId;
pub use persisted::PersistedSnapshot;
pub use received::ReceivedSnapshot;
pub use store::{PartitionId, SnapshotStore};
pub use traits::{ConstructableSnapshotStore, PersistedSnapshotListener, ReceivableSnapshotStore};
pub use transient::TransientSnapshot;
