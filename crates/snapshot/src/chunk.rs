//! Snapshot chunk wire model
//!
//! A chunk carries one state file of a snapshot plus the integrity
//! metadata a receiver needs to validate it in isolation: the snapshot
//! identity, the expected chunk count, a CRC32C of the chunk content,
//! and the aggregate checksum of the whole snapshot (identical across
//! all chunks of one snapshot). The field set is wire-stable; integers
//! are encoded big-endian.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::checksum;
use crate::error::{SnapshotError, SnapshotResult};
use crate::persisted::PersistedSnapshot;

/// The wire unit of a snapshot transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotChunk {
    /// Identifier of the snapshot this chunk belongs to.
    pub snapshot_id: String,
    /// Expected number of chunks in the snapshot.
    pub total_count: u32,
    /// Filename this chunk's content targets.
    pub chunk_name: String,
    /// Raw file content.
    pub content: Vec<u8>,
    /// CRC32C of `content`.
    pub checksum: u64,
    /// Aggregate CRC32C of the whole snapshot.
    pub snapshot_checksum: u64,
}

impl SnapshotChunk {
    /// Whether the content matches the declared chunk checksum.
    pub fn verify(&self) -> bool {
        checksum::crc_of(&self.content) == self.checksum
    }

    /// Encode for transport. Integers are big-endian fixed-width on the
    /// wire.
    pub fn encode(&self) -> SnapshotResult<Vec<u8>> {
        let config = bincode::config::standard()
            .with_big_endian()
            .with_fixed_int_encoding();
        bincode::serde::encode_to_vec(self, config)
            .map_err(|err| SnapshotError::CorruptedSnapshot(format!("chunk encode failed: {}", err)))
    }

    /// Decode a chunk received from the wire.
    pub fn decode(bytes: &[u8]) -> SnapshotResult<Self> {
        let config = bincode::config::standard()
            .with_big_endian()
            .with_fixed_int_encoding();
        bincode::serde::decode_from_slice(bytes, config)
            .map(|(chunk, _)| chunk)
            .map_err(|err| SnapshotError::CorruptedSnapshot(format!("chunk decode failed: {}", err)))
    }
}

/// Streams a committed snapshot as chunks, one per state file, in
/// ascending byte-lexicographic filename order. The checksum sidecar is
/// not streamed; its value travels in every chunk's `snapshot_checksum`
/// and the receiver writes its own sidecar on persist.
///
/// The reader owns a handle onto the snapshot, so the directory stays
/// alive for its whole lifetime even when the store retires the
/// snapshot mid-stream.
pub struct SnapshotChunkReader {
    snapshot: PersistedSnapshot,
    total_count: u32,
    files: std::vec::IntoIter<(String, PathBuf)>,
}

impl SnapshotChunkReader {
    pub(crate) fn new(snapshot: PersistedSnapshot) -> SnapshotResult<Self> {
        let files = checksum::state_files(snapshot.path(), &snapshot.id())?;
        let total_count = files.len() as u32;

        Ok(Self {
            snapshot,
            total_count,
            files: files.into_iter(),
        })
    }
}

impl Iterator for SnapshotChunkReader {
    type Item = SnapshotResult<SnapshotChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        let (name, path) = self.files.next()?;

        let chunk = fs::read(&path)
            .map(|content| SnapshotChunk {
                snapshot_id: self.snapshot.id().to_string(),
                total_count: self.total_count,
                chunk_name: name,
                checksum: checksum::crc_of(&content),
                content,
                snapshot_checksum: self.snapshot.checksum(),
            })
            .map_err(SnapshotError::Io);

        Some(chunk)
    }
}
