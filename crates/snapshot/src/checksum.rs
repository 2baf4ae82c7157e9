//! Aggregate snapshot checksums
//!
//! Both per-chunk and whole-snapshot verification use CRC32C (Castagnoli
//! polynomial). The aggregate checksum of a snapshot folds every state
//! file in ascending byte-lexicographic filename order, each prefixed
//! with its length as a big-endian u32. That ordering is the only
//! cross-node canonicalization of a snapshot's content and must be
//! reproduced exactly on every platform.
//!
//! The committed value lives in a sidecar file `<id>.checksum` inside
//! the snapshot directory, stored as 8 big-endian bytes. The sidecar
//! itself never participates in the aggregate it stores.

use std::fs;
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_32_ISCSI};
use tracing::debug;

use crate::error::{SnapshotError, SnapshotResult};
use crate::metadata::SnapshotId;

/// CRC32C calculator (Castagnoli variant).
static CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// File extension of the checksum sidecar.
pub const CHECKSUM_EXTENSION: &str = "checksum";

/// CRC32C of a single buffer, widened to the wire representation.
pub fn crc_of(content: &[u8]) -> u64 {
    CRC32C.checksum(content) as u64
}

/// State files of a snapshot directory in ascending byte-lexicographic
/// filename order. Only the directory's own sidecar `<id>.checksum` is
/// excluded; an application state file that happens to carry the
/// extension still participates.
pub fn state_files(dir: &Path, id: &SnapshotId) -> SnapshotResult<Vec<(String, PathBuf)>> {
    let sidecar_name = format!("{}.{}", id, CHECKSUM_EXTENSION);
    let mut files = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == sidecar_name {
            continue;
        }
        files.push((name, entry.path()));
    }

    files.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
    Ok(files)
}

/// Compute the aggregate checksum of a snapshot directory.
pub fn aggregate_checksum(dir: &Path, id: &SnapshotId) -> SnapshotResult<u64> {
    let mut digest = CRC32C.digest();

    for (name, path) in state_files(dir, id)? {
        let content = fs::read(&path)?;
        digest.update(&(content.len() as u32).to_be_bytes());
        digest.update(&content);
        debug!("folded {} ({} bytes) into aggregate checksum", name, content.len());
    }

    Ok(digest.finalize() as u64)
}

fn sidecar_path(dir: &Path, id: &SnapshotId) -> PathBuf {
    dir.join(format!("{}.{}", id, CHECKSUM_EXTENSION))
}

/// Write the checksum sidecar into a snapshot directory.
pub fn write_sidecar(dir: &Path, id: &SnapshotId, checksum: u64) -> SnapshotResult<()> {
    fs::write(sidecar_path(dir, id), checksum.to_be_bytes())?;
    Ok(())
}

/// Read the stored aggregate checksum of a snapshot directory.
///
/// A missing or truncated sidecar is reported as corruption rather than
/// a plain IO error, since it means the directory cannot have gone
/// through an atomic commit.
pub fn read_sidecar(dir: &Path, id: &SnapshotId) -> SnapshotResult<u64> {
    let path = sidecar_path(dir, id);
    let content = fs::read(&path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            SnapshotError::CorruptedSnapshot(format!(
                "snapshot {} has no checksum sidecar",
                id
            ))
        } else {
            SnapshotError::Io(err)
        }
    })?;

    let bytes: [u8; 8] = content.as_slice().try_into().map_err(|_| {
        SnapshotError::CorruptedSnapshot(format!(
            "checksum sidecar of snapshot {} has {} bytes, expected 8",
            id,
            content.len()
        ))
    })?;

    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_aggregate_folds_files_in_filename_order() {
        let temp_dir = TempDir::new().unwrap();
        let id = SnapshotId::new(1, 0, 0, 0);
        // Created out of order on purpose; the aggregate must not care.
        fs::write(temp_dir.path().join("b"), b"second").unwrap();
        fs::write(temp_dir.path().join("a"), b"first").unwrap();

        let mut digest = CRC32C.digest();
        digest.update(&(b"first".len() as u32).to_be_bytes());
        digest.update(b"first");
        digest.update(&(b"second".len() as u32).to_be_bytes());
        digest.update(b"second");
        let expected = digest.finalize() as u64;

        assert_eq!(aggregate_checksum(temp_dir.path(), &id).unwrap(), expected);
    }

    #[test]
    fn test_aggregate_changes_when_content_changes() {
        let temp_dir = TempDir::new().unwrap();
        let id = SnapshotId::new(1, 0, 0, 0);
        fs::write(temp_dir.path().join("file1"), b"content").unwrap();
        let before = aggregate_checksum(temp_dir.path(), &id).unwrap();

        fs::write(temp_dir.path().join("file1"), b"tampered").unwrap();
        let after = aggregate_checksum(temp_dir.path(), &id).unwrap();

        assert_ne!(before, after);
    }

    #[test]
    fn test_sidecar_round_trip_and_exclusion() {
        let temp_dir = TempDir::new().unwrap();
        let id = SnapshotId::new(1, 0, 0, 0);
        fs::write(temp_dir.path().join("file1"), b"content").unwrap();

        let checksum = aggregate_checksum(temp_dir.path(), &id).unwrap();
        write_sidecar(temp_dir.path(), &id, checksum).unwrap();

        assert_eq!(read_sidecar(temp_dir.path(), &id).unwrap(), checksum);
        // The sidecar must not feed back into the aggregate.
        assert_eq!(aggregate_checksum(temp_dir.path(), &id).unwrap(), checksum);
    }

    #[test]
    fn test_state_file_named_like_a_sidecar_participates() {
        let temp_dir = TempDir::new().unwrap();
        let id = SnapshotId::new(1, 0, 0, 0);
        fs::write(temp_dir.path().join("file1"), b"content").unwrap();
        fs::write(temp_dir.path().join("foo.checksum"), b"state").unwrap();
        write_sidecar(temp_dir.path(), &id, 7).unwrap();

        let names: Vec<_> = state_files(temp_dir.path(), &id)
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, ["file1", "foo.checksum"]);
    }

    #[test]
    fn test_read_sidecar_rejects_missing_and_truncated() {
        let temp_dir = TempDir::new().unwrap();
        let id = SnapshotId::new(1, 0, 0, 0);

        assert!(matches!(
            read_sidecar(temp_dir.path(), &id),
            Err(SnapshotError::CorruptedSnapshot(_))
        ));

        fs::write(temp_dir.path().join("1-0-0-0.checksum"), [0u8; 3]).unwrap();
        assert!(matches!(
            read_sidecar(temp_dir.path(), &id),
            Err(SnapshotError::CorruptedSnapshot(_))
        ));
    }
}
