//! Snapshot identifier codec
//!
//! A snapshot is identified by the log position it covers:
//! `index-term-processedPosition-exportedPosition`, four dash-separated
//! unsigned decimal fields. Committed snapshot directories are named by
//! this identifier; pending directories carry an extra ordinal suffix
//! (`<id>-<seq>`) to disambiguate concurrent receptions of the same
//! snapshot.

use std::fmt;
use std::str::FromStr;

use crate::error::SnapshotError;

/// Identifier and ordering key of a snapshot.
///
/// The derived ordering is lexicographic on `(index, term,
/// processed_position, exported_position)`; a snapshot is newer than
/// another iff its tuple compares strictly greater. Positions are 0 when
/// unused. The codec is pure and platform-independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotId {
    pub index: u64,
    pub term: u64,
    pub processed_position: u64,
    pub exported_position: u64,
}

impl SnapshotId {
    pub fn new(index: u64, term: u64, processed_position: u64, exported_position: u64) -> Self {
        Self {
            index,
            term,
            processed_position,
            exported_position,
        }
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.index, self.term, self.processed_position, self.exported_position
        )
    }
}

impl FromStr for SnapshotId {
    type Err = SnapshotError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let mut fields = [0u64; 4];
        let mut count = 0;

        for part in name.split('-') {
            if count == 4 {
                return Err(SnapshotError::InvalidId(name.to_string()));
            }
            fields[count] = part
                .parse::<u64>()
                .map_err(|_| SnapshotError::InvalidId(name.to_string()))?;
            count += 1;
        }

        if count != 4 {
            return Err(SnapshotError::InvalidId(name.to_string()));
        }

        Ok(Self::new(fields[0], fields[1], fields[2], fields[3]))
    }
}

/// Parse a pending directory name of the form `<id>-<seq>`.
///
/// Returns `None` for names that do not carry a parsable id plus a
/// positive ordinal suffix.
pub fn parse_pending_name(name: &str) -> Option<(SnapshotId, u32)> {
    let (id_part, seq_part) = name.rsplit_once('-')?;
    let id = id_part.parse::<SnapshotId>().ok()?;
    let seq = seq_part.parse::<u32>().ok()?;
    if seq == 0 {
        return None;
    }
    Some((id, seq))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_and_parse_round_trip() {
        let id = SnapshotId::new(17, 3, 1024, 0);
        assert_eq!(id.to_string(), "17-3-1024-0");
        assert_eq!("17-3-1024-0".parse::<SnapshotId>().unwrap(), id);
    }

    #[test]
    fn test_parse_rejects_malformed_names() {
        for name in [
            "",
            "1",
            "1-2",
            "1-2-3",
            "1-2-3-4-5",
            "a-2-3-4",
            "1-2-3-x",
            "1--2-3-4",
            "-1-2-3-4",
            "1.5-2-3-4",
        ] {
            assert!(
                name.parse::<SnapshotId>().is_err(),
                "expected {:?} to be rejected",
                name
            );
        }
    }

    #[test]
    fn test_ordering_is_field_wise() {
        let base = SnapshotId::new(2, 1, 10, 5);

        assert!(SnapshotId::new(3, 0, 0, 0) > base);
        assert!(SnapshotId::new(2, 2, 0, 0) > base);
        assert!(SnapshotId::new(2, 1, 11, 0) > base);
        assert!(SnapshotId::new(2, 1, 10, 6) > base);
        assert!(SnapshotId::new(2, 1, 10, 5) == base);
        assert!(SnapshotId::new(1, 9, 99, 99) < base);
    }

    #[test]
    fn test_parse_pending_name() {
        let (id, seq) = parse_pending_name("1-0-0-0-2").unwrap();
        assert_eq!(id, SnapshotId::new(1, 0, 0, 0));
        assert_eq!(seq, 2);

        assert!(parse_pending_name("1-0-0-0").is_none());
        assert!(parse_pending_name("1-0-0-0-0").is_none());
        assert!(parse_pending_name("garbage").is_none());
    }
}
