use std::{fmt, time::SystemTime};
use bytes::Bytes;
use chrono::{DateTime, LocalResult, TimeZone, Utc};
use super::{ArchivePath, DataError};

/// Timestamp associated with a file version, in microseconds since the
/// Unix epoch. Used for tie-breaking and expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArchiveTime(i64);

impl ArchiveTime {
    pub fn now() -> Self {
        ArchiveTime(Utc::now().timestamp_micros())
    }

    pub fn from_micros(micros: i64) -> Self {
        ArchiveTime(micros)
    }

    pub fn micros(&self) -> i64 {
        self.0
    }

    pub fn plus_secs(&self, secs: u32) -> ArchiveTime {
        ArchiveTime(self.0.saturating_add(secs as i64 * 1_000_000))
    }
}

impl From<SystemTime> for ArchiveTime {
    fn from(time: SystemTime) -> Self {
        let utc: DateTime<Utc> = time.into();
        ArchiveTime(utc.timestamp_micros())
    }
}

impl fmt::Display for ArchiveTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Utc.timestamp_micros(self.0) {
            LocalResult::Single(utc) => write!(f, "{}", utc.to_rfc3339()),
            _ => write!(f, "{}us", self.0),
        }
    }
}

/// Identifies one version of one file: the same path republished with a
/// different time is a different file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId {
    pub path: ArchivePath,
    pub time: ArchiveTime,
}

impl FileId {
    pub fn new(path: ArchivePath, time: ArchiveTime) -> Self {
        FileId { path, time }
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.path, self.time)
    }
}

/// Immutable descriptor of a file version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileInfo {
    pub id: FileId,
    pub file_size: u64,
    pub piece_size: u32,
    pub ttl_secs: u32,
}

impl FileInfo {
    /// Builds a descriptor with the given sizes. The empty file has a
    /// piece size of zero and exactly one (empty) piece.
    pub fn new(id: FileId, file_size: u64, piece_size: u32, ttl_secs: u32) -> Self {
        let piece_size = if file_size == 0 { 0 } else { piece_size };
        debug_assert!(file_size == 0 || piece_size > 0);
        FileInfo {
            id,
            file_size,
            piece_size,
            ttl_secs,
        }
    }

    pub fn piece_count(&self) -> u32 {
        if self.file_size == 0 {
            1
        } else {
            ((self.file_size + self.piece_size as u64 - 1) / self.piece_size as u64) as u32
        }
    }

    // Byte offset of a piece within the file.
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_size as u64
    }

    // Length of a piece in bytes; the last piece may be shorter.
    pub fn piece_len(&self, index: u32) -> usize {
        if self.file_size == 0 {
            return 0;
        }
        let start = self.piece_offset(index);
        let end = (start + self.piece_size as u64).min(self.file_size);
        (end - start) as usize
    }

    pub fn expires_at(&self) -> ArchiveTime {
        self.id.time.plus_secs(self.ttl_secs)
    }
}

impl fmt::Display for FileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.id, self.file_size)
    }
}

/// Identifies exactly one piece of one file version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PieceSpec {
    pub info: FileInfo,
    pub index: u32,
}

impl PieceSpec {
    pub fn new(info: FileInfo, index: u32) -> Result<Self, DataError> {
        if index >= info.piece_count() {
            return Err(DataError::PieceIndexOutOfRange {
                path: info.id.path.to_string(),
                index,
                count: info.piece_count(),
            });
        }
        Ok(PieceSpec { info, index })
    }

    pub fn offset(&self) -> u64 {
        self.info.piece_offset(self.index)
    }

    pub fn len(&self) -> usize {
        self.info.piece_len(self.index)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for PieceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.info.id, self.index)
    }
}

/// One piece of file data. The byte length always equals the spec's
/// piece length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub spec: PieceSpec,
    pub data: Bytes,
}

impl Piece {
    pub fn new(spec: PieceSpec, data: Bytes) -> Result<Self, DataError> {
        if data.len() != spec.len() {
            return Err(DataError::PieceLenMismatch {
                expected: spec.len(),
                actual: data.len(),
            });
        }
        Ok(Piece { spec, data })
    }
}

impl fmt::Display for Piece {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.spec, self.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(size: u64, piece_size: u32) -> FileInfo {
        FileInfo::new(
            FileId::new(ArchivePath::parse("data/f").unwrap(), ArchiveTime::from_micros(1)),
            size,
            piece_size,
            3600,
        )
    }

    #[test]
    fn test_piece_count() {
        assert_eq!(info(0, 0).piece_count(), 1);
        assert_eq!(info(1, 8).piece_count(), 1);
        assert_eq!(info(8, 8).piece_count(), 1);
        assert_eq!(info(9, 8).piece_count(), 2);
        assert_eq!(info(16, 8).piece_count(), 2);
    }

    #[test]
    fn test_last_piece_is_shorter() {
        let info = info(13, 8);
        assert_eq!(info.piece_len(0), 8);
        assert_eq!(info.piece_len(1), 5);
        assert_eq!(info.piece_offset(1), 8);
    }

    #[test]
    fn test_empty_file_has_one_empty_piece() {
        let info = info(0, 0);
        assert_eq!(info.piece_count(), 1);
        assert_eq!(info.piece_len(0), 0);
        let spec = PieceSpec::new(info, 0).unwrap();
        assert!(Piece::new(spec, Bytes::new()).is_ok());
    }

    #[test]
    fn test_piece_index_bounds() {
        assert!(PieceSpec::new(info(16, 8), 2).is_err());
        assert!(PieceSpec::new(info(16, 8), 1).is_ok());
    }

    #[test]
    fn test_piece_len_must_match_spec() {
        let spec = PieceSpec::new(info(13, 8), 1).unwrap();
        assert!(Piece::new(spec.clone(), Bytes::from_static(&[0; 5])).is_ok());
        assert!(Piece::new(spec, Bytes::from_static(&[0; 8])).is_err());
    }

    #[test]
    fn test_same_path_different_time_is_different_id() {
        let path = ArchivePath::parse("a").unwrap();
        let a = FileId::new(path.clone(), ArchiveTime::from_micros(1));
        let b = FileId::new(path, ArchiveTime::from_micros(2));
        assert_ne!(a, b);
        assert!(a < b);
    }
}
