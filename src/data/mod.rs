mod file;
mod filter;
mod path;
mod spec_set;

pub use file::{ArchiveTime, FileId, FileInfo, Piece, PieceSpec};
pub use filter::{Filter, Predicate, Segment};
pub use path::ArchivePath;
pub(crate) use path::HIDDEN_COMPONENT;
pub use spec_set::{FilePieceSpecSet, PieceSpecSet};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DataError {
    #[error("invalid archive path: {0:?}")]
    InvalidPath(String),

    #[error("invalid filter pattern: {0:?}")]
    InvalidFilter(String),

    #[error("piece index {index} out of range for {path} ({count} pieces)")]
    PieceIndexOutOfRange {
        path: String,
        index: u32,
        count: u32,
    },

    #[error("piece length mismatch: expected {expected} bytes, got {actual}")]
    PieceLenMismatch { expected: usize, actual: usize },
}
