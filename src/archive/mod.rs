use crate::data::{ArchivePath, DataError};

mod store;
mod tracker_files;
mod watcher;
#[cfg(test)]
mod tests;

pub use store::Archive;
pub use tracker_files::DistributedTrackerFiles;
pub use watcher::ArchiveWatcher;

pub type Result<T> = std::result::Result<T, ArchiveError>;

#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    // Usually a poisoned archive lock.
    #[error("sync error: {0}")]
    Sync(String),

    #[error("invalid piece: {0}")]
    InvalidPiece(#[from] DataError),

    #[error("not a regular file: {0}")]
    NotAFile(ArchivePath),

    // The same file id was presented with different sizes.
    #[error("mismatched file information for {0}")]
    InfoMismatch(ArchivePath),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
}

impl<T> From<std::sync::PoisonError<T>> for ArchiveError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        ArchiveError::Sync(e.to_string())
    }
}

/// Result of writing one piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    // The piece was stored; the file still has missing pieces.
    Incomplete,

    // This piece was the last one; the file is now visible.
    Completed,

    // The piece was already present. No bytes were written.
    Duplicate,
}

/// Filesystem change observed below the archive root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveEvent {
    Created(ArchivePath),
    Removed(ArchivePath),
}
