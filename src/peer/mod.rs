use crate::archive::ArchiveError;

mod handshake;
mod message;
mod queues;
mod session;

pub use handshake::{Handshake, HandshakeCodec};
pub use message::{Notice, NoticeCodec, PieceCodec, Request, RequestCodec};
pub use queues::{NoticeQueue, RequestQueue};
pub use session::{Peer, PeerCounter, PeerHandle};

pub type Result<T> = std::result::Result<T, PeerError>;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] crate::wire::WireError),

    #[error("no handshake received")]
    NoHandshake,

    #[error("inconsistent handshake on connection {0}")]
    InconsistentHandshake(u64),

    #[error("handshake timeout")]
    HandshakeTimeout,

    #[error("archive error: {0}")]
    Archive(ArchiveError),

    #[error("task failure: {0}")]
    Task(String),
}

impl PeerError {
    /// Whether the error belongs to the network taxonomy: the session
    /// is over but the node is healthy, and the client manager may
    /// report the remote server offline and move on. Archive and task
    /// failures are not recoverable this way.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            PeerError::Io(_)
                | PeerError::Protocol(_)
                | PeerError::NoHandshake
                | PeerError::InconsistentHandshake(_)
                | PeerError::HandshakeTimeout
        )
    }
}

impl From<ArchiveError> for PeerError {
    fn from(e: ArchiveError) -> Self {
        PeerError::Archive(e)
    }
}
