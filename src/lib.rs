mod archive;
mod clearing;
mod config;
mod data;
mod manager;
mod net;
mod node;
mod peer;
mod tracker;
mod wire;

// Default size of a file piece in bytes.
const PIECE_SIZE: u32 = 0x20000;

// Default time-to-live of a published file in seconds.
const DEFAULT_TTL: u32 = 3600;

type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

pub use archive::{Archive, ArchiveError, ArchiveEvent, ArchiveWatcher, PutOutcome};
pub use clearing::ClearingHouse;
pub use config::NodeConfig;
pub use data::{
    ArchivePath, ArchiveTime, DataError, FileId, FileInfo, FilePieceSpecSet, Filter, Piece,
    PieceSpec, PieceSpecSet, Predicate,
};
pub use manager::ClientManager;
pub use net::Client;
pub use node::{NodeError, SinkNode, SourceNode, Subscription};
pub use peer::{PeerCounter, PeerError, PeerHandle};
pub use tracker::{FilteredProxy, Topology, Tracker, TrackerError, TrackerProxy};
pub use wire::WireError;
