use std::{
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    time::Duration,
};

// First of the three consecutive server ports.
pub const DEFAULT_BASE_PORT: u16 = 3880;

// Minimum number of live clients a manager keeps per filter.
pub const MIN_CLIENTS_PER_FILTER: usize = 8;

// How often the client manager replaces its worst performer.
pub const REPLACEMENT_PERIOD: Duration = Duration::from_secs(60);

// Process-wide configuration, loaded once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    // Root directory of the node's archive.
    pub root: PathBuf,

    // Address this node binds and advertises to peers.
    pub host: IpAddr,

    // First of three consecutive TCP ports the server binds.
    // Zero picks a free base at bind time.
    pub base_port: u16,

    // Port the embedded tracker listens on (publishers only).
    // Zero picks an ephemeral port.
    pub tracker_port: u16,

    pub piece_size: u32,

    pub ttl_secs: u32,

    pub min_clients: usize,

    pub replacement_period: Duration,

    // Connect timeout for tracker and peer dials.
    pub connect_timeout: Duration,

    // How long a partially handshaken connection may wait for its
    // remaining streams before it is discarded.
    pub handshake_guard: Duration,

    // Maximum number of open archive file handles.
    pub open_file_limit: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("archive"),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            base_port: DEFAULT_BASE_PORT,
            tracker_port: 0,
            piece_size: crate::PIECE_SIZE,
            ttl_secs: crate::DEFAULT_TTL,
            min_clients: MIN_CLIENTS_PER_FILTER,
            replacement_period: REPLACEMENT_PERIOD,
            connect_timeout: Duration::from_secs(10),
            handshake_guard: Duration::from_secs(30),
            open_file_limit: 512,
        }
    }
}

impl NodeConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }
}
