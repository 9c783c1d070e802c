use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tokio::sync::watch;
use crate::{
    archive::{Archive, PutOutcome, Result},
    data::{FileId, FilePieceSpecSet, Filter, Piece, PieceSpec, Predicate},
    peer::PeerHandle,
};

/// Per-node hub between the archive and every live peer session.
///
/// Owns the peer set (with duplicate-session detection) and the
/// request director, which guarantees at most one outstanding request
/// per piece across all peers.
pub struct ClearingHouse {
    archive: Arc<Archive>,

    // What this node wants.
    predicate: Predicate,

    peers: Mutex<PeerSet>,

    // Piece -> id of the peer it is outstanding to.
    director: Mutex<HashMap<PieceSpec, u64>>,

    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

#[derive(Default)]
struct PeerSet {
    peers: Vec<Arc<PeerHandle>>,
    // Duplicate-suppression index.
    keys: HashSet<(SocketAddr, Filter)>,
}

impl ClearingHouse {
    pub fn new(archive: Arc<Archive>, predicate: Predicate) -> Arc<ClearingHouse> {
        let (done_tx, done_rx) = watch::channel(false);
        Arc::new(ClearingHouse {
            archive,
            predicate,
            peers: Mutex::new(PeerSet::default()),
            director: Mutex::new(HashMap::new()),
            done_tx,
            done_rx,
        })
    }

    pub fn archive(&self) -> &Arc<Archive> {
        &self.archive
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    /// Resolves to true once every piece the predicate names is in the
    /// archive. Never resolves for unbounded predicates.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }

    /// Admits a peer. Fails if an equivalent session, same remote
    /// server and same local filter, already exists; check and insert
    /// are one critical section.
    pub fn add(&self, peer: Arc<PeerHandle>) -> bool {
        let mut set = match self.peers.lock() {
            Ok(set) => set,
            Err(_) => return false,
        };
        let key = (peer.remote_server, peer.local_filter.clone());
        if !set.keys.insert(key) {
            return false;
        }
        tracing::debug!("peer {} added for {}", peer.remote_server, peer.local_filter);
        set.peers.push(peer);
        true
    }

    pub fn remove(&self, peer_id: u64) {
        if let Ok(mut set) = self.peers.lock() {
            if let Some(index) = set.peers.iter().position(|p| p.id == peer_id) {
                let peer = set.peers.swap_remove(index);
                set.keys
                    .remove(&(peer.remote_server, peer.local_filter.clone()));
            }
        }
        // Pieces outstanding to the departed peer become requestable
        // from whoever notices them next.
        if let Ok(mut director) = self.director.lock() {
            director.retain(|_, owner| *owner != peer_id);
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().map(|set| set.peers.len()).unwrap_or(0)
    }

    /// Remote server addresses of live sessions carrying this local
    /// filter. The client manager excludes them from candidacy.
    pub fn in_use_servers(&self, filter: &Filter) -> HashSet<SocketAddr> {
        match self.peers.lock() {
            Ok(set) => set
                .peers
                .iter()
                .filter(|p| p.local_filter == *filter)
                .map(|p| p.remote_server)
                .collect(),
            Err(_) => HashSet::new(),
        }
    }

    /// Handles a remote addition notice for one piece. Returns whether
    /// the peer should request it: the piece must be missing, wanted by
    /// the predicate and not already on request elsewhere.
    pub fn process_notice(&self, peer_id: u64, spec: &PieceSpec) -> bool {
        if !self.predicate.matches(&spec.info.id.path) {
            return false;
        }
        if self.archive.exists(spec) {
            return false;
        }
        let mut director = match self.director.lock() {
            Ok(director) => director,
            Err(_) => return false,
        };
        match director.entry(spec.clone()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(peer_id);
                true
            }
        }
    }

    /// Stores a received piece. Returns `(used, done)`: whether the
    /// piece was new, and whether the whole predicate is now satisfied.
    pub fn process_piece(&self, peer_id: u64, piece: &Piece) -> Result<(bool, bool)> {
        if let Ok(mut director) = self.director.lock() {
            director.remove(&piece.spec);
        }

        let outcome = self.archive.put_piece(piece)?;
        let used = match outcome {
            PutOutcome::Incomplete | PutOutcome::Completed => true,
            PutOutcome::Duplicate => false,
        };
        if used {
            self.notify_remote_if_desired(Some(peer_id), &piece.spec);
        }

        let done = outcome == PutOutcome::Completed && self.predicate_satisfied();
        if done {
            self.done_tx.send_replace(true);
        }
        Ok((used, done))
    }

    pub fn get_piece(&self, spec: &PieceSpec) -> Result<Option<Piece>> {
        self.archive.get_piece(spec)
    }

    pub fn walk(
        &self,
        filter: &Filter,
        consumer: impl FnMut(FilePieceSpecSet),
    ) -> Result<()> {
        self.archive.walk(filter, consumer)
    }

    /// Handles a remote removal notice: drop the files locally and
    /// pass the notice along to every other interested peer.
    pub fn process_removal(&self, peer_id: u64, ids: Vec<FileId>) -> Result<()> {
        for id in &ids {
            self.archive.remove(&id.path)?;
        }
        self.broadcast_removals(Some(peer_id), ids);
        Ok(())
    }

    /// Deletes a file on this node's initiative and notifies every
    /// interested peer.
    pub fn remove_file(&self, id: &FileId) -> Result<()> {
        self.archive.remove(&id.path)?;
        self.broadcast_removals(None, vec![id.clone()]);
        Ok(())
    }

    /// Announces a locally published file to every interested peer.
    pub fn broadcast_addition(&self, set: FilePieceSpecSet) {
        let path = set.info().id.path.clone();
        if let Ok(peers) = self.peers.lock() {
            for peer in peers.peers.iter() {
                if peer.remote_filter.matches(&path) {
                    peer.notify_addition(set.clone());
                }
            }
        }
    }

    // Tells every other peer that wants this path about a new piece.
    fn notify_remote_if_desired(&self, from: Option<u64>, spec: &PieceSpec) {
        let path = &spec.info.id.path;
        if let Ok(peers) = self.peers.lock() {
            for peer in peers.peers.iter() {
                if Some(peer.id) == from {
                    continue;
                }
                if peer.remote_filter.matches(path) {
                    peer.notify_addition(FilePieceSpecSet::single(
                        spec.info.clone(),
                        spec.index,
                    ));
                }
            }
        }
    }

    fn broadcast_removals(&self, from: Option<u64>, ids: Vec<FileId>) {
        if let Ok(peers) = self.peers.lock() {
            for peer in peers.peers.iter() {
                if Some(peer.id) == from {
                    continue;
                }
                let interested: Vec<FileId> = ids
                    .iter()
                    .filter(|id| peer.remote_filter.matches(&id.path))
                    .cloned()
                    .collect();
                if !interested.is_empty() {
                    peer.notify_removals(interested);
                }
            }
        }
    }

    fn predicate_satisfied(&self) -> bool {
        if !self.predicate.is_bounded() {
            return false;
        }
        self.predicate
            .exact_paths()
            .iter()
            .all(|path| self.archive.has_complete(path))
    }

    /// Cancels every live session. Used at node shutdown.
    pub fn cancel_all(&self) {
        if let Ok(peers) = self.peers.lock() {
            for peer in peers.peers.iter() {
                peer.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::data::{ArchivePath, ArchiveTime, FileInfo};

    fn house(dir: &std::path::Path, predicate: Predicate) -> Arc<ClearingHouse> {
        let archive = Arc::new(Archive::open(dir, 8, 3600, 64).unwrap());
        ClearingHouse::new(archive, predicate)
    }

    fn info(name: &str, size: u64) -> FileInfo {
        FileInfo::new(
            FileId::new(
                ArchivePath::parse(name).unwrap(),
                ArchiveTime::from_micros(5),
            ),
            size,
            8,
            3600,
        )
    }

    fn piece(info: &FileInfo, index: u32) -> Piece {
        let spec = PieceSpec::new(info.clone(), index).unwrap();
        let data = Bytes::from(vec![1; spec.len()]);
        Piece::new(spec, data).unwrap()
    }

    #[test]
    fn test_at_most_one_outstanding_request_per_piece() {
        let dir = tempfile::tempdir().unwrap();
        let house = house(dir.path(), Predicate::everything());
        let spec = PieceSpec::new(info("f", 8), 0).unwrap();

        assert!(house.process_notice(1, &spec));
        // A second peer noticing the same piece must not request it.
        assert!(!house.process_notice(2, &spec));

        // Once the piece arrives it is no longer wanted at all.
        house.process_piece(1, &piece(&info("f", 8), 0)).unwrap();
        assert!(!house.process_notice(3, &spec));
    }

    #[test]
    fn test_departed_peer_releases_outstanding_requests() {
        let dir = tempfile::tempdir().unwrap();
        let house = house(dir.path(), Predicate::everything());
        let spec = PieceSpec::new(info("f", 8), 0).unwrap();

        assert!(house.process_notice(1, &spec));
        house.remove(1);
        assert!(house.process_notice(2, &spec));
    }

    #[test]
    fn test_unwanted_paths_are_not_requested() {
        let dir = tempfile::tempdir().unwrap();
        let house = house(
            dir.path(),
            Predicate::of(Filter::parse("data").unwrap()),
        );
        let outside = PieceSpec::new(info("other/f", 8), 0).unwrap();
        assert!(!house.process_notice(1, &outside));
    }

    #[test]
    fn test_done_for_bounded_predicate() {
        let dir = tempfile::tempdir().unwrap();
        let mut predicate = Predicate::nothing();
        predicate.add(Filter::parse("data/f").unwrap());
        let house = house(dir.path(), predicate);

        let info = info("data/f", 16);
        let (used, done) = house.process_piece(1, &piece(&info, 0)).unwrap();
        assert!(used);
        assert!(!done);
        let (used, done) = house.process_piece(1, &piece(&info, 1)).unwrap();
        assert!(used);
        assert!(done);
        assert!(*house.done().borrow());
    }

    #[test]
    fn test_duplicate_piece_is_not_used() {
        let dir = tempfile::tempdir().unwrap();
        let house = house(dir.path(), Predicate::everything());
        let info = info("f", 8);
        let (used, _) = house.process_piece(1, &piece(&info, 0)).unwrap();
        assert!(used);
        let (used, _) = house.process_piece(2, &piece(&info, 0)).unwrap();
        assert!(!used);
    }
}
