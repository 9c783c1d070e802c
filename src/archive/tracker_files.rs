use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
};
use crate::tracker::Topology;
use super::{Archive, Result};

/// Persists the last known topology for one tracker under a reserved
/// hidden sub-path of the archive. This is the discovery fallback: a
/// node that cannot reach the tracker can still find peers from the
/// snapshot any healthy node wrote here.
pub struct DistributedTrackerFiles {
    archive: Arc<Archive>,
    tracker: SocketAddr,

    // Last artifact written; identical snapshots are not rewritten.
    last: Mutex<Option<Vec<u8>>>,
}

impl DistributedTrackerFiles {
    pub fn new(archive: Arc<Archive>, tracker: SocketAddr) -> Self {
        DistributedTrackerFiles {
            archive,
            tracker,
            last: Mutex::new(None),
        }
    }

    fn artifact_path(&self) -> PathBuf {
        self.archive
            .hidden_root()
            .join("tracker")
            .join(self.tracker.to_string())
            .join("Topology")
    }

    pub fn store(&self, topology: &Topology) -> Result<()> {
        let bytes = topology.to_bytes();
        let mut last = self.last.lock()?;
        if last.as_deref() == Some(&bytes[..]) {
            return Ok(());
        }

        let path = self.artifact_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write-then-rename, so a reader never sees a torn artifact.
        let staging = path.with_extension("new");
        std::fs::write(&staging, &bytes)?;
        std::fs::rename(&staging, &path)?;
        *last = Some(bytes);
        tracing::debug!("persisted topology for tracker {}", self.tracker);
        Ok(())
    }

    pub fn load(&self) -> Result<Option<Topology>> {
        let path = self.artifact_path();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match Topology::from_bytes(&bytes) {
            Ok(topology) => Ok(Some(topology)),
            Err(e) => {
                tracing::warn!("discarding corrupt topology artifact {:?}: {}", path, e);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tracker_files_tests {
    use super::*;
    use crate::data::Filter;

    #[test]
    fn test_store_load_round_trip_and_debounce() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Arc::new(Archive::open(dir.path(), 8, 3600, 16).unwrap());
        let tracker: SocketAddr = "127.0.0.1:3999".parse().unwrap();
        let files = DistributedTrackerFiles::new(archive, tracker);

        assert!(files.load().unwrap().is_none());

        let mut topology = Topology::new();
        topology.insert("127.0.0.1:5000".parse().unwrap(), Filter::Everything);
        files.store(&topology).unwrap();

        let path = dir.path().join(".sruth/tracker/127.0.0.1:3999/Topology");
        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();

        // Identical snapshot: the artifact is left untouched.
        std::thread::sleep(std::time::Duration::from_millis(20));
        files.store(&topology).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), mtime);

        assert_eq!(files.load().unwrap().unwrap(), topology);

        // A different snapshot rewrites it.
        topology.insert("127.0.0.1:6000".parse().unwrap(), Filter::Everything);
        files.store(&topology).unwrap();
        assert_eq!(files.load().unwrap().unwrap(), topology);
    }
}
