use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use crate::data::ArchivePath;
use super::{ArchiveEvent, Result};

// A created file is reported once no further write has been seen for
// this long, so a slow producer is announced exactly once.
const SETTLE: Duration = Duration::from_millis(250);

const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Watches an archive root and reports created and removed visible
/// files. The hidden subtree is ignored.
pub struct ArchiveWatcher {
    // Dropping the watcher stops the native watch.
    _watcher: notify::RecommendedWatcher,

    events: mpsc::UnboundedReceiver<ArchiveEvent>,
}

enum RawEvent {
    Touched(ArchivePath),
    Removed(ArchivePath),
}

impl ArchiveWatcher {
    pub fn new(root: &Path) -> Result<ArchiveWatcher> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let root_buf = root.to_path_buf();

        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!("watch error: {}", e);
                    return;
                }
            };
            let make: fn(ArchivePath) -> RawEvent = match event.kind {
                EventKind::Create(_) | EventKind::Modify(_) => RawEvent::Touched,
                EventKind::Remove(_) => RawEvent::Removed,
                _ => return,
            };
            for path in event.paths {
                if let Some(archive_path) = to_archive_path(&root_buf, &path) {
                    let _ = raw_tx.send(make(archive_path));
                }
            }
        })?;
        watcher.watch(root, RecursiveMode::Recursive)?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(debounce(root.to_path_buf(), raw_rx, event_tx));

        Ok(ArchiveWatcher {
            _watcher: watcher,
            events: event_rx,
        })
    }

    pub async fn next(&mut self) -> Option<ArchiveEvent> {
        self.events.recv().await
    }
}

// Collapses bursts of write events into a single Created notification
// per file, emitted once the file has been quiet for SETTLE.
async fn debounce(
    root: PathBuf,
    mut raw_rx: mpsc::UnboundedReceiver<RawEvent>,
    event_tx: mpsc::UnboundedSender<ArchiveEvent>,
) {
    let mut pending: HashMap<ArchivePath, Instant> = HashMap::new();
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            raw = raw_rx.recv() => match raw {
                Some(RawEvent::Touched(path)) => {
                    pending.insert(path, Instant::now());
                }
                Some(RawEvent::Removed(path)) => {
                    pending.remove(&path);
                    if event_tx.send(ArchiveEvent::Removed(path)).is_err() {
                        return;
                    }
                }
                None => return,
            },

            _ = ticker.tick() => {
                let now = Instant::now();
                let ready: Vec<ArchivePath> = pending
                    .iter()
                    .filter(|(_, last)| now.duration_since(**last) >= SETTLE)
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in ready {
                    pending.remove(&path);
                    // Directories settle too; only files are reported.
                    let on_disk = root.join(path.to_rel_path());
                    if !on_disk.is_file() {
                        continue;
                    }
                    if event_tx.send(ArchiveEvent::Created(path)).is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn to_archive_path(root: &Path, path: &Path) -> Option<ArchivePath> {
    let rel = path.strip_prefix(root).ok()?;
    let archive_path = ArchivePath::from_rel_path(rel).ok()?;
    if archive_path.is_hidden() {
        return None;
    }
    Some(archive_path)
}
