use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Mutex,
};
use crate::{
    data::{ArchivePath, ArchiveTime, FileId, FileInfo, FilePieceSpecSet, Filter, Piece,
        PieceSpec, HIDDEN_COMPONENT},
    Bitfield,
};
use super::{ArchiveError, PutOutcome, Result};

/// Crash-safe on-disk store of files, addressable by piece.
///
/// Visible files below the root are always complete. In-progress files
/// live under the hidden `.sruth` subtree and move into place with a
/// single rename when their last piece arrives.
pub struct Archive {
    root: PathBuf,

    // Defaults applied to files discovered on disk.
    piece_size: u32,
    ttl_secs: u32,

    inner: Mutex<Inner>,
}

struct Inner {
    // Per-version state, in-progress and complete.
    files: HashMap<FileId, FileEntry>,

    // Latest known version per path.
    by_path: HashMap<ArchivePath, FileId>,

    // Which entries currently hold an open handle. Eviction closes the
    // handle; the next access reopens it.
    open: lru::LruCache<FileId, ()>,
}

struct FileEntry {
    info: FileInfo,
    received: Bitfield,
    handle: Option<File>,
    complete: bool,
}

impl Archive {
    pub fn open(root: impl Into<PathBuf>, piece_size: u32, ttl_secs: u32, open_file_limit: usize) -> Result<Archive> {
        let root = root.into();
        std::fs::create_dir_all(root.join(HIDDEN_COMPONENT))?;
        let cap = NonZeroUsize::new(open_file_limit.max(1)).expect("max(1) is non-zero");
        tracing::debug!("opened archive at {:?}", root);
        Ok(Archive {
            root,
            piece_size,
            ttl_secs,
            inner: Mutex::new(Inner {
                files: HashMap::new(),
                by_path: HashMap::new(),
                open: lru::LruCache::new(cap),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn hidden_root(&self) -> PathBuf {
        self.root.join(HIDDEN_COMPONENT)
    }

    fn visible_path(&self, path: &ArchivePath) -> PathBuf {
        self.root.join(path.to_rel_path())
    }

    fn hidden_path(&self, path: &ArchivePath) -> PathBuf {
        self.root.join(path.hide().to_rel_path())
    }

    /// Writes one piece. Concurrent puts for the same file serialize on
    /// the archive lock; the caller that stores the last missing piece
    /// performs the rename into the visible tree.
    pub fn put_piece(&self, piece: &Piece) -> Result<PutOutcome> {
        let spec = &piece.spec;
        let id = &spec.info.id;

        let mut inner = self.inner.lock()?;
        let inner = &mut *inner;
        ensure_entry(inner, self, &spec.info)?;

        {
            let entry = &inner.files[id];
            if entry.info != spec.info {
                return Err(ArchiveError::InfoMismatch(id.path.clone()));
            }
            if entry.complete || entry.received[spec.index as usize] {
                return Ok(PutOutcome::Duplicate);
            }
        }

        touch_open(inner, self, id)?;
        let entry = inner.files.get_mut(id).expect("entry was just ensured");
        let handle = entry.handle.as_mut().expect("handle was just opened");
        handle.seek(SeekFrom::Start(spec.offset()))?;
        handle.write_all(&piece.data)?;
        entry.received.set(spec.index as usize, true);

        if !entry.received.all() {
            return Ok(PutOutcome::Incomplete);
        }

        // Last piece: sync, close the write handle and move the file
        // into the visible tree in one rename.
        handle.sync_all()?;
        entry.handle = None;
        inner.open.pop(id);
        let visible = self.visible_path(&id.path);
        if let Some(parent) = visible.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(self.hidden_path(&id.path), &visible)?;
        entry.complete = true;
        tracing::debug!("completed {}", entry.info);
        Ok(PutOutcome::Completed)
    }

    /// Reads one piece. A piece can be served as soon as it has been
    /// received, whether or not the rest of its file has arrived; a
    /// piece the archive does not hold is never fabricated.
    pub fn get_piece(&self, spec: &PieceSpec) -> Result<Option<Piece>> {
        let id = &spec.info.id;
        let mut inner = self.inner.lock()?;
        let inner = &mut *inner;
        ensure_entry(inner, self, &spec.info)?;

        let entry = &inner.files[id];
        if entry.info != spec.info || !entry.received[spec.index as usize] {
            return Ok(None);
        }

        touch_open(inner, self, id)?;
        let entry = inner.files.get_mut(id).expect("entry was just ensured");
        let handle = entry.handle.as_mut().expect("handle was just opened");
        handle.seek(SeekFrom::Start(spec.offset()))?;
        let mut data = vec![0; spec.len()];
        handle.read_exact(&mut data)?;
        Ok(Some(Piece::new(spec.clone(), data.into())?))
    }

    /// Whether the piece has been received, per the per-file bitset.
    pub fn exists(&self, spec: &PieceSpec) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return false,
        };
        let inner = &mut *inner;
        if ensure_entry(inner, self, &spec.info).is_err() {
            return false;
        }
        let entry = &inner.files[&spec.info.id];
        entry.info == spec.info && entry.received[spec.index as usize]
    }

    /// Registers an existing visible file, deriving its descriptor from
    /// size and modification time. Publishers call this for files
    /// dropped into the root.
    pub fn assimilate(&self, path: &ArchivePath) -> Result<FileInfo> {
        let mut inner = self.inner.lock()?;
        if let Some(id) = inner.by_path.get(path) {
            if let Some(entry) = inner.files.get(id) {
                if entry.complete {
                    return Ok(entry.info.clone());
                }
            }
        }

        let meta = std::fs::metadata(self.visible_path(path))?;
        if !meta.is_file() {
            return Err(ArchiveError::NotAFile(path.clone()));
        }
        let time = meta
            .modified()
            .map(ArchiveTime::from)
            .unwrap_or_else(|_| ArchiveTime::now());
        let info = FileInfo::new(
            FileId::new(path.clone(), time),
            meta.len(),
            self.piece_size,
            self.ttl_secs,
        );
        insert_entry(&mut inner, complete_entry(info.clone()));
        Ok(info)
    }

    /// Enumerates every complete file whose path matches the filter as
    /// a whole-file piece set. The hidden subtree is skipped.
    pub fn walk(&self, filter: &Filter, mut consumer: impl FnMut(FilePieceSpecSet)) -> Result<()> {
        if filter.is_nothing() {
            return Ok(());
        }
        let walker = walkdir::WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| e.file_name() != HIDDEN_COMPONENT);
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("archive walk error: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = match entry.path().strip_prefix(&self.root) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            let path = match ArchivePath::from_rel_path(rel) {
                Ok(path) => path,
                Err(_) => {
                    tracing::warn!("skipping unrepresentable path: {:?}", rel);
                    continue;
                }
            };
            if !filter.matches(&path) {
                continue;
            }
            match self.assimilate(&path) {
                Ok(info) => consumer(FilePieceSpecSet::whole(info)),
                Err(e) => tracing::warn!("cannot take stock of {}: {}", path, e),
            }
        }
        Ok(())
    }

    /// Deletes the visible file, any hidden counterpart and any empty
    /// parent directories left behind.
    pub fn remove(&self, path: &ArchivePath) -> Result<()> {
        let mut inner = self.inner.lock()?;
        let ids: Vec<FileId> = inner
            .files
            .keys()
            .filter(|id| id.path == *path)
            .cloned()
            .collect();
        for id in &ids {
            inner.files.remove(id);
            inner.open.pop(id);
        }
        inner.by_path.remove(path);
        drop(inner);

        for target in [self.visible_path(path), self.hidden_path(path)] {
            match std::fs::remove_file(&target) {
                Ok(()) => self.clean_parents(&target),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::debug!("removed {}", path);
        Ok(())
    }

    // Removes empty directories from the file's parent up to the root.
    fn clean_parents(&self, removed: &Path) {
        let hidden_root = self.hidden_root();
        let mut dir = removed.parent();
        while let Some(parent) = dir {
            if parent == self.root || parent == hidden_root {
                break;
            }
            if std::fs::remove_dir(parent).is_err() {
                break;
            }
            dir = parent.parent();
        }
    }

    /// Whether a complete file is present at the path, in any version.
    pub fn has_complete(&self, path: &ArchivePath) -> bool {
        if let Ok(inner) = self.inner.lock() {
            if let Some(id) = inner.by_path.get(path) {
                if let Some(entry) = inner.files.get(id) {
                    if entry.complete {
                        return true;
                    }
                }
            }
        }
        self.visible_path(path).is_file()
    }

    /// Complete files whose time-to-live has elapsed.
    pub fn expired(&self, now: ArchiveTime) -> Vec<FileId> {
        match self.inner.lock() {
            Ok(inner) => inner
                .files
                .values()
                .filter(|e| e.complete && e.info.expires_at() <= now)
                .map(|e| e.info.id.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Flushes and closes every open handle.
    pub fn close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            for entry in inner.files.values_mut() {
                entry.handle = None;
            }
            inner.open.clear();
        }
    }
}

fn complete_entry(info: FileInfo) -> FileEntry {
    let received = Bitfield::repeat(true, info.piece_count() as usize);
    FileEntry {
        info,
        received,
        handle: None,
        complete: true,
    }
}

fn insert_entry(inner: &mut Inner, entry: FileEntry) {
    inner
        .by_path
        .insert(entry.info.id.path.clone(), entry.info.id.clone());
    inner.files.insert(entry.info.id.clone(), entry);
}

// Creates the in-memory entry for a file version if it is not yet
// known.
fn ensure_entry(inner: &mut Inner, archive: &Archive, info: &FileInfo) -> Result<()> {
    if inner.files.contains_key(&info.id) {
        return Ok(());
    }
    // A visible file of the right size counts as complete, unless the
    // path is already known under a different version: then this id is
    // a republication whose content must actually arrive.
    let known_other = inner
        .by_path
        .get(&info.id.path)
        .map_or(false, |known| *known != info.id);
    let complete = !known_other
        && match std::fs::metadata(archive.visible_path(&info.id.path)) {
            Ok(meta) => meta.is_file() && meta.len() == info.file_size,
            Err(_) => false,
        };
    let received = Bitfield::repeat(complete, info.piece_count() as usize);
    insert_entry(
        inner,
        FileEntry {
            info: info.clone(),
            received,
            handle: None,
            complete,
        },
    );
    Ok(())
}

// Makes sure the entry holds an open handle and refreshes its slot in
// the LRU, closing whichever handle falls off the end.
fn touch_open(inner: &mut Inner, archive: &Archive, id: &FileId) -> Result<()> {
    let entry = inner.files.get_mut(id).expect("entry exists before open");
    if entry.handle.is_none() {
        let file = if entry.complete {
            File::open(archive.visible_path(&id.path))?
        } else {
            let hidden = archive.hidden_path(&id.path);
            if let Some(parent) = hidden.parent() {
                std::fs::create_dir_all(parent)?;
            }
            OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(hidden)?
        };
        entry.handle = Some(file);
    }
    if let Some((evicted, _)) = inner.open.push(id.clone(), ()) {
        if evicted != *id {
            if let Some(entry) = inner.files.get_mut(&evicted) {
                entry.handle = None;
            }
        }
    }
    Ok(())
}
