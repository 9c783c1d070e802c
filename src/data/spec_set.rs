use std::{collections::HashMap, fmt};
use crate::Bitfield;
use super::{FileId, FileInfo, PieceSpec};

/// The pieces of a single file, compressed as a bitset over piece
/// indices. All bits set is the whole-file sentinel; merging preserves
/// it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePieceSpecSet {
    info: FileInfo,
    pieces: Bitfield,
}

impl FilePieceSpecSet {
    pub fn whole(info: FileInfo) -> Self {
        let pieces = Bitfield::repeat(true, info.piece_count() as usize);
        FilePieceSpecSet { info, pieces }
    }

    pub fn single(info: FileInfo, index: u32) -> Self {
        debug_assert!(index < info.piece_count());
        let mut pieces = Bitfield::repeat(false, info.piece_count() as usize);
        pieces.set(index as usize, true);
        FilePieceSpecSet { info, pieces }
    }

    pub fn from_bits(info: FileInfo, pieces: Bitfield) -> Self {
        debug_assert_eq!(pieces.len(), info.piece_count() as usize);
        FilePieceSpecSet { info, pieces }
    }

    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    pub fn bits(&self) -> &Bitfield {
        &self.pieces
    }

    pub fn contains(&self, index: u32) -> bool {
        self.pieces
            .get(index as usize)
            .map(|b| *b)
            .unwrap_or(false)
    }

    pub fn is_whole(&self) -> bool {
        self.pieces.all()
    }

    pub fn iter_specs(&self) -> impl Iterator<Item = PieceSpec> + '_ {
        self.pieces.iter_ones().map(move |index| PieceSpec {
            info: self.info.clone(),
            index: index as u32,
        })
    }
}

impl fmt::Display for FilePieceSpecSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}/{} pieces",
            self.info.id,
            self.pieces.count_ones(),
            self.pieces.len()
        )
    }
}

/// A set of piece specs, stored per file as `FileInfo -> bitset`.
///
/// Merge is a pointwise union: commutative, associative and idempotent.
/// Removal prunes empty per-file entries so `is_empty` stays structural.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PieceSpecSet {
    files: HashMap<FileInfo, Bitfield>,
}

impl PieceSpecSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn contains(&self, spec: &PieceSpec) -> bool {
        self.files
            .get(&spec.info)
            .and_then(|bits| bits.get(spec.index as usize).map(|b| *b))
            .unwrap_or(false)
    }

    pub fn merge_spec(&mut self, spec: PieceSpec) {
        let count = spec.info.piece_count() as usize;
        let bits = self
            .files
            .entry(spec.info)
            .or_insert_with(|| Bitfield::repeat(false, count));
        bits.set(spec.index as usize, true);
    }

    pub fn merge_file(&mut self, set: FilePieceSpecSet) {
        let FilePieceSpecSet { info, pieces } = set;
        match self.files.entry(info) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                for index in pieces.iter_ones() {
                    entry.get_mut().set(index, true);
                }
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(pieces);
            }
        }
    }

    pub fn merge(&mut self, other: PieceSpecSet) {
        for (info, pieces) in other.files {
            self.merge_file(FilePieceSpecSet { info, pieces });
        }
    }

    pub fn remove_spec(&mut self, spec: &PieceSpec) {
        if let Some(bits) = self.files.get_mut(&spec.info) {
            if let Some(mut bit) = bits.get_mut(spec.index as usize) {
                *bit = false;
            }
            if bits.not_any() {
                self.files.remove(&spec.info);
            }
        }
    }

    pub fn remove_file(&mut self, id: &FileId) {
        self.files.retain(|info, _| info.id != *id);
    }

    /// Removes and returns the pieces of one file, if any.
    pub fn pop_file(&mut self) -> Option<FilePieceSpecSet> {
        let info = self.files.keys().next().cloned()?;
        let pieces = self.files.remove(&info)?;
        Some(FilePieceSpecSet { info, pieces })
    }

    /// Moves the whole set out, leaving the receiver empty.
    pub fn take(&mut self) -> PieceSpecSet {
        PieceSpecSet {
            files: std::mem::take(&mut self.files),
        }
    }

    pub fn iter_files(&self) -> impl Iterator<Item = FilePieceSpecSet> + '_ {
        self.files.iter().map(|(info, pieces)| FilePieceSpecSet {
            info: info.clone(),
            pieces: pieces.clone(),
        })
    }

    pub fn into_files(self) -> impl Iterator<Item = FilePieceSpecSet> {
        self.files
            .into_iter()
            .map(|(info, pieces)| FilePieceSpecSet { info, pieces })
    }

    pub fn iter_specs(&self) -> impl Iterator<Item = PieceSpec> + '_ {
        self.files.iter().flat_map(|(info, pieces)| {
            pieces.iter_ones().map(move |index| PieceSpec {
                info: info.clone(),
                index: index as u32,
            })
        })
    }
}

impl fmt::Display for PieceSpecSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} files", self.files.len())
    }
}
