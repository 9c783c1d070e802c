use bytes::Bytes;
use crate::data::{ArchivePath, ArchiveTime, FileId, FileInfo, Filter, Piece, PieceSpec};
use super::{Archive, PutOutcome};

const PIECE: u32 = 8;

fn archive(dir: &std::path::Path) -> Archive {
    Archive::open(dir, PIECE, 3600, 512).unwrap()
}

fn info(name: &str, size: u64) -> FileInfo {
    FileInfo::new(
        FileId::new(ArchivePath::parse(name).unwrap(), ArchiveTime::from_micros(42)),
        size,
        PIECE,
        3600,
    )
}

fn piece(info: &FileInfo, index: u32, fill: u8) -> Piece {
    let spec = PieceSpec::new(info.clone(), index).unwrap();
    let data = Bytes::from(vec![fill; spec.len()]);
    Piece::new(spec, data).unwrap()
}

#[test]
fn test_put_get_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let archive = archive(dir.path());
    let info = info("data/f", 13);

    assert_eq!(archive.put_piece(&piece(&info, 0, 1)).unwrap(), PutOutcome::Incomplete);
    assert_eq!(archive.put_piece(&piece(&info, 1, 2)).unwrap(), PutOutcome::Completed);

    for index in 0..2 {
        let got = archive
            .get_piece(&PieceSpec::new(info.clone(), index).unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(got, piece(&info, index, (index + 1) as u8));
    }
}

#[test]
fn test_out_of_order_pieces_complete() {
    let dir = tempfile::tempdir().unwrap();
    let archive = archive(dir.path());
    let info = info("data/f", 24);

    assert_eq!(archive.put_piece(&piece(&info, 2, 3)).unwrap(), PutOutcome::Incomplete);
    assert_eq!(archive.put_piece(&piece(&info, 0, 1)).unwrap(), PutOutcome::Incomplete);
    assert_eq!(archive.put_piece(&piece(&info, 1, 2)).unwrap(), PutOutcome::Completed);

    let visible = dir.path().join("data/f");
    assert_eq!(std::fs::metadata(visible).unwrap().len(), 24);
}

#[test]
fn test_incomplete_file_stays_hidden() {
    let dir = tempfile::tempdir().unwrap();
    let archive = archive(dir.path());
    let info = info("data/f", 24);

    archive.put_piece(&piece(&info, 0, 1)).unwrap();
    assert!(!dir.path().join("data/f").exists());
    assert!(dir.path().join(".sruth/data/f").exists());

    // The received piece is already servable.
    let spec = PieceSpec::new(info.clone(), 0).unwrap();
    assert!(archive.exists(&spec));
    assert!(archive.get_piece(&spec).unwrap().is_some());
    // The missing one is not fabricated.
    let missing = PieceSpec::new(info, 1).unwrap();
    assert!(!archive.exists(&missing));
    assert!(archive.get_piece(&missing).unwrap().is_none());
}

#[test]
fn test_duplicate_put_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let archive = archive(dir.path());
    let info = info("f", 8);

    assert_eq!(archive.put_piece(&piece(&info, 0, 7)).unwrap(), PutOutcome::Completed);
    let before = std::fs::read(dir.path().join("f")).unwrap();
    // A differing payload for an already-present piece is ignored.
    assert_eq!(archive.put_piece(&piece(&info, 0, 9)).unwrap(), PutOutcome::Duplicate);
    let after = std::fs::read(dir.path().join("f")).unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_empty_file() {
    let dir = tempfile::tempdir().unwrap();
    let archive = archive(dir.path());
    let info = FileInfo::new(
        FileId::new(ArchivePath::parse("empty").unwrap(), ArchiveTime::from_micros(1)),
        0,
        0,
        3600,
    );
    assert_eq!(info.piece_count(), 1);

    let spec = PieceSpec::new(info.clone(), 0).unwrap();
    let piece = Piece::new(spec.clone(), Bytes::new()).unwrap();
    assert_eq!(archive.put_piece(&piece).unwrap(), PutOutcome::Completed);
    assert_eq!(std::fs::metadata(dir.path().join("empty")).unwrap().len(), 0);
    assert_eq!(archive.get_piece(&spec).unwrap().unwrap().data.len(), 0);
}

#[test]
fn test_remove_cleans_empty_parents() {
    let dir = tempfile::tempdir().unwrap();
    let archive = archive(dir.path());
    let info = info("a/b/c/f", 8);
    archive.put_piece(&piece(&info, 0, 1)).unwrap();

    archive.remove(&ArchivePath::parse("a/b/c/f").unwrap()).unwrap();
    assert!(!dir.path().join("a").exists());
    assert!(dir.path().exists());
}

#[test]
fn test_walk_skips_hidden_and_honors_filter() {
    let dir = tempfile::tempdir().unwrap();
    let archive = archive(dir.path());

    std::fs::create_dir_all(dir.path().join("data/sub")).unwrap();
    std::fs::write(dir.path().join("data/f1"), b"one").unwrap();
    std::fs::write(dir.path().join("data/sub/f2"), b"two").unwrap();
    std::fs::write(dir.path().join("other"), b"three").unwrap();
    // In-progress counterpart must not be enumerated.
    std::fs::create_dir_all(dir.path().join(".sruth/data")).unwrap();
    std::fs::write(dir.path().join(".sruth/data/f3"), b"hidden").unwrap();

    let mut seen = Vec::new();
    archive
        .walk(&Filter::parse("data").unwrap(), |set| {
            assert!(set.is_whole());
            seen.push(set.info().id.path.to_string());
        })
        .unwrap();
    seen.sort();
    assert_eq!(seen, ["data/f1", "data/sub/f2"]);
}

#[test]
fn test_assimilate_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let archive = archive(dir.path());
    std::fs::write(dir.path().join("f"), vec![5; 20]).unwrap();

    let path = ArchivePath::parse("f").unwrap();
    let first = archive.assimilate(&path).unwrap();
    let second = archive.assimilate(&path).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.file_size, 20);
    assert_eq!(first.piece_count(), 3);

    // Pieces of an assimilated file are servable immediately.
    let spec = PieceSpec::new(first, 2).unwrap();
    let got = archive.get_piece(&spec).unwrap().unwrap();
    assert_eq!(&got.data[..], &[5, 5, 5, 5]);
}

#[test]
fn test_open_file_cache_eviction_is_transparent() {
    let dir = tempfile::tempdir().unwrap();
    // Cache of two handles, three files in rotation.
    let archive = Archive::open(dir.path(), PIECE, 3600, 2).unwrap();
    let infos: Vec<FileInfo> = (0..3).map(|i| info(&format!("f{}", i), 16)).collect();

    for info in &infos {
        archive.put_piece(&piece(info, 0, 1)).unwrap();
    }
    for info in &infos {
        archive.put_piece(&piece(info, 1, 2)).unwrap();
    }
    for info in &infos {
        let spec = PieceSpec::new(info.clone(), 1).unwrap();
        assert_eq!(archive.get_piece(&spec).unwrap().unwrap().data[0], 2);
    }
}

#[test]
fn test_expired_files_are_listed() {
    let dir = tempfile::tempdir().unwrap();
    let archive = archive(dir.path());
    let info = FileInfo::new(
        FileId::new(ArchivePath::parse("f").unwrap(), ArchiveTime::from_micros(0)),
        8,
        PIECE,
        1,
    );
    archive.put_piece(&piece(&info, 0, 1)).unwrap();

    assert!(archive.expired(ArchiveTime::from_micros(500_000)).is_empty());
    let expired = archive.expired(ArchiveTime::from_micros(2_000_000));
    assert_eq!(expired, vec![info.id]);
}
