// Field-level binary encoding shared by the peer streams, the tracker
// protocol and the persisted topology artifact. Every frame on every
// stream is a u32 big-endian length prefix followed by the payload;
// the helpers here read and write the payload fields with explicit
// bounds checks so malformed input surfaces as an error instead of a
// panic.

use std::net::SocketAddr;
use bytes::{Buf, BufMut, BytesMut};
use crate::{
    data::{ArchivePath, ArchiveTime, FileId, FileInfo, FilePieceSpecSet, Filter, Piece,
        PieceSpec, PieceSpecSet, Segment},
    Bitfield,
};

// Upper bound on a single frame; larger prefixes are protocol errors.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

const MAX_STRING_LEN: usize = 4096;

pub type Result<T> = std::result::Result<T, WireError>;

#[derive(thiserror::Error, Debug)]
pub enum WireError {
    #[error("truncated frame")]
    Truncated,

    #[error("frame length {0} exceeds limit")]
    FrameTooLarge(usize),

    #[error("string length {0} exceeds limit")]
    StringTooLong(usize),

    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    #[error("invalid socket address: {0:?}")]
    InvalidAddr(String),

    #[error("invalid tag {tag} for {kind}")]
    InvalidTag { kind: &'static str, tag: u8 },

    #[error("invalid field: {0}")]
    InvalidField(#[from] crate::data::DataError),
}

// Frame helpers for the codecs. `start_frame` reserves the length
// prefix, `finish_frame` backfills it.

pub fn start_frame(dst: &mut BytesMut) -> usize {
    let mark = dst.len();
    dst.put_u32(0);
    mark
}

pub fn finish_frame(dst: &mut BytesMut, mark: usize) {
    let len = dst.len() - mark - 4;
    dst[mark..mark + 4].copy_from_slice(&(len as u32).to_be_bytes());
}

// Checks whether a whole frame is buffered; if so splits off and
// returns its payload.
pub fn take_frame(src: &mut BytesMut) -> Result<Option<BytesMut>> {
    if src.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    if src.len() < 4 + len {
        return Ok(None);
    }
    src.advance(4);
    Ok(Some(src.split_to(len)))
}

// Checked readers. bytes::Buf panics on underflow, so every read goes
// through a remaining() check first.

pub fn get_u8(src: &mut impl Buf) -> Result<u8> {
    if src.remaining() < 1 {
        return Err(WireError::Truncated);
    }
    Ok(src.get_u8())
}

pub fn get_u16(src: &mut impl Buf) -> Result<u16> {
    if src.remaining() < 2 {
        return Err(WireError::Truncated);
    }
    Ok(src.get_u16())
}

pub fn get_u32(src: &mut impl Buf) -> Result<u32> {
    if src.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(src.get_u32())
}

pub fn get_u64(src: &mut impl Buf) -> Result<u64> {
    if src.remaining() < 8 {
        return Err(WireError::Truncated);
    }
    Ok(src.get_u64())
}

pub fn get_i64(src: &mut impl Buf) -> Result<i64> {
    if src.remaining() < 8 {
        return Err(WireError::Truncated);
    }
    Ok(src.get_i64())
}

pub fn get_bytes(src: &mut impl Buf, len: usize) -> Result<Vec<u8>> {
    if src.remaining() < len {
        return Err(WireError::Truncated);
    }
    let mut buf = vec![0; len];
    src.copy_to_slice(&mut buf);
    Ok(buf)
}

pub fn put_string(dst: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= MAX_STRING_LEN);
    dst.put_u16(s.len() as u16);
    dst.extend_from_slice(s.as_bytes());
}

pub fn get_string(src: &mut impl Buf) -> Result<String> {
    let len = get_u16(src)? as usize;
    if len > MAX_STRING_LEN {
        return Err(WireError::StringTooLong(len));
    }
    let raw = get_bytes(src, len)?;
    String::from_utf8(raw).map_err(|_| WireError::InvalidUtf8)
}

pub fn put_addr(dst: &mut BytesMut, addr: &SocketAddr) {
    put_string(dst, &addr.to_string());
}

pub fn get_addr(src: &mut impl Buf) -> Result<SocketAddr> {
    let raw = get_string(src)?;
    raw.parse().map_err(|_| WireError::InvalidAddr(raw))
}

pub fn put_path(dst: &mut BytesMut, path: &ArchivePath) {
    put_string(dst, &path.to_string());
}

pub fn get_path(src: &mut impl Buf) -> Result<ArchivePath> {
    Ok(ArchivePath::parse(&get_string(src)?)?)
}

pub fn put_file_id(dst: &mut BytesMut, id: &FileId) {
    put_path(dst, &id.path);
    dst.put_i64(id.time.micros());
}

pub fn get_file_id(src: &mut impl Buf) -> Result<FileId> {
    let path = get_path(src)?;
    let time = ArchiveTime::from_micros(get_i64(src)?);
    Ok(FileId::new(path, time))
}

pub fn put_file_info(dst: &mut BytesMut, info: &FileInfo) {
    put_file_id(dst, &info.id);
    dst.put_u64(info.file_size);
    dst.put_u32(info.piece_size);
    dst.put_u32(info.ttl_secs);
}

pub fn get_file_info(src: &mut impl Buf) -> Result<FileInfo> {
    let id = get_file_id(src)?;
    let file_size = get_u64(src)?;
    let piece_size = get_u32(src)?;
    let ttl_secs = get_u32(src)?;
    if file_size > 0 && piece_size == 0 {
        return Err(WireError::InvalidTag {
            kind: "file info piece size",
            tag: 0,
        });
    }
    Ok(FileInfo::new(id, file_size, piece_size, ttl_secs))
}

pub fn put_piece_spec(dst: &mut BytesMut, spec: &PieceSpec) {
    put_file_info(dst, &spec.info);
    dst.put_u32(spec.index);
}

pub fn get_piece_spec(src: &mut impl Buf) -> Result<PieceSpec> {
    let info = get_file_info(src)?;
    let index = get_u32(src)?;
    Ok(PieceSpec::new(info, index)?)
}

pub fn put_piece(dst: &mut BytesMut, piece: &Piece) {
    put_piece_spec(dst, &piece.spec);
    dst.put_u32(piece.data.len() as u32);
    dst.extend_from_slice(&piece.data);
}

pub fn get_piece(src: &mut impl Buf) -> Result<Piece> {
    let spec = get_piece_spec(src)?;
    let len = get_u32(src)? as usize;
    let data = get_bytes(src, len)?;
    Ok(Piece::new(spec, data.into())?)
}

// A per-file bitset is written as ceil(piece_count / 8) raw MSB0
// bytes; the length is implied by the file info.
pub fn put_file_set(dst: &mut BytesMut, set: &FilePieceSpecSet) {
    put_file_info(dst, set.info());
    dst.extend_from_slice(set.bits().as_raw_slice());
}

pub fn get_file_set(src: &mut impl Buf) -> Result<FilePieceSpecSet> {
    let info = get_file_info(src)?;
    let bits = info.piece_count() as usize;
    let raw = get_bytes(src, (bits + 7) / 8)?;
    let mut field = Bitfield::from_vec(raw);
    field.truncate(bits);
    Ok(FilePieceSpecSet::from_bits(info, field))
}

pub fn put_spec_set(dst: &mut BytesMut, set: &PieceSpecSet) {
    dst.put_u32(set.file_count() as u32);
    for file in set.iter_files() {
        put_file_set(dst, &file);
    }
}

pub fn get_spec_set(src: &mut impl Buf) -> Result<PieceSpecSet> {
    let count = get_u32(src)?;
    let mut set = PieceSpecSet::new();
    for _ in 0..count {
        set.merge_file(get_file_set(src)?);
    }
    Ok(set)
}

pub fn put_filter(dst: &mut BytesMut, filter: &Filter) {
    match filter {
        Filter::Nothing => dst.put_u8(0),
        Filter::Everything => dst.put_u8(1),
        Filter::Pattern(segments) => {
            dst.put_u8(2);
            dst.put_u16(segments.len() as u16);
            for segment in segments {
                match segment {
                    Segment::Any => dst.put_u8(0),
                    Segment::Literal(s) => {
                        dst.put_u8(1);
                        put_string(dst, s);
                    }
                }
            }
        }
    }
}

pub fn get_filter(src: &mut impl Buf) -> Result<Filter> {
    match get_u8(src)? {
        0 => Ok(Filter::Nothing),
        1 => Ok(Filter::Everything),
        2 => {
            let count = get_u16(src)?;
            let mut segments = Vec::with_capacity(count as usize);
            for _ in 0..count {
                match get_u8(src)? {
                    0 => segments.push(Segment::Any),
                    1 => segments.push(Segment::Literal(get_string(src)?)),
                    tag => return Err(WireError::InvalidTag { kind: "segment", tag }),
                }
            }
            Ok(Filter::pattern(segments))
        }
        tag => Err(WireError::InvalidTag { kind: "filter", tag }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ArchivePath, ArchiveTime};

    fn sample_info() -> FileInfo {
        FileInfo::new(
            FileId::new(
                ArchivePath::parse("data/subdir/file").unwrap(),
                ArchiveTime::from_micros(1_700_000_000_000_000),
            ),
            1_000_000,
            0x20000,
            3600,
        )
    }

    #[test]
    fn test_filter_round_trip() {
        let filters = [
            Filter::Nothing,
            Filter::Everything,
            Filter::parse("data/subdir").unwrap(),
            Filter::parse("*/logs/today").unwrap(),
        ];
        for filter in filters {
            let mut buf = BytesMut::new();
            put_filter(&mut buf, &filter);
            let decoded = get_filter(&mut buf).unwrap();
            assert_eq!(decoded, filter);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_canonical_filters_decode_to_same_variant() {
        let mut buf = BytesMut::new();
        put_filter(&mut buf, &Filter::Everything);
        assert!(matches!(get_filter(&mut buf).unwrap(), Filter::Everything));
        put_filter(&mut buf, &Filter::Nothing);
        assert!(matches!(get_filter(&mut buf).unwrap(), Filter::Nothing));
    }

    #[test]
    fn test_spec_set_round_trip() {
        let mut set = PieceSpecSet::new();
        set.merge_file(FilePieceSpecSet::whole(sample_info()));
        set.merge_spec(PieceSpec::new(sample_info(), 3).unwrap());

        let mut buf = BytesMut::new();
        put_spec_set(&mut buf, &set);
        let decoded = get_spec_set(&mut buf).unwrap();
        assert_eq!(decoded, set);
        assert!(decoded.iter_files().next().unwrap().is_whole());
    }

    #[test]
    fn test_piece_round_trip() {
        let spec = PieceSpec::new(sample_info(), 7).unwrap();
        let data = vec![0xab; spec.len()];
        let piece = Piece::new(spec, data.into()).unwrap();
        let mut buf = BytesMut::new();
        put_piece(&mut buf, &piece);
        assert_eq!(get_piece(&mut buf).unwrap(), piece);
    }

    #[test]
    fn test_truncated_fields_error_instead_of_panic() {
        let mut buf = BytesMut::new();
        put_file_info(&mut buf, &sample_info());
        buf.truncate(buf.len() - 3);
        assert!(get_file_info(&mut buf).is_err());
    }

    #[test]
    fn test_frame_round_trip() {
        let mut buf = BytesMut::new();
        let mark = start_frame(&mut buf);
        put_string(&mut buf, "hello");
        finish_frame(&mut buf, mark);

        // Nothing yielded until the frame is whole.
        let mut partial = BytesMut::from(&buf[..3]);
        assert!(take_frame(&mut partial).unwrap().is_none());

        let mut payload = take_frame(&mut buf).unwrap().unwrap();
        assert_eq!(get_string(&mut payload).unwrap(), "hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversize_frame_is_a_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        assert!(take_frame(&mut buf).is_err());
    }
}
