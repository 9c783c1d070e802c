use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use crate::{
    data::{FileId, FilePieceSpecSet, Piece, PieceSpecSet},
    wire,
};
use super::PeerError;

/// Messages carried on the NOTICE stream: what the sender has gained
/// or lost since the last notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Addition(FilePieceSpecSet),
    RemovedFile(FileId),
    RemovedFiles(Vec<FileId>),
}

/// The one message on the REQUEST stream: pieces the remote wants the
/// local node to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request(pub PieceSpecSet);

pub struct NoticeCodec;

impl Encoder<Notice> for NoticeCodec {
    type Error = PeerError;

    fn encode(&mut self, notice: Notice, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mark = wire::start_frame(dst);
        match &notice {
            Notice::Addition(set) => {
                dst.extend_from_slice(&[0]);
                wire::put_file_set(dst, set);
            }
            Notice::RemovedFile(id) => {
                dst.extend_from_slice(&[1]);
                wire::put_file_id(dst, id);
            }
            Notice::RemovedFiles(ids) => {
                dst.extend_from_slice(&[2]);
                dst.extend_from_slice(&(ids.len() as u32).to_be_bytes());
                for id in ids {
                    wire::put_file_id(dst, id);
                }
            }
        }
        wire::finish_frame(dst, mark);
        Ok(())
    }
}

impl Decoder for NoticeCodec {
    type Item = Notice;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut payload = match wire::take_frame(src)? {
            Some(payload) => payload,
            None => return Ok(None),
        };
        let notice = match wire::get_u8(&mut payload)? {
            0 => Notice::Addition(wire::get_file_set(&mut payload)?),
            1 => Notice::RemovedFile(wire::get_file_id(&mut payload)?),
            2 => {
                let count = wire::get_u32(&mut payload)?;
                let mut ids = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    ids.push(wire::get_file_id(&mut payload)?);
                }
                Notice::RemovedFiles(ids)
            }
            tag => {
                return Err(wire::WireError::InvalidTag {
                    kind: "notice",
                    tag,
                }
                .into())
            }
        };
        Ok(Some(notice))
    }
}

pub struct RequestCodec;

impl Encoder<Request> for RequestCodec {
    type Error = PeerError;

    fn encode(&mut self, request: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mark = wire::start_frame(dst);
        wire::put_spec_set(dst, &request.0);
        wire::finish_frame(dst, mark);
        Ok(())
    }
}

impl Decoder for RequestCodec {
    type Item = Request;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut payload = match wire::take_frame(src)? {
            Some(payload) => payload,
            None => return Ok(None),
        };
        Ok(Some(Request(wire::get_spec_set(&mut payload)?)))
    }
}

pub struct PieceCodec;

impl Encoder<Piece> for PieceCodec {
    type Error = PeerError;

    fn encode(&mut self, piece: Piece, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mark = wire::start_frame(dst);
        wire::put_piece(dst, &piece);
        wire::finish_frame(dst, mark);
        Ok(())
    }
}

impl Decoder for PieceCodec {
    type Item = Piece;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut payload = match wire::take_frame(src)? {
            Some(payload) => payload,
            None => return Ok(None),
        };
        Ok(Some(wire::get_piece(&mut payload)?))
    }
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notice::Addition(set) => write!(f, "addition of {}", set),
            Notice::RemovedFile(id) => write!(f, "removal of {}", id),
            Notice::RemovedFiles(ids) => write!(f, "removal of {} files", ids.len()),
        }
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "request for {}", self.0)
    }
}
