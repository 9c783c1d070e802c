use bytes::BytesMut;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use crate::peer::{NoticeCodec, PieceCodec, RequestCodec};

// Stream order within a connection. The server binds one TCP port per
// stream at base + offset, in this order.
pub const STREAM_COUNT: usize = 3;

/// A peer-to-peer link: three full-duplex framed streams, one per
/// message kind, composed once all three sockets of a handshake have
/// arrived.
pub struct Connection {
    pub notice: Framed<TcpStream, NoticeCodec>,
    pub request: Framed<TcpStream, RequestCodec>,
    pub data: Framed<TcpStream, PieceCodec>,
}

impl Connection {
    // Each socket arrives with whatever bytes were read past its
    // handshake; those are carried into the stream codec's buffer.
    pub fn assemble(streams: [(TcpStream, BytesMut); STREAM_COUNT]) -> Connection {
        let [notice, request, data] = streams;
        Connection {
            notice: framed(notice, NoticeCodec),
            request: framed(request, RequestCodec),
            data: framed(data, PieceCodec),
        }
    }
}

fn framed<C>((io, leftover): (TcpStream, BytesMut), codec: C) -> Framed<TcpStream, C> {
    let mut framed = Framed::new(io, codec);
    framed.read_buffer_mut().extend_from_slice(&leftover);
    framed
}

/// Applies the link's socket options: no lingering close, no Nagle
/// interference with explicit flushes, keepalive probing on.
pub fn configure_stream(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(false)?;
    stream.set_linger(None)?;
    socket2::SockRef::from(stream).set_keepalive(true)?;
    Ok(())
}
