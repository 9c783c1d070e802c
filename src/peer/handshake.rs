use std::net::SocketAddr;
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use crate::{data::Filter, wire};
use super::PeerError;

/// First frame on each of the three streams of a connection. The nonce
/// groups the streams on the accepting side; the server address and
/// filter identify the initiating node and what it wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub nonce: u64,
    pub server: SocketAddr,
    pub filter: Filter,
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = PeerError;

    fn encode(&mut self, handshake: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mark = wire::start_frame(dst);
        dst.extend_from_slice(&handshake.nonce.to_be_bytes());
        wire::put_addr(dst, &handshake.server);
        wire::put_filter(dst, &handshake.filter);
        wire::finish_frame(dst, mark);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut payload = match wire::take_frame(src)? {
            Some(payload) => payload,
            None => return Ok(None),
        };
        let nonce = wire::get_u64(&mut payload)?;
        let server = wire::get_addr(&mut payload)?;
        let filter = wire::get_filter(&mut payload)?;
        Ok(Some(Handshake {
            nonce,
            server,
            filter,
        }))
    }
}

impl std::fmt::Display for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "handshake {{ nonce: {}, server: {}, filter: {} }}",
            hex::encode(self.nonce.to_be_bytes()),
            self.server,
            self.filter,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_round_trip() {
        let handshake = Handshake {
            nonce: 0xdead_beef_0102_0304,
            server: "127.0.0.1:3880".parse().unwrap(),
            filter: Filter::parse("data/sub").unwrap(),
        };
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake.clone(), &mut buf).unwrap();
        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_handshake_decode_incomplete() {
        let handshake = Handshake {
            nonce: 1,
            server: "10.0.0.1:4000".parse().unwrap(),
            filter: Filter::Everything,
        };
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        let mut partial = BytesMut::from(&buf[..buf.len() - 2]);
        assert!(HandshakeCodec.decode(&mut partial).unwrap().is_none());
    }
}
