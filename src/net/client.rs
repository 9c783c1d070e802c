use std::{net::SocketAddr, sync::Arc, time::Duration};
use bytes::BytesMut;
use futures::SinkExt;
use tokio::net::TcpStream;
use tokio_util::{codec::Framed, sync::CancellationToken};
use crate::{
    clearing::ClearingHouse,
    data::Filter,
    peer::{Handshake, HandshakeCodec, Peer, PeerCounter, PeerError, Result},
};
use super::{configure_stream, connection::STREAM_COUNT, Connection};

/// Opens the three outbound streams to one remote server, performs the
/// initiating side of the handshake and runs a peer on the result.
pub struct Client {
    pub remote_server: SocketAddr,

    // Advertised in the handshake so the remote can identify this node
    // and suppress duplicate sessions.
    pub local_server: SocketAddr,

    pub local_filter: Filter,

    pub remote_filter: Filter,

    pub clearing: Arc<ClearingHouse>,

    pub counter: Arc<PeerCounter>,

    pub cancel: CancellationToken,

    pub connect_timeout: Duration,
}

impl Client {
    /// Mirrors `Peer::run`: true once all locally desired data has
    /// been received over a valid session.
    #[tracing::instrument(name = "client", skip(self), fields(remote = %self.remote_server))]
    pub async fn run(self) -> Result<bool> {
        let nonce: u64 = rand::random();
        let mut streams = Vec::with_capacity(STREAM_COUNT);

        for offset in 0..STREAM_COUNT as u16 {
            let port = self
                .remote_server
                .port()
                .checked_add(offset)
                .ok_or_else(|| PeerError::Io(std::io::Error::other("port range overflows")))?;
            let addr = SocketAddr::new(self.remote_server.ip(), port);
            let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| PeerError::HandshakeTimeout)??;
            configure_stream(&stream)?;

            let mut framed = Framed::new(stream, HandshakeCodec);
            framed
                .send(Handshake {
                    nonce,
                    server: self.local_server,
                    filter: self.local_filter.clone(),
                })
                .await?;
            let parts = framed.into_parts();
            streams.push((parts.io, parts.read_buf));
        }

        let streams: [(TcpStream, BytesMut); STREAM_COUNT] = streams
            .try_into()
            .map_err(|_| PeerError::Task("stream count mismatch".into()))?;
        tracing::debug!("connection ready");

        let peer = Peer {
            remote_server: self.remote_server,
            local_filter: self.local_filter,
            remote_filter: self.remote_filter,
            clearing: self.clearing,
            counter: self.counter,
            cancel: self.cancel,
        };
        peer.run(Connection::assemble(streams)).await
    }
}
