use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use bytes::BytesMut;
use futures::StreamExt;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use crate::{
    clearing::ClearingHouse,
    peer::{Handshake, HandshakeCodec, Peer, PeerCounter, PeerError, Result},
};
use super::{configure_stream, connection::STREAM_COUNT, Connection};

// How often to retry when an ephemeral base port collides.
const EPHEMERAL_BIND_ATTEMPTS: usize = 16;

/// Accepts inbound peer connections on three consecutive TCP ports.
///
/// Each accepted socket delivers a handshake; the factory groups
/// sockets by handshake nonce and spawns a peer once a triple is
/// complete. Also remembers every remote server address it has seen,
/// which the client manager uses when ranking candidates.
pub struct Server {
    addr: SocketAddr,
    clearing: Arc<ClearingHouse>,
    factory: ConnectionFactory,
    known: Mutex<HashSet<SocketAddr>>,
    listeners: Mutex<Option<Vec<TcpListener>>>,
    cancel: CancellationToken,
    handshake_guard: Duration,
}

impl Server {
    /// Binds the three stream ports. A base port of zero picks a free
    /// consecutive triple.
    pub async fn bind(
        host: IpAddr,
        base_port: u16,
        handshake_guard: Duration,
        clearing: Arc<ClearingHouse>,
        cancel: CancellationToken,
    ) -> std::io::Result<Arc<Server>> {
        let (addr, listeners) = if base_port != 0 {
            bind_triple(host, base_port).await?
        } else {
            bind_ephemeral(host).await?
        };
        tracing::info!("server listening on {} (three ports)", addr);
        Ok(Arc::new(Server {
            addr,
            clearing,
            factory: ConnectionFactory::default(),
            known: Mutex::new(HashSet::new()),
            listeners: Mutex::new(Some(listeners)),
            cancel,
            handshake_guard,
        }))
    }

    /// The base address peers dial; streams live at port, port+1 and
    /// port+2.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn known_servers(&self) -> HashSet<SocketAddr> {
        self.known
            .lock()
            .map(|known| known.clone())
            .unwrap_or_default()
    }

    pub fn spawn(self: &Arc<Self>) {
        let server = self.clone();
        tokio::spawn(
            async move { server.accept_loop().await }
                .instrument(tracing::info_span!("server", addr = %self.addr)),
        );
    }

    async fn accept_loop(self: Arc<Self>) {
        let mut listeners = match self.listeners.lock().ok().and_then(|mut l| l.take()) {
            Some(listeners) => listeners,
            None => return,
        };
        let (l2, l1, l0) = match (listeners.pop(), listeners.pop(), listeners.pop()) {
            (Some(l2), Some(l1), Some(l0)) => (l2, l1, l0),
            _ => return,
        };

        loop {
            let (index, accepted) = tokio::select! {
                _ = self.cancel.cancelled() => return,
                r = l0.accept() => (0, r),
                r = l1.accept() => (1, r),
                r = l2.accept() => (2, r),
            };
            let (stream, from) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("accept error: {}", e);
                    continue;
                }
            };
            let server = self.clone();
            tokio::spawn(
                async move {
                    if let Err(e) = server.admit(index, stream).await {
                        tracing::debug!("inbound socket rejected: {}", e);
                    }
                }
                .instrument(tracing::debug_span!("inbound", %from, index)),
            );
        }
    }

    // Reads the handshake off one socket and hands it to the factory;
    // spawns the peer when the socket completes its triple.
    async fn admit(&self, index: usize, stream: TcpStream) -> Result<()> {
        configure_stream(&stream)?;
        let mut framed = Framed::new(stream, HandshakeCodec);
        let handshake = tokio::time::timeout(self.handshake_guard, framed.next())
            .await
            .map_err(|_| PeerError::HandshakeTimeout)?
            .ok_or(PeerError::NoHandshake)??;
        tracing::debug!("read: {}", handshake);

        let parts = framed.into_parts();
        let complete =
            self.factory
                .offer(index, handshake, parts.io, parts.read_buf, self.handshake_guard)?;
        let (handshake, connection) = match complete {
            Some(complete) => complete,
            None => return Ok(()),
        };

        if let Ok(mut known) = self.known.lock() {
            known.insert(handshake.server);
        }
        // Inbound sessions serve; this node's own wants ride the
        // sessions its client manager opens. Registering under Nothing
        // also lets a mutual pair of sessions between two nodes coexist
        // in the duplicate-suppression index.
        let peer = Peer {
            remote_server: handshake.server,
            local_filter: crate::data::Filter::Nothing,
            remote_filter: handshake.filter,
            clearing: self.clearing.clone(),
            counter: Arc::new(PeerCounter::new()),
            cancel: self.cancel.child_token(),
        };
        tokio::spawn(async move {
            match peer.run(connection).await {
                Ok(_) => {}
                Err(e) if e.is_network() => tracing::debug!("inbound session ended: {}", e),
                Err(e) => tracing::error!("inbound session failure: {}", e),
            }
        });
        Ok(())
    }
}

async fn bind_triple(host: IpAddr, base_port: u16) -> std::io::Result<(SocketAddr, Vec<TcpListener>)> {
    let mut listeners = Vec::with_capacity(STREAM_COUNT);
    for offset in 0..STREAM_COUNT as u16 {
        let port = base_port
            .checked_add(offset)
            .ok_or_else(|| std::io::Error::other("server port range overflows"))?;
        listeners.push(TcpListener::bind(SocketAddr::new(host, port)).await?);
    }
    Ok((SocketAddr::new(host, base_port), listeners))
}

async fn bind_ephemeral(host: IpAddr) -> std::io::Result<(SocketAddr, Vec<TcpListener>)> {
    let mut last_err = None;
    for _ in 0..EPHEMERAL_BIND_ATTEMPTS {
        let base_port: u16 = rand::thread_rng().gen_range(20_000..60_000);
        match bind_triple(host, base_port).await {
            Ok(bound) => return Ok(bound),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::other("no free port triple")))
}

// Groups half-open sockets by handshake nonce until all three streams
// of a connection have arrived.
#[derive(Default)]
struct ConnectionFactory {
    pending: Mutex<HashMap<u64, Pending>>,
}

struct Pending {
    handshake: Handshake,
    streams: [Option<(TcpStream, BytesMut)>; STREAM_COUNT],
    since: Instant,
}

impl ConnectionFactory {
    fn offer(
        &self,
        index: usize,
        handshake: Handshake,
        io: TcpStream,
        leftover: BytesMut,
        guard: Duration,
    ) -> Result<Option<(Handshake, Connection)>> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|e| PeerError::Task(e.to_string()))?;

        // Partial connections whose initiator went away.
        pending.retain(|nonce, p| {
            let fresh = p.since.elapsed() < guard;
            if !fresh {
                tracing::debug!("discarding stale connection {}", nonce);
            }
            fresh
        });

        let nonce = handshake.nonce;
        let entry = pending.entry(nonce).or_insert_with(|| Pending {
            handshake: handshake.clone(),
            streams: Default::default(),
            since: Instant::now(),
        });
        if entry.handshake != handshake || entry.streams[index].is_some() {
            // Mismatched identity on the same nonce: drop the whole
            // connection attempt.
            pending.remove(&nonce);
            return Err(PeerError::InconsistentHandshake(nonce));
        }
        entry.streams[index] = Some((io, leftover));
        if !entry.streams.iter().all(Option::is_some) {
            return Ok(None);
        }

        let entry = pending.remove(&nonce).expect("entry was just updated");
        let [notice, request, data] = entry.streams;
        let connection = Connection::assemble([
            notice.expect("stream present"),
            request.expect("stream present"),
            data.expect("stream present"),
        ]);
        Ok(Some((entry.handshake, connection)))
    }
}
