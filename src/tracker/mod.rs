use std::{
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex},
};
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use crate::{data::Filter, wire};

mod proxy;
mod topology;

pub use proxy::{FilteredProxy, TrackerProxy};
pub use topology::Topology;

pub type Result<T> = std::result::Result<T, TrackerError>;

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] wire::WireError),

    #[error("tracker connect timeout")]
    Timeout,

    #[error("unexpected tracker response")]
    UnexpectedResponse,

    #[error("tracker unreachable and no persisted topology")]
    Unavailable,
}

impl TrackerError {
    /// Errors that mean the tracker could not be reached, as opposed
    /// to a live tracker misbehaving.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, TrackerError::Io(_) | TrackerError::Timeout | TrackerError::Unavailable)
    }
}

/// One tracker exchange is a single task frame followed by the
/// task-defined response, then the connection closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerMessage {
    /// "I'm server S offering filter F"; answered with a Plumber.
    Inquisitor { server: SocketAddr, filter: Filter },

    /// "Server S is offline"; no response.
    OfflineReporter { server: SocketAddr },

    /// Voluntary withdrawal of a live registration, sent at node
    /// shutdown; no response.
    Deregister { server: SocketAddr, filter: Filter },

    /// Answered with the current topology.
    TopologyRequest,

    /// Registration response: a topology snapshot plus the address of
    /// the source server.
    Plumber {
        topology: Topology,
        source: SocketAddr,
    },

    TopologyResponse(Topology),
}

pub struct TrackerCodec;

impl Encoder<TrackerMessage> for TrackerCodec {
    type Error = TrackerError;

    fn encode(&mut self, msg: TrackerMessage, dst: &mut BytesMut) -> Result<()> {
        let mark = wire::start_frame(dst);
        match &msg {
            TrackerMessage::Inquisitor { server, filter } => {
                dst.extend_from_slice(&[0]);
                wire::put_addr(dst, server);
                wire::put_filter(dst, filter);
            }
            TrackerMessage::OfflineReporter { server } => {
                dst.extend_from_slice(&[1]);
                wire::put_addr(dst, server);
            }
            TrackerMessage::TopologyRequest => dst.extend_from_slice(&[2]),
            TrackerMessage::Plumber { topology, source } => {
                dst.extend_from_slice(&[3]);
                topology.encode(dst);
                wire::put_addr(dst, source);
            }
            TrackerMessage::TopologyResponse(topology) => {
                dst.extend_from_slice(&[4]);
                topology.encode(dst);
            }
            TrackerMessage::Deregister { server, filter } => {
                dst.extend_from_slice(&[5]);
                wire::put_addr(dst, server);
                wire::put_filter(dst, filter);
            }
        }
        wire::finish_frame(dst, mark);
        Ok(())
    }
}

impl Decoder for TrackerCodec {
    type Item = TrackerMessage;
    type Error = TrackerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let mut payload = match wire::take_frame(src)? {
            Some(payload) => payload,
            None => return Ok(None),
        };
        let msg = match wire::get_u8(&mut payload)? {
            0 => TrackerMessage::Inquisitor {
                server: wire::get_addr(&mut payload)?,
                filter: wire::get_filter(&mut payload)?,
            },
            1 => TrackerMessage::OfflineReporter {
                server: wire::get_addr(&mut payload)?,
            },
            2 => TrackerMessage::TopologyRequest,
            3 => TrackerMessage::Plumber {
                topology: Topology::decode(&mut payload)?,
                source: wire::get_addr(&mut payload)?,
            },
            4 => TrackerMessage::TopologyResponse(Topology::decode(&mut payload)?),
            5 => TrackerMessage::Deregister {
                server: wire::get_addr(&mut payload)?,
                filter: wire::get_filter(&mut payload)?,
            },
            tag => {
                return Err(wire::WireError::InvalidTag {
                    kind: "tracker message",
                    tag,
                }
                .into())
            }
        };
        Ok(Some(msg))
    }
}

/// The central directory: filter -> set of servers, serving one task
/// per inbound connection.
pub struct Tracker {
    addr: SocketAddr,

    // The publisher's own server, handed to every registrant.
    source: SocketAddr,

    state: Mutex<Topology>,

    listener: Mutex<Option<TcpListener>>,

    cancel: CancellationToken,
}

impl Tracker {
    pub async fn bind(
        host: IpAddr,
        port: u16,
        source: SocketAddr,
        cancel: CancellationToken,
    ) -> std::io::Result<Arc<Tracker>> {
        let listener = TcpListener::bind(SocketAddr::new(host, port)).await?;
        let addr = listener.local_addr()?;
        tracing::info!("tracker listening on {}", addr);
        // The source belongs in the registry from the start: it serves
        // everything, so it backs any filter a subscriber brings.
        let mut state = Topology::new();
        state.insert(source, Filter::Everything);
        Ok(Arc::new(Tracker {
            addr,
            source,
            state: Mutex::new(state),
            listener: Mutex::new(Some(listener)),
            cancel,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn spawn(self: &Arc<Self>) {
        let tracker = self.clone();
        tokio::spawn(
            async move { tracker.accept_loop().await }
                .instrument(tracing::info_span!("tracker", addr = %self.addr)),
        );
    }

    async fn accept_loop(self: Arc<Self>) {
        let listener = match self.listener.lock().ok().and_then(|mut l| l.take()) {
            Some(listener) => listener,
            None => return,
        };
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => return,
                accepted = listener.accept() => accepted,
            };
            let (stream, from) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("tracker accept error: {}", e);
                    continue;
                }
            };
            let tracker = self.clone();
            tokio::spawn(async move {
                if let Err(e) = tracker.serve(stream).await {
                    tracing::debug!("tracker exchange with {} failed: {}", from, e);
                }
            });
        }
    }

    async fn serve(&self, stream: TcpStream) -> Result<()> {
        let mut framed = Framed::new(stream, TrackerCodec);
        let task = match framed.next().await {
            Some(task) => task?,
            None => return Ok(()),
        };
        match task {
            TrackerMessage::Inquisitor { server, filter } => {
                let topology = {
                    let mut state = self.state.lock().map_err(poisoned)?;
                    state.insert(server, filter.clone());
                    state.clone()
                };
                tracing::debug!("registered {} offering {}", server, filter);
                framed
                    .send(TrackerMessage::Plumber {
                        topology,
                        source: self.source,
                    })
                    .await?;
            }
            TrackerMessage::OfflineReporter { server } => {
                self.state.lock().map_err(poisoned)?.remove_server(&server);
                tracing::debug!("demoted offline server {}", server);
            }
            TrackerMessage::Deregister { server, filter } => {
                self.state
                    .lock()
                    .map_err(poisoned)?
                    .remove_registration(&server, &filter);
                tracing::debug!("deregistered {} for {}", server, filter);
            }
            TrackerMessage::TopologyRequest => {
                let topology = self.state.lock().map_err(poisoned)?.clone();
                framed.send(TrackerMessage::TopologyResponse(topology)).await?;
            }
            other => {
                tracing::warn!("client sent a response message: {:?}", other);
                return Err(TrackerError::UnexpectedResponse);
            }
        }
        Ok(())
    }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> TrackerError {
    TrackerError::Io(std::io::Error::other(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_query() {
        let source: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let cancel = CancellationToken::new();
        let tracker = Tracker::bind("127.0.0.1".parse().unwrap(), 0, source, cancel.clone())
            .await
            .unwrap();
        tracker.spawn();

        let server: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let stream = TcpStream::connect(tracker.local_addr()).await.unwrap();
        let mut framed = Framed::new(stream, TrackerCodec);
        framed
            .send(TrackerMessage::Inquisitor {
                server,
                filter: Filter::Everything,
            })
            .await
            .unwrap();
        match framed.next().await.unwrap().unwrap() {
            TrackerMessage::Plumber { topology, source: got } => {
                assert_eq!(got, source);
                // The source plus the new registrant.
                assert_eq!(topology.server_count(), 2);
            }
            other => panic!("unexpected response: {:?}", other),
        }

        // A fresh connection sees the registration.
        let stream = TcpStream::connect(tracker.local_addr()).await.unwrap();
        let mut framed = Framed::new(stream, TrackerCodec);
        framed.send(TrackerMessage::TopologyRequest).await.unwrap();
        match framed.next().await.unwrap().unwrap() {
            TrackerMessage::TopologyResponse(topology) => {
                let exclude: std::collections::HashSet<SocketAddr> = [source].into();
                let (best, _) = topology
                    .best_server(&Filter::Everything, &exclude)
                    .unwrap();
                assert_eq!(best, server);
            }
            other => panic!("unexpected response: {:?}", other),
        }

        // Voluntary withdrawal removes just that registration.
        let stream = TcpStream::connect(tracker.local_addr()).await.unwrap();
        let mut framed = Framed::new(stream, TrackerCodec);
        framed
            .send(TrackerMessage::Deregister {
                server,
                filter: Filter::Everything,
            })
            .await
            .unwrap();
        drop(framed);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let stream = TcpStream::connect(tracker.local_addr()).await.unwrap();
        let mut framed = Framed::new(stream, TrackerCodec);
        framed.send(TrackerMessage::TopologyRequest).await.unwrap();
        match framed.next().await.unwrap().unwrap() {
            TrackerMessage::TopologyResponse(topology) => {
                assert_eq!(topology.server_count(), 1);
            }
            other => panic!("unexpected response: {:?}", other),
        }

        // Register again, then have a third party report it offline.
        let stream = TcpStream::connect(tracker.local_addr()).await.unwrap();
        let mut framed = Framed::new(stream, TrackerCodec);
        framed
            .send(TrackerMessage::Inquisitor {
                server,
                filter: Filter::Everything,
            })
            .await
            .unwrap();
        framed.next().await.unwrap().unwrap();

        let stream = TcpStream::connect(tracker.local_addr()).await.unwrap();
        let mut framed = Framed::new(stream, TrackerCodec);
        framed
            .send(TrackerMessage::OfflineReporter { server })
            .await
            .unwrap();
        drop(framed);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let stream = TcpStream::connect(tracker.local_addr()).await.unwrap();
        let mut framed = Framed::new(stream, TrackerCodec);
        framed.send(TrackerMessage::TopologyRequest).await.unwrap();
        match framed.next().await.unwrap().unwrap() {
            TrackerMessage::TopologyResponse(topology) => {
                assert_eq!(topology.server_count(), 1);
            }
            other => panic!("unexpected response: {:?}", other),
        }
        cancel.cancel();
    }
}
