use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use crate::archive::{Archive, DistributedTrackerFiles};
use super::{Result, Topology, TrackerCodec, TrackerError, TrackerMessage};

/// Node-side cache of one tracker. Every successful exchange refreshes
/// the in-memory topology and the persisted artifact; when the tracker
/// is unreachable the artifact keeps discovery alive.
pub struct TrackerProxy {
    tracker: SocketAddr,
    files: DistributedTrackerFiles,
    cache: Mutex<Option<Topology>>,
    connect_timeout: Duration,
}

impl TrackerProxy {
    pub fn new(
        tracker: SocketAddr,
        archive: Arc<Archive>,
        connect_timeout: Duration,
    ) -> Arc<TrackerProxy> {
        Arc::new(TrackerProxy {
            tracker,
            files: DistributedTrackerFiles::new(archive, tracker),
            cache: Mutex::new(None),
            connect_timeout,
        })
    }

    pub fn tracker_addr(&self) -> SocketAddr {
        self.tracker
    }

    /// Scopes the proxy to one filter and one local server identity.
    pub fn filtered(self: &Arc<Self>, filter: crate::data::Filter, server: SocketAddr) -> FilteredProxy {
        FilteredProxy {
            proxy: self.clone(),
            filter,
            server,
        }
    }

    async fn exchange(&self, msg: TrackerMessage) -> Result<Option<TrackerMessage>> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.tracker))
            .await
            .map_err(|_| TrackerError::Timeout)??;
        let mut framed = Framed::new(stream, TrackerCodec);
        framed.send(msg).await?;
        framed.next().await.transpose()
    }

    fn remember(&self, topology: &Topology) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some(topology.clone());
        }
        if let Err(e) = self.files.store(topology) {
            tracing::warn!("cannot persist topology: {}", e);
        }
    }

    fn cached(&self) -> Option<Topology> {
        self.cache.lock().ok().and_then(|cache| cache.clone())
    }

    fn forget_server(&self, server: &SocketAddr) {
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(topology) = cache.as_mut() {
                topology.remove_server(server);
            }
        }
    }
}

/// A tracker proxy scoped to one filter, as the client manager uses it.
pub struct FilteredProxy {
    proxy: Arc<TrackerProxy>,
    pub filter: crate::data::Filter,
    server: SocketAddr,
}

impl FilteredProxy {
    /// Registers this node's server under the filter. Returns the
    /// topology snapshot and the source server's address.
    pub async fn register(&self) -> Result<(Topology, SocketAddr)> {
        let response = self
            .proxy
            .exchange(TrackerMessage::Inquisitor {
                server: self.server,
                filter: self.filter.clone(),
            })
            .await?;
        match response {
            Some(TrackerMessage::Plumber { topology, source }) => {
                self.proxy.remember(&topology);
                Ok((topology, source))
            }
            _ => Err(TrackerError::UnexpectedResponse),
        }
    }

    /// The freshest topology available: the cache, a live tracker
    /// query, or, with the tracker unreachable, the artifact persisted
    /// by DistributedTrackerFiles.
    pub async fn topology(&self) -> Result<Topology> {
        if let Some(topology) = self.proxy.cached() {
            return Ok(topology);
        }
        match self.proxy.exchange(TrackerMessage::TopologyRequest).await {
            Ok(Some(TrackerMessage::TopologyResponse(topology))) => {
                self.proxy.remember(&topology);
                Ok(topology)
            }
            Ok(_) => Err(TrackerError::UnexpectedResponse),
            Err(e) if e.is_unreachable() => {
                tracing::debug!("tracker unreachable ({}), trying persisted topology", e);
                match self.proxy.files.load() {
                    Ok(Some(topology)) => Ok(topology),
                    _ => Err(TrackerError::Unavailable),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Withdraws this node's registration and drops it from the local
    /// cache. Best effort: at shutdown the tracker may already be gone.
    pub async fn deregister(&self) {
        self.proxy.forget_server(&self.server);
        match self
            .proxy
            .exchange(TrackerMessage::Deregister {
                server: self.server,
                filter: self.filter.clone(),
            })
            .await
        {
            Ok(_) => tracing::debug!("deregistered {} for {}", self.server, self.filter),
            Err(e) => tracing::debug!("cannot deregister {}: {}", self.server, e),
        }
    }

    /// Best-effort offline report; also drops the server from the
    /// local cache so it is not recommended again this period.
    pub async fn report_offline(&self, server: SocketAddr) {
        self.proxy.forget_server(&server);
        match self
            .proxy
            .exchange(TrackerMessage::OfflineReporter { server })
            .await
        {
            Ok(_) => tracing::debug!("reported {} offline", server),
            Err(e) => tracing::debug!("cannot report {} offline: {}", server, e),
        }
    }
}
