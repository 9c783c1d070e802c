use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use crate::{
    archive::{Archive, ArchiveError, ArchiveEvent, ArchiveWatcher},
    clearing::ClearingHouse,
    config::NodeConfig,
    data::{ArchiveTime, FileId, FilePieceSpecSet, Filter, Predicate},
    manager::ClientManager,
    net::Server,
    peer::PeerError,
    tracker::{Tracker, TrackerError, TrackerProxy},
};

const TTL_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub type Result<T> = std::result::Result<T, NodeError>;

#[derive(thiserror::Error, Debug)]
pub enum NodeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("peer failure: {0}")]
    Peer(#[from] PeerError),

    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("invalid subscription spec: {0}")]
    Subscription(String),
}

/// What a subscriber mirrors: a tracker to discover peers through and
/// a filter over archive paths.
///
/// Textual form: `host:port/pattern`, e.g. `127.0.0.1:3999/data/sub`;
/// omitting the pattern subscribes to everything.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub tracker: SocketAddr,
    pub filter: Filter,
}

impl Subscription {
    pub fn parse(s: &str) -> Result<Subscription> {
        let (addr, pattern) = match s.split_once('/') {
            Some((addr, pattern)) => (addr, Some(pattern)),
            None => (s, None),
        };
        let tracker: SocketAddr = addr
            .parse()
            .map_err(|_| NodeError::Subscription(s.to_string()))?;
        let filter = match pattern {
            None | Some("") => Filter::Everything,
            Some(pattern) => {
                Filter::parse(pattern).map_err(|_| NodeError::Subscription(s.to_string()))?
            }
        };
        Ok(Subscription { tracker, filter })
    }
}

/// A publisher node: serves its archive to all comers, hosts the
/// tracker, and turns files dropped into its root into notices.
/// Requests nothing from anyone.
pub struct SourceNode {
    archive: Arc<Archive>,
    clearing: Arc<ClearingHouse>,
    server: Arc<Server>,
    tracker: Arc<Tracker>,
    cancel: CancellationToken,
}

impl SourceNode {
    pub async fn start(config: NodeConfig) -> Result<SourceNode> {
        let archive = Arc::new(Archive::open(
            &config.root,
            config.piece_size,
            config.ttl_secs,
            config.open_file_limit,
        )?);
        let clearing = ClearingHouse::new(archive.clone(), Predicate::nothing());
        let cancel = CancellationToken::new();

        let server = Server::bind(
            config.host,
            config.base_port,
            config.handshake_guard,
            clearing.clone(),
            cancel.child_token(),
        )
        .await?;
        server.spawn();

        let tracker = Tracker::bind(
            config.host,
            config.tracker_port,
            server.local_addr(),
            cancel.child_token(),
        )
        .await?;
        tracker.spawn();

        let watcher = ArchiveWatcher::new(archive.root())?;
        tokio::spawn(watch_loop(
            watcher,
            archive.clone(),
            clearing.clone(),
            cancel.child_token(),
        ));
        tokio::spawn(ttl_sweep(clearing.clone(), cancel.child_token()));

        tracing::info!(
            "publisher up: archive {:?}, server {}, tracker {}",
            archive.root(),
            server.local_addr(),
            tracker.local_addr(),
        );
        Ok(SourceNode {
            archive,
            clearing,
            server,
            tracker,
            cancel,
        })
    }

    pub fn tracker_addr(&self) -> SocketAddr {
        self.tracker.local_addr()
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn clearing(&self) -> &Arc<ClearingHouse> {
        &self.clearing
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.clearing.cancel_all();
        self.archive.close();
    }
}

/// A subscriber node: mirrors a filtered view of published content,
/// serving what it has while fetching what it lacks.
pub struct SinkNode {
    archive: Arc<Archive>,
    clearing: Arc<ClearingHouse>,
    server: Arc<Server>,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

impl SinkNode {
    pub async fn start(config: NodeConfig, subscription: Subscription) -> Result<SinkNode> {
        let archive = Arc::new(Archive::open(
            &config.root,
            config.piece_size,
            config.ttl_secs,
            config.open_file_limit,
        )?);
        let predicate = Predicate::of(subscription.filter.clone());
        let clearing = ClearingHouse::new(archive.clone(), predicate.clone());
        let cancel = CancellationToken::new();

        let server = Server::bind(
            config.host,
            config.base_port,
            config.handshake_guard,
            clearing.clone(),
            cancel.child_token(),
        )
        .await?;
        server.spawn();

        let proxy = TrackerProxy::new(subscription.tracker, archive.clone(), config.connect_timeout);
        for filter in predicate.filters() {
            let manager = ClientManager {
                filter: filter.clone(),
                clearing: clearing.clone(),
                proxy: proxy.filtered(filter.clone(), server.local_addr()),
                local_server: server.local_addr(),
                min_clients: config.min_clients,
                replacement_period: config.replacement_period,
                connect_timeout: config.connect_timeout,
                cancel: cancel.child_token(),
            };
            tokio::spawn(async move {
                match manager.run().await {
                    Ok(done) => tracing::debug!("manager finished, done: {}", done),
                    Err(e) => tracing::error!("manager failure: {}", e),
                }
            });
        }
        tokio::spawn(ttl_sweep(clearing.clone(), cancel.child_token()));

        let done = clearing.done();
        tracing::info!(
            "subscriber up: archive {:?}, server {}, wants {}",
            archive.root(),
            server.local_addr(),
            subscription.filter,
        );
        Ok(SinkNode {
            archive,
            clearing,
            server,
            cancel,
            done,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn clearing(&self) -> &Arc<ClearingHouse> {
        &self.clearing
    }

    /// Server addresses of every node that has ever connected inbound.
    pub fn known_servers(&self) -> std::collections::HashSet<SocketAddr> {
        self.server.known_servers()
    }

    /// Resolves once a bounded subscription has been fully received.
    /// Unbounded subscriptions mirror until shutdown.
    pub async fn wait_done(&mut self) {
        while !*self.done.borrow() {
            if self.done.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.clearing.cancel_all();
        self.archive.close();
    }
}

// Turns filesystem drops into addition notices and deletions into
// removal notices.
async fn watch_loop(
    mut watcher: ArchiveWatcher,
    archive: Arc<Archive>,
    clearing: Arc<ClearingHouse>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = watcher.next() => event,
        };
        match event {
            Some(ArchiveEvent::Created(path)) => match archive.assimilate(&path) {
                Ok(info) => {
                    tracing::info!("publishing {}", info);
                    clearing.broadcast_addition(FilePieceSpecSet::whole(info));
                }
                Err(e) => tracing::warn!("cannot publish {}: {}", path, e),
            },
            Some(ArchiveEvent::Removed(path)) => {
                let id = FileId::new(path, ArchiveTime::now());
                if let Err(e) = clearing.remove_file(&id) {
                    tracing::warn!("cannot retire {}: {}", id.path, e);
                }
            }
            None => return,
        }
    }
}

// Retires files whose time-to-live has elapsed.
async fn ttl_sweep(clearing: Arc<ClearingHouse>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(TTL_SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                for id in clearing.archive().expired(ArchiveTime::now()) {
                    tracing::info!("expiring {}", id);
                    if let Err(e) = clearing.remove_file(&id) {
                        tracing::warn!("cannot expire {}: {}", id, e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_parsing() {
        let sub = Subscription::parse("127.0.0.1:3999/data/sub").unwrap();
        assert_eq!(sub.tracker, "127.0.0.1:3999".parse::<SocketAddr>().unwrap());
        assert_eq!(sub.filter, Filter::parse("data/sub").unwrap());

        let sub = Subscription::parse("127.0.0.1:3999").unwrap();
        assert_eq!(sub.filter, Filter::Everything);

        let sub = Subscription::parse("127.0.0.1:3999/EVERYTHING").unwrap();
        assert_eq!(sub.filter, Filter::Everything);

        assert!(Subscription::parse("nonsense").is_err());
        assert!(Subscription::parse("127.0.0.1:3999/a//b").is_err());
    }
}
