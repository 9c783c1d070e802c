use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use crate::{
    clearing::ClearingHouse,
    data::Filter,
    net::Client,
    peer::{PeerCounter, Result},
    tracker::{FilteredProxy, Topology},
};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Per-filter controller keeping at least `min_clients` live outbound
/// sessions to servers that carry the filter, replacing the worst
/// performer each period.
///
/// The creator half registers with the tracker, trims and spawns
/// clients; the reaper half drains finished sessions, reporting dead
/// servers offline and surfacing "all data received" upward. Both run
/// in one select loop.
pub struct ClientManager {
    pub filter: Filter,
    pub clearing: Arc<ClearingHouse>,
    pub proxy: FilteredProxy,
    pub local_server: SocketAddr,
    pub min_clients: usize,
    pub replacement_period: Duration,
    pub connect_timeout: Duration,
    pub cancel: CancellationToken,
}

struct ClientSlot {
    counter: Arc<PeerCounter>,
    cancel: CancellationToken,
}

impl ClientManager {
    /// Runs until all desired data is received (`Ok(true)`), the
    /// manager is cancelled (`Ok(false)`), or a non-network error
    /// escapes a client.
    #[tracing::instrument(name = "manager", skip(self), fields(filter = %self.filter))]
    pub async fn run(self) -> Result<bool> {
        let mut clients: HashMap<SocketAddr, ClientSlot> = HashMap::new();
        let mut tasks: JoinSet<(SocketAddr, Result<bool>)> = JoinSet::new();
        let mut invalid: HashSet<SocketAddr> = HashSet::new();
        let mut source: Option<SocketAddr> = None;
        let mut topology: Option<Topology> = None;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            // Register with the tracker; on failure fall back to the
            // cached or persisted topology and back off.
            let tracker_reachable = match self.proxy.register().await {
                Ok((snapshot, src)) => {
                    topology = Some(snapshot);
                    source = Some(src);
                    backoff = INITIAL_BACKOFF;
                    true
                }
                Err(e) if e.is_unreachable() => {
                    tracing::debug!("tracker unreachable: {}", e);
                    if let Ok(snapshot) = self.proxy.topology().await {
                        topology = Some(snapshot);
                    }
                    false
                }
                Err(e) => {
                    tracing::warn!("tracker exchange failed: {}", e);
                    false
                }
            };

            // Replacement: rank by bytes delivered this period and cut
            // the worst until we are under the minimum.
            while clients.len() >= self.min_clients {
                let worst = clients
                    .iter()
                    .min_by_key(|(addr, slot)| (slot.counter.bytes(), **addr))
                    .map(|(addr, _)| *addr);
                match worst {
                    Some(addr) => {
                        if let Some(slot) = clients.remove(&addr) {
                            tracing::debug!("replacing under-performer {}", addr);
                            slot.counter.stop();
                            slot.cancel.cancel();
                        }
                    }
                    None => break,
                }
            }

            // Fill back up to the minimum from the topology.
            if let Some(topology) = &topology {
                while clients.len() < self.min_clients {
                    let mut exclude: HashSet<SocketAddr> = clients.keys().copied().collect();
                    exclude.extend(invalid.iter().copied());
                    exclude.extend(self.clearing.in_use_servers(&self.filter));
                    exclude.insert(self.local_server);

                    let (addr, offered) = match topology.best_server(&self.filter, &exclude) {
                        Some(best) => best,
                        None => break,
                    };
                    // The source serves but never requests.
                    let remote_filter = if Some(addr) == source {
                        Filter::Nothing
                    } else {
                        offered
                    };
                    tracing::debug!("opening client to {}", addr);
                    let slot = ClientSlot {
                        counter: Arc::new(PeerCounter::new()),
                        cancel: self.cancel.child_token(),
                    };
                    let client = Client {
                        remote_server: addr,
                        local_server: self.local_server,
                        local_filter: self.filter.clone(),
                        remote_filter,
                        clearing: self.clearing.clone(),
                        counter: slot.counter.clone(),
                        cancel: slot.cancel.clone(),
                        connect_timeout: self.connect_timeout,
                    };
                    tasks.spawn(async move { (addr, client.run().await) });
                    clients.insert(addr, slot);
                }
            }

            // Wait out the period, or wake early when a client ends.
            let wait = if tracker_reachable {
                self.replacement_period
            } else {
                backoff = (backoff * 2).min(self.replacement_period);
                backoff
            };
            let deadline = tokio::time::sleep(wait);
            tokio::pin!(deadline);
            let mut period_elapsed = false;

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        self.shutdown(clients, tasks).await;
                        return Ok(false);
                    }

                    _ = &mut deadline => {
                        period_elapsed = true;
                        break;
                    }

                    joined = tasks.join_next(), if !tasks.is_empty() => {
                        let (addr, outcome) = match joined {
                            Some(Ok(ended)) => ended,
                            Some(Err(join)) => {
                                tracing::error!("client task panicked: {}", join);
                                continue;
                            }
                            None => continue,
                        };
                        clients.remove(&addr);
                        match outcome {
                            Ok(true) => {
                                tracing::info!("all desired data received via {}", addr);
                                self.shutdown(clients, tasks).await;
                                return Ok(true);
                            }
                            // Duplicate session or cooperative stop.
                            Ok(false) => {}
                            Err(e) if e.is_network() => {
                                tracing::debug!("client to {} failed: {}", addr, e);
                                invalid.insert(addr);
                                self.proxy.report_offline(addr).await;
                            }
                            Err(e) => {
                                self.shutdown(clients, tasks).await;
                                return Err(e);
                            }
                        }
                        // Wake the creator to replace the session.
                        break;
                    }
                }
            }

            if period_elapsed {
                // Next ranking covers only the coming period.
                for slot in clients.values() {
                    slot.counter.restart();
                }
            }
        }
    }

    async fn shutdown(&self, clients: HashMap<SocketAddr, ClientSlot>, mut tasks: JoinSet<(SocketAddr, Result<bool>)>) {
        for slot in clients.values() {
            slot.cancel.cancel();
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    tracing::warn!("client task failed during shutdown: {}", e);
                }
            }
        }
        self.proxy.deregister().await;
        tracing::debug!("manager for {} stopped", self.filter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    // The replacement policy in isolation: worst counter goes first.
    #[test]
    fn test_worst_ranked_slot_is_selected() {
        let mut clients: HashMap<SocketAddr, ClientSlot> = HashMap::new();
        for (port, bytes) in [(1000u16, 500u64), (1001, 100), (1002, 900)] {
            let counter = Arc::new(PeerCounter::new());
            counter.add(bytes);
            clients.insert(
                SocketAddr::from_str(&format!("127.0.0.1:{}", port)).unwrap(),
                ClientSlot {
                    counter,
                    cancel: CancellationToken::new(),
                },
            );
        }
        let worst = clients
            .iter()
            .min_by_key(|(addr, slot)| (slot.counter.bytes(), **addr))
            .map(|(addr, _)| *addr)
            .unwrap();
        assert_eq!(worst.port(), 1001);
    }

    #[test]
    fn test_counter_restart_covers_one_period() {
        let counter = PeerCounter::new();
        counter.add(100);
        assert_eq!(counter.bytes(), 100);
        counter.restart();
        assert_eq!(counter.bytes(), 0);
        counter.add(10);
        assert_eq!(counter.bytes(), 10);
        counter.stop();
        counter.add(10);
        assert_eq!(counter.bytes(), 10);
    }
}
