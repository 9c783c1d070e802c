use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    net::SocketAddr,
};
use bytes::{Buf, BufMut, BytesMut};
use crate::{data::Filter, wire};

/// Snapshot of the tracker's registry: which servers offer which
/// filters, and how loaded each server is. Serializable, so any node
/// can persist it and hand it to late joiners after a tracker restart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    filters: BTreeMap<Filter, BTreeSet<SocketAddr>>,
    load: BTreeMap<SocketAddr, u32>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn insert(&mut self, server: SocketAddr, filter: Filter) {
        if filter.is_nothing() {
            return;
        }
        self.filters.entry(filter).or_default().insert(server);
        *self.load.entry(server).or_insert(0) += 1;
    }

    pub fn remove_server(&mut self, server: &SocketAddr) {
        for servers in self.filters.values_mut() {
            servers.remove(server);
        }
        self.filters.retain(|_, servers| !servers.is_empty());
        self.load.remove(server);
    }

    /// Withdraws one registration. The server's load entry goes with
    /// its last remaining registration.
    pub fn remove_registration(&mut self, server: &SocketAddr, filter: &Filter) {
        if let Some(servers) = self.filters.get_mut(filter) {
            servers.remove(server);
            if servers.is_empty() {
                self.filters.remove(filter);
            }
        }
        if !self.filters.values().any(|servers| servers.contains(server)) {
            self.load.remove(server);
        }
    }

    pub fn server_count(&self) -> usize {
        self.load.len()
    }

    /// Picks the best server for a caller wanting `filter`: among
    /// servers offering a filter that includes it, the one with the
    /// fewest outstanding connections, ties broken by address order.
    /// Returns the offered filter alongside the address.
    pub fn best_server(
        &self,
        filter: &Filter,
        exclude: &HashSet<SocketAddr>,
    ) -> Option<(SocketAddr, Filter)> {
        let mut best: Option<(u32, SocketAddr, Filter)> = None;
        for (offered, servers) in &self.filters {
            if !offered.includes(filter) {
                continue;
            }
            for server in servers {
                if exclude.contains(server) {
                    continue;
                }
                let load = self.load.get(server).copied().unwrap_or(0);
                let better = match &best {
                    None => true,
                    Some((best_load, best_addr, _)) => (load, *server) < (*best_load, *best_addr),
                };
                if better {
                    best = Some((load, *server, offered.clone()));
                }
            }
        }
        best.map(|(_, server, offered)| (server, offered))
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32(self.filters.len() as u32);
        for (filter, servers) in &self.filters {
            wire::put_filter(dst, filter);
            dst.put_u32(servers.len() as u32);
            for server in servers {
                wire::put_addr(dst, server);
            }
        }
        dst.put_u32(self.load.len() as u32);
        for (server, load) in &self.load {
            wire::put_addr(dst, server);
            dst.put_u32(*load);
        }
    }

    pub fn decode(src: &mut impl Buf) -> wire::Result<Topology> {
        let mut topology = Topology::new();
        let filter_count = wire::get_u32(src)?;
        for _ in 0..filter_count {
            let filter = wire::get_filter(src)?;
            let server_count = wire::get_u32(src)?;
            for _ in 0..server_count {
                let server = wire::get_addr(src)?;
                topology.filters.entry(filter.clone()).or_default().insert(server);
            }
        }
        let load_count = wire::get_u32(src)?;
        for _ in 0..load_count {
            let server = wire::get_addr(src)?;
            let load = wire::get_u32(src)?;
            topology.load.insert(server, load);
        }
        Ok(topology)
    }

    /// The persisted artifact form: one length-prefixed frame holding
    /// the wire encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        let mark = wire::start_frame(&mut buf);
        self.encode(&mut buf);
        wire::finish_frame(&mut buf, mark);
        buf.to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> wire::Result<Topology> {
        let mut buf = BytesMut::from(bytes);
        let mut payload = wire::take_frame(&mut buf)?.ok_or(wire::WireError::Truncated)?;
        Self::decode(&mut payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_best_server_prefers_low_load() {
        let mut topology = Topology::new();
        topology.insert(addr(1000), Filter::Everything);
        topology.insert(addr(2000), Filter::Everything);
        topology.insert(addr(2000), Filter::Everything);

        let (best, offered) = topology
            .best_server(&Filter::parse("data").unwrap(), &HashSet::new())
            .unwrap();
        assert_eq!(best, addr(1000));
        assert_eq!(offered, Filter::Everything);
    }

    #[test]
    fn test_best_server_ties_break_by_address() {
        let mut topology = Topology::new();
        topology.insert(addr(2000), Filter::Everything);
        topology.insert(addr(1000), Filter::Everything);

        let (best, _) = topology
            .best_server(&Filter::Everything, &HashSet::new())
            .unwrap();
        assert_eq!(best, addr(1000));
    }

    #[test]
    fn test_best_server_requires_including_filter() {
        let mut topology = Topology::new();
        topology.insert(addr(1000), Filter::parse("data/sub").unwrap());
        topology.insert(addr(2000), Filter::parse("data").unwrap());

        // Wanting all of data, only the wider offering qualifies.
        let (best, offered) = topology
            .best_server(&Filter::parse("data").unwrap(), &HashSet::new())
            .unwrap();
        assert_eq!(best, addr(2000));
        assert_eq!(offered, Filter::parse("data").unwrap());

        // Wanting the narrow subtree, the lower-loaded narrow offer
        // competes and wins on address order.
        let (best, _) = topology
            .best_server(&Filter::parse("data/sub").unwrap(), &HashSet::new())
            .unwrap();
        assert_eq!(best, addr(1000));
    }

    #[test]
    fn test_best_server_honors_exclusions() {
        let mut topology = Topology::new();
        topology.insert(addr(1000), Filter::Everything);
        topology.insert(addr(2000), Filter::Everything);

        let exclude: HashSet<SocketAddr> = [addr(1000)].into();
        let (best, _) = topology.best_server(&Filter::Everything, &exclude).unwrap();
        assert_eq!(best, addr(2000));

        let exclude: HashSet<SocketAddr> = [addr(1000), addr(2000)].into();
        assert!(topology.best_server(&Filter::Everything, &exclude).is_none());
    }

    #[test]
    fn test_remove_server_prunes_empty_filters() {
        let mut topology = Topology::new();
        topology.insert(addr(1000), Filter::Everything);
        topology.remove_server(&addr(1000));
        assert!(topology.is_empty());
        assert_eq!(topology.server_count(), 0);
    }

    #[test]
    fn test_remove_registration_leaves_other_filters() {
        let mut topology = Topology::new();
        topology.insert(addr(1000), Filter::Everything);
        topology.insert(addr(1000), Filter::parse("data").unwrap());

        topology.remove_registration(&addr(1000), &Filter::Everything);
        assert_eq!(topology.server_count(), 1);
        let (best, offered) = topology
            .best_server(&Filter::parse("data").unwrap(), &HashSet::new())
            .unwrap();
        assert_eq!(best, addr(1000));
        assert_eq!(offered, Filter::parse("data").unwrap());

        // The last registration takes the load entry with it.
        topology.remove_registration(&addr(1000), &Filter::parse("data").unwrap());
        assert!(topology.is_empty());
        assert_eq!(topology.server_count(), 0);
    }

    #[test]
    fn test_artifact_round_trip() {
        let mut topology = Topology::new();
        topology.insert(addr(1000), Filter::Everything);
        topology.insert(addr(2000), Filter::parse("data").unwrap());
        topology.insert(addr(2000), Filter::parse("logs/*/today").unwrap());

        let bytes = topology.to_bytes();
        let decoded = Topology::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, topology);
    }
}
