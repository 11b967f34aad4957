use std::{
    collections::{HashMap, HashSet},
    net::SocketAddrV4,
};

use ipnet::Ipv4Net;
use wireguard_control::Key;

use crate::store::Store;

/// A remote node that currently qualifies for WireGuard encapsulation: it has
/// a public key, an endpoint, and that key is not shared with any other node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectivePeer {
    pub hostname: String,
    pub public_key: Key,
    pub endpoint: SocketAddrV4,
    pub allowed_ips: HashSet<Ipv4Net>,
}

/// Derives the effective peer set from the store (C2), applying the
/// "remove all conflicting" public-key-uniqueness policy. `listen_port` is
/// the *remote* nodes' listening port, which in this system is uniform
/// (cfg.listen_port), per spec.md §3's `EffectivePeer.endpoint_udp_addr`.
pub fn resolve_effective_peers(store: &Store, listen_port: u16) -> Vec<EffectivePeer> {
    let mut by_key: HashMap<Key, Vec<&str>> = HashMap::new();
    for (hostname, rec) in store.remote_nodes() {
        if let Some(key) = &rec.public_key {
            by_key.entry(key.clone()).or_default().push(hostname);
        }
    }

    let conflicted: HashSet<&str> = by_key
        .values()
        .filter(|hosts| hosts.len() >= 2)
        .flatten()
        .copied()
        .collect();

    store
        .remote_nodes()
        .filter_map(|(hostname, rec)| {
            if conflicted.contains(hostname) {
                return None;
            }
            let public_key = rec.public_key.clone()?;
            let endpoint_ip = rec.endpoint_ip?;
            Some(EffectivePeer {
                hostname: hostname.to_string(),
                public_key,
                endpoint: SocketAddrV4::new(endpoint_ip, listen_port),
                allowed_ips: rec.cidrs.clone(),
            })
        })
        .collect()
}

/// Every CIDR owned by a node that is *known* (has at least an endpoint or
/// key on record) but did not make it into the effective peer set -- these
/// fall back to a `throw` route rather than disappearing, per spec.md §3.
pub fn fallback_cidrs(store: &Store, effective: &[EffectivePeer]) -> HashSet<Ipv4Net> {
    let effective_hosts: HashSet<&str> = effective.iter().map(|p| p.hostname.as_str()).collect();
    store
        .remote_nodes()
        .filter(|(hostname, _)| !effective_hosts.contains(hostname))
        .flat_map(|(_, rec)| rec.cidrs.iter().copied())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::DeltaTracker;

    fn key(byte: u8) -> Key {
        Key([byte; 32])
    }

    #[test]
    fn node_with_key_and_endpoint_is_effective() {
        let mut store = Store::new("local");
        let mut delta = DeltaTracker::new();
        store.endpoint_update("peer1", "1.2.3.5".parse().unwrap(), &mut delta);
        store.endpoint_wireguard_update("peer1", key(1), None, &mut delta);
        store.allowed_cidr_add("peer1", "192.168.1.0/24".parse().unwrap(), &mut delta);

        let effective = resolve_effective_peers(&store, 1000);
        assert_eq!(effective.len(), 1);
        assert_eq!(effective[0].hostname, "peer1");
        assert_eq!(effective[0].endpoint, "1.2.3.5:1000".parse().unwrap());
    }

    #[test]
    fn missing_endpoint_is_not_effective_but_is_fallback() {
        let mut store = Store::new("local");
        let mut delta = DeltaTracker::new();
        store.endpoint_wireguard_update("peer1", key(1), None, &mut delta);
        store.allowed_cidr_add("peer1", "192.168.1.0/24".parse().unwrap(), &mut delta);

        let effective = resolve_effective_peers(&store, 1000);
        assert!(effective.is_empty());
        let fallback = fallback_cidrs(&store, &effective);
        assert!(fallback.contains(&"192.168.1.0/24".parse::<Ipv4Net>().unwrap()));
    }

    #[test]
    fn conflicting_keys_remove_all_involved_peers() {
        let mut store = Store::new("local");
        let mut delta = DeltaTracker::new();
        store.endpoint_update("peer1", "1.2.3.5".parse().unwrap(), &mut delta);
        store.endpoint_wireguard_update("peer1", key(1), None, &mut delta);
        store.allowed_cidr_add("peer1", "192.168.1.0/24".parse().unwrap(), &mut delta);

        store.endpoint_update("peer2", "1.2.3.6".parse().unwrap(), &mut delta);
        store.endpoint_wireguard_update("peer2", key(1), None, &mut delta);
        store.allowed_cidr_add("peer2", "192.168.2.0/24".parse().unwrap(), &mut delta);

        let effective = resolve_effective_peers(&store, 1000);
        assert!(effective.is_empty());

        let fallback = fallback_cidrs(&store, &effective);
        assert!(fallback.contains(&"192.168.1.0/24".parse::<Ipv4Net>().unwrap()));
        assert!(fallback.contains(&"192.168.2.0/24".parse::<Ipv4Net>().unwrap()));
    }

    #[test]
    fn resolving_conflict_restores_both_peers() {
        let mut store = Store::new("local");
        let mut delta = DeltaTracker::new();
        store.endpoint_update("peer1", "1.2.3.5".parse().unwrap(), &mut delta);
        store.endpoint_wireguard_update("peer1", key(1), None, &mut delta);
        store.endpoint_update("peer2", "1.2.3.6".parse().unwrap(), &mut delta);
        store.endpoint_wireguard_update("peer2", key(1), None, &mut delta);
        assert!(resolve_effective_peers(&store, 1000).is_empty());

        store.endpoint_wireguard_update("peer2", key(2), None, &mut delta);
        let effective = resolve_effective_peers(&store, 1000);
        assert_eq!(effective.len(), 2);
    }

    #[test]
    fn local_node_never_becomes_a_peer() {
        let mut store = Store::new("local");
        let mut delta = DeltaTracker::new();
        store.endpoint_wireguard_update("local", key(1), Some("10.0.0.1".parse().unwrap()), &mut delta);
        store.endpoint_update("local", "1.2.3.4".parse().unwrap(), &mut delta);
        assert!(resolve_effective_peers(&store, 1000).is_empty());
    }
}
