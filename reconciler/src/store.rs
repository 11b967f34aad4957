use std::{
    collections::{HashMap, HashSet},
    net::Ipv4Addr,
};

use ipnet::Ipv4Net;
use wireguard_control::Key;

use crate::delta::DeltaTracker;

/// Desired-state record for one node in the cluster, keyed by hostname in
/// [`Store`]. `None` fields mean "not yet known", not "explicitly empty".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeRecord {
    pub endpoint_ip: Option<Ipv4Addr>,
    pub public_key: Option<Key>,
    pub iface_addr: Option<Ipv4Addr>,
    pub cidrs: HashSet<Ipv4Net>,
}

impl NodeRecord {
    fn is_empty(&self) -> bool {
        self.endpoint_ip.is_none()
            && self.public_key.is_none()
            && self.iface_addr.is_none()
            && self.cidrs.is_empty()
    }
}

/// In-memory desired-state store (C1). All mutation happens through the
/// methods below; every one of them is side-effect-free on the dataplane and
/// only ever updates `self` plus the [`DeltaTracker`] passed in.
#[derive(Debug)]
pub struct Store {
    local_hostname: String,
    nodes: HashMap<String, NodeRecord>,
    cidr_owner: HashMap<Ipv4Net, String>,
}

impl Store {
    pub fn new(local_hostname: impl Into<String>) -> Self {
        Self {
            local_hostname: local_hostname.into(),
            nodes: HashMap::new(),
            cidr_owner: HashMap::new(),
        }
    }

    pub fn local_hostname(&self) -> &str {
        &self.local_hostname
    }

    pub fn node(&self, hostname: &str) -> Option<&NodeRecord> {
        self.nodes.get(hostname)
    }

    pub fn local_node(&self) -> Option<&NodeRecord> {
        self.node(&self.local_hostname)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&str, &NodeRecord)> {
        self.nodes.iter().map(|(h, r)| (h.as_str(), r))
    }

    /// Iterates every node that is not the local host.
    pub fn remote_nodes(&self) -> impl Iterator<Item = (&str, &NodeRecord)> {
        let local = self.local_hostname.as_str();
        self.nodes
            .iter()
            .filter(move |(h, _)| h.as_str() != local)
            .map(|(h, r)| (h.as_str(), r))
    }

    fn drop_if_empty(&mut self, hostname: &str) {
        if self.nodes.get(hostname).is_some_and(NodeRecord::is_empty) {
            self.nodes.remove(hostname);
        }
    }

    /// `EndpointUpdate(host, ipv4)` — set/replace endpoint IP.
    pub fn endpoint_update(&mut self, host: &str, ip: Ipv4Addr, delta: &mut DeltaTracker) {
        let rec = self.nodes.entry(host.to_string()).or_default();
        if rec.endpoint_ip == Some(ip) {
            return;
        }
        rec.endpoint_ip = Some(ip);
        if host == self.local_hostname {
            delta.mark_local_addr_dirty();
        } else if let Some(key) = rec.public_key.clone() {
            delta.mark_peer_changed(Some(&key), Some(&key));
        }
    }

    /// `EndpointRemove(host)` — drop endpoint IP; if record now empty, drop it.
    pub fn endpoint_remove(&mut self, host: &str, delta: &mut DeltaTracker) {
        let Some(rec) = self.nodes.get_mut(host) else {
            return;
        };
        if rec.endpoint_ip.take().is_none() {
            return;
        }
        if host == self.local_hostname {
            delta.mark_local_addr_dirty();
        } else if let Some(key) = rec.public_key.clone() {
            delta.mark_peer_changed(Some(&key), Some(&key));
        }
        self.drop_if_empty(host);
    }

    /// `EndpointWireguardUpdate(host, public_key, iface_addr_opt)` — set/replace
    /// key and (for local host) interface address. A zero-valued key disables
    /// peer participation for that node, matching an absent key.
    pub fn endpoint_wireguard_update(
        &mut self,
        host: &str,
        public_key: Key,
        iface_addr: Option<Ipv4Addr>,
        delta: &mut DeltaTracker,
    ) {
        let normalized = if public_key == Key::zero() {
            None
        } else {
            Some(public_key)
        };

        let rec = self.nodes.entry(host.to_string()).or_default();
        let old_key = rec.public_key.clone();
        let key_changed = old_key != normalized;
        if key_changed {
            rec.public_key = normalized.clone();
        }

        let mut addr_changed = false;
        if host == self.local_hostname && rec.iface_addr != iface_addr {
            rec.iface_addr = iface_addr;
            addr_changed = true;
        }

        if key_changed {
            if host == self.local_hostname {
                delta.mark_local_key_dirty();
            } else {
                delta.mark_peer_changed(old_key.as_ref(), normalized.as_ref());
            }
        }
        if addr_changed {
            delta.mark_local_addr_dirty();
        }
    }

    /// `EndpointWireguardRemove(host)` — drop key (and iface_addr for local host).
    pub fn endpoint_wireguard_remove(&mut self, host: &str, delta: &mut DeltaTracker) {
        let Some(rec) = self.nodes.get_mut(host) else {
            return;
        };
        let old_key = rec.public_key.take();
        let is_local = host == self.local_hostname;
        let addr_cleared = is_local && rec.iface_addr.take().is_some();

        if old_key.is_some() {
            if is_local {
                delta.mark_local_key_dirty();
            } else {
                delta.mark_peer_changed(old_key.as_ref(), None);
            }
        }
        if addr_cleared {
            delta.mark_local_addr_dirty();
        }
        self.drop_if_empty(host);
    }

    /// `EndpointAllowedCIDRAdd(host, cidr)` — assign CIDR to host, removing it
    /// from any prior owner.
    pub fn allowed_cidr_add(&mut self, host: &str, cidr: Ipv4Net, delta: &mut DeltaTracker) {
        if let Some(prev_owner) = self.cidr_owner.get(&cidr).cloned() {
            if prev_owner == host {
                return;
            }
            if let Some(prev) = self.nodes.get_mut(&prev_owner) {
                prev.cidrs.remove(&cidr);
                if prev_owner != self.local_hostname {
                    if let Some(key) = prev.public_key.clone() {
                        delta.mark_peer_changed(Some(&key), Some(&key));
                    }
                }
                self.drop_if_empty(&prev_owner);
            }
        }

        let rec = self.nodes.entry(host.to_string()).or_default();
        rec.cidrs.insert(cidr);
        self.cidr_owner.insert(cidr, host.to_string());
        delta.mark_route_dirty(cidr);
        if host != self.local_hostname {
            if let Some(key) = self.nodes[host].public_key.clone() {
                delta.mark_peer_changed(Some(&key), Some(&key));
            }
        }
    }

    /// `EndpointAllowedCIDRRemove(cidr)` — unassign; no-op if unknown.
    pub fn allowed_cidr_remove(&mut self, cidr: Ipv4Net, delta: &mut DeltaTracker) {
        let Some(owner) = self.cidr_owner.remove(&cidr) else {
            return;
        };
        if let Some(rec) = self.nodes.get_mut(&owner) {
            rec.cidrs.remove(&cidr);
            if owner != self.local_hostname {
                if let Some(key) = rec.public_key.clone() {
                    delta.mark_peer_changed(Some(&key), Some(&key));
                }
            }
            self.drop_if_empty(&owner);
        }
        delta.mark_route_dirty(cidr);
    }
}
