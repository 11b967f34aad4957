use std::collections::HashSet;

use ipnet::Ipv4Net;
use wireguard_control::Key;

/// Dirty bits accumulated by [`crate::store::Store`] update calls since the
/// last successful `Apply`.
///
/// Every field here can be set by an update and unset again by a later update
/// that cancels it out, so a sequence like `add X; remove X` leaves the
/// tracker exactly as it found it (testable property 2). `local_addr_dirty`,
/// `peers_dirty` and `routes_dirty` are consulted by [`crate::apply`]'s
/// phases to skip a dataplane list+diff on a non-resync cycle where nothing
/// in that domain changed; there is no `rule_dirty` bit because the IP
/// rule's only input is the immutable [`crate::config::LocalConfig`], so a
/// rule reprogram is never needed outside an explicit resync (see
/// `apply::phase_rule`).
#[derive(Debug, Clone, Default)]
pub struct DeltaTracker {
    pub local_key_dirty: bool,
    pub local_addr_dirty: bool,
    pub peers_dirty: HashSet<Key>,
    pub routes_dirty: HashSet<Ipv4Net>,
    pub link_dirty: bool,
    pub resync_pending: bool,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether anything at all changed since the last successful Apply.
    pub fn is_clean(&self) -> bool {
        !self.local_key_dirty
            && !self.local_addr_dirty
            && self.peers_dirty.is_empty()
            && self.routes_dirty.is_empty()
            && !self.link_dirty
            && !self.resync_pending
    }

    /// Records that a node's peer-relevant state changed. `old` and `new` are
    /// the node's public key before and after the update; either may be
    /// `None`. Both the vanished key (if any) and the newly-affected key (if
    /// any) are marked dirty, per spec.md §4.3.
    pub fn mark_peer_changed(&mut self, old: Option<&Key>, new: Option<&Key>) {
        if old == new {
            return;
        }
        if let Some(k) = old {
            self.peers_dirty.insert(k.clone());
        }
        if let Some(k) = new {
            self.peers_dirty.insert(k.clone());
        }
    }

    pub fn mark_route_dirty(&mut self, cidr: Ipv4Net) {
        self.routes_dirty.insert(cidr);
    }

    pub fn mark_local_key_dirty(&mut self) {
        self.local_key_dirty = true;
    }

    pub fn mark_local_addr_dirty(&mut self) {
        self.local_addr_dirty = true;
    }

    pub fn mark_link_dirty(&mut self) {
        self.link_dirty = true;
    }

    pub fn queue_resync(&mut self) {
        self.resync_pending = true;
    }

    /// Clears every bit. Called by the Apply Engine's Phase I after a fully
    /// successful reconciliation cycle.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
