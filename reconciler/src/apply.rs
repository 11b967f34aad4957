//! The Apply Engine (C5): the staged reconciliation pipeline described in
//! spec.md §4.4, phases A-I. Every phase short-circuits on the first hard
//! error, leaving the store and dirty bits untouched so the next `apply()`
//! retries with a freshly (re)opened client (spec.md §7).

use std::collections::{HashMap, HashSet};

use ipnet::Ipv4Net;
use wireguard_control::{Key, KeyPair};

use crate::{
    conflict::{fallback_cidrs, resolve_effective_peers},
    dataplane::{
        DataplaneClient, DeviceConfig, DeviceState, DpResult, IpRule, LinkInfo, LinkState,
        PeerUpdate, RouteDesire, RouteKind, RouteReconciler, StatusCallback, WireguardClient,
    },
    error::{DataplaneError, ReconcileError},
    Reconciler,
};

enum PhaseLink {
    Unsupported,
    Ready(LinkInfo),
}

impl<N, W, R, S> Reconciler<N, W, R, S>
where
    N: DataplaneClient,
    W: WireguardClient,
    R: RouteReconciler,
    S: StatusCallback,
{
    /// Drives one full reconciliation cycle (`Apply()`, spec.md §4.1).
    pub fn apply(&mut self) -> Result<(), ReconcileError> {
        let resync = self.delta.resync_pending;
        if resync {
            self.netlink.invalidate_unsupported();
            self.wg.invalidate_unsupported();
        }

        if !self.config.enabled {
            return self.apply_disabled();
        }

        if self.netlink.is_unsupported() {
            self.publish_zero_key()?;
            self.delta.clear();
            return Ok(());
        }

        match self.phase_link()? {
            PhaseLink::Unsupported => {
                self.publish_zero_key()?;
                self.delta.clear();
                Ok(())
            },
            PhaseLink::Ready(link) => {
                if !self.link_up {
                    return Ok(());
                }
                self.reconcile_converged(link, resync)
            },
        }
    }

    /// Phase A: disabled shortcut. Tears down everything this reconciler
    /// owns and returns; never enters UNSUPPORTED mode.
    fn apply_disabled(&mut self) -> Result<(), ReconcileError> {
        let iface = self.iface_name();

        if let Some(exists) = self.with_netlink_opt(|c| c.link_by_name(&iface))? {
            if exists.is_some() {
                self.with_netlink(|c| c.link_del(&iface))?;
            }
        }

        if let Some(rules) = self.with_netlink_opt(|c| c.rule_list(self.config.table))? {
            for rule in rules {
                if rule.table == self.config.table {
                    self.with_netlink(|c| c.rule_del(rule))?;
                }
            }
        }

        self.routes.set_routes(self.config.table, Vec::new());
        self.routes
            .apply()
            .map_err(ReconcileError::RouteTable)?;

        self.delta.clear();
        Ok(())
    }

    /// Phase B: link presence. Creates the link if absent, brings it up if
    /// down, and reports whether the kernel categorically refused the
    /// wireguard link type.
    fn phase_link(&mut self) -> Result<PhaseLink, ReconcileError> {
        let iface = self.iface_name();
        let mtu = self.config.mtu;

        let Some(existing) = self.with_netlink_opt(|c| c.link_by_name(&iface))? else {
            return Ok(PhaseLink::Unsupported);
        };

        let link = match existing {
            Some(info) => info,
            None => match self.with_netlink(|c| c.link_add_wireguard(&iface, mtu)) {
                Ok(()) => match self.with_netlink(|c| c.link_by_name(&iface))? {
                    Some(info) => info,
                    None => {
                        return Err(DataplaneError::retriable(
                            "link vanished immediately after creation",
                        )
                        .into())
                    },
                },
                Err(ReconcileError::Dataplane(e)) if e.is_not_supported() => {
                    self.netlink.mark_unsupported();
                    return Ok(PhaseLink::Unsupported);
                },
                Err(e) => return Err(e),
            },
        };

        if link.state == LinkState::Down {
            self.with_netlink(|c| c.link_set_up(&iface))?;
        }

        Ok(PhaseLink::Ready(link))
    }

    /// Phases C-I, run once the link is known to be up.
    fn reconcile_converged(&mut self, link: LinkInfo, resync: bool) -> Result<(), ReconcileError> {
        // Phase C: open the wireguard client.
        if self.wg.ensure_open()?.is_none() {
            self.publish_zero_key()?;
            self.delta.clear();
            return Ok(());
        }

        let device = self.phase_local_keying(&link, resync)?;
        self.phase_iface_addr(&link, resync)?;
        self.phase_rule(resync)?;
        self.phase_peers(&device, resync)?;
        self.phase_routes(link.index, resync)?;

        self.delta.clear();
        Ok(())
    }

    /// Phase D: ensure the device has a keypair, correct the advertised
    /// port/mark/MTU on resync, and publish the public key on change.
    fn phase_local_keying(
        &mut self,
        link: &LinkInfo,
        resync: bool,
    ) -> Result<DeviceState, ReconcileError> {
        let iface = self.iface_name();
        let mut device = self.with_wg(|c| c.device_by_name(&iface))?;

        let mut cfg = DeviceConfig::default();
        let mut dirty = false;

        if device.private_key.is_none() || device.public_key.is_none() {
            let keypair = KeyPair::generate();
            cfg.private_key = Some(keypair.private.clone());
            cfg.listen_port = Some(self.config.listen_port);
            cfg.firewall_mark = Some(self.config.firewall_mark);
            device.private_key = Some(keypair.private);
            device.public_key = Some(keypair.public);
            device.listen_port = self.config.listen_port;
            device.firewall_mark = self.config.firewall_mark;
            dirty = true;
        } else if resync {
            if device.listen_port != self.config.listen_port {
                cfg.listen_port = Some(self.config.listen_port);
                device.listen_port = self.config.listen_port;
                dirty = true;
            }
            if device.firewall_mark != self.config.firewall_mark {
                cfg.firewall_mark = Some(self.config.firewall_mark);
                device.firewall_mark = self.config.firewall_mark;
                dirty = true;
            }
        }

        if resync && link.mtu != self.config.mtu {
            self.with_netlink(|c| c.link_set_mtu(&iface, self.config.mtu))?;
        }

        if dirty {
            self.with_wg(|c| c.configure_device(&iface, cfg.clone()))?;
        }

        if let Some(pubkey) = device.public_key.clone() {
            self.publish_key(pubkey)?;
        }

        Ok(device)
    }

    /// Phase E: reconcile the link's IPv4 addresses against `{iface_addr}`.
    /// Skipped on a non-resync cycle when nothing local-address-related
    /// changed (C3's `local_addr_dirty`, spec.md §4.3/§4.7).
    fn phase_iface_addr(&mut self, link: &LinkInfo, resync: bool) -> Result<(), ReconcileError> {
        if !resync && !self.delta.local_addr_dirty {
            return Ok(());
        }

        let desired: HashSet<_> = self
            .store
            .local_node()
            .and_then(|n| n.iface_addr)
            .into_iter()
            .collect();
        let current: HashSet<_> = self
            .with_netlink(|c| c.addr_list(link.index))?
            .into_iter()
            .collect();

        for addr in desired.difference(&current) {
            self.with_netlink(|c| c.addr_add(link.index, *addr))?;
        }
        for addr in current.difference(&desired) {
            self.with_netlink(|c| c.addr_del(link.index, *addr))?;
        }
        Ok(())
    }

    /// Phase F: enumerate rules referencing our table, delete anything that
    /// isn't bit-identical to the canonical rule, add it if it's missing.
    /// The canonical rule is derived entirely from the immutable
    /// [`crate::config::LocalConfig`], so nothing short of a resync can make
    /// it stale; this phase is a no-op on every other Apply cycle.
    fn phase_rule(&mut self, resync: bool) -> Result<(), ReconcileError> {
        if !resync {
            return Ok(());
        }

        let canonical = IpRule {
            priority: self.config.rule_priority,
            table: self.config.table,
            mark: self.config.firewall_mark,
            invert: true,
        };

        let existing = self.with_netlink(|c| c.rule_list(self.config.table))?;
        let mut have_canonical = false;
        for rule in existing {
            if rule == canonical {
                have_canonical = true;
            } else {
                self.with_netlink(|c| c.rule_del(rule))?;
            }
        }
        if !have_canonical {
            self.with_netlink(|c| c.rule_add(canonical))?;
        }
        Ok(())
    }

    /// Phase G: diff the effective peer set against the device's live
    /// peers and submit the minimum batched configuration change. Skipped
    /// on a non-resync cycle when no tracked key gained, lost, or changed
    /// peer-relevant state (C3's `peers_dirty`, spec.md §4.3/§4.7).
    fn phase_peers(&mut self, device: &DeviceState, resync: bool) -> Result<(), ReconcileError> {
        if !resync && self.delta.peers_dirty.is_empty() {
            return Ok(());
        }

        let effective = resolve_effective_peers(&self.store, self.config.listen_port);
        let live: HashMap<&Key, _> = device.peers.iter().map(|p| (&p.public_key, p)).collect();
        let desired: HashMap<&Key, _> = effective.iter().map(|p| (&p.public_key, p)).collect();

        let mut updates = Vec::new();
        for (key, live_peer) in &live {
            if !desired.contains_key(*key) {
                updates.push(PeerUpdate {
                    public_key: (*key).clone(),
                    endpoint: live_peer.endpoint,
                    allowed_ips: vec![],
                    replace_allowed_ips: false,
                    remove: true,
                });
            }
        }
        for (key, peer) in &desired {
            let allowed: Vec<Ipv4Net> = peer.allowed_ips.iter().copied().collect();
            let needs_update = match live.get(*key) {
                None => true,
                Some(live_peer) => {
                    live_peer.endpoint != Some(peer.endpoint)
                        || !same_allowed_ips(&live_peer.allowed_ips, &allowed)
                },
            };
            if needs_update {
                updates.push(PeerUpdate {
                    public_key: (*key).clone(),
                    endpoint: Some(peer.endpoint),
                    allowed_ips: allowed,
                    replace_allowed_ips: true,
                    remove: false,
                });
            }
        }

        if !updates.is_empty() {
            let iface = self.iface_name();
            let cfg = DeviceConfig {
                peers: updates,
                ..Default::default()
            };
            self.with_wg(|c| c.configure_device(&iface, cfg))?;
        }
        Ok(())
    }

    /// Phase H: compute every CIDR's route desire and hand the full set to
    /// the route-table reconciler for this table. Skipped on a non-resync
    /// cycle only when neither routes nor peers moved (C3's `routes_dirty`
    /// and `peers_dirty`): a route's *kind* -- unicast vs. `throw` -- turns
    /// on peer capability, not just CIDR ownership, so a key conflict that
    /// flips a peer's capability without touching any CIDR (S3) still has
    /// to reach this phase.
    fn phase_routes(&mut self, link_index: u32, resync: bool) -> Result<(), ReconcileError> {
        if !resync && self.delta.routes_dirty.is_empty() && self.delta.peers_dirty.is_empty() {
            return Ok(());
        }

        let effective = resolve_effective_peers(&self.store, self.config.listen_port);

        let mut desires = Vec::new();
        for peer in &effective {
            for cidr in &peer.allowed_ips {
                desires.push(RouteDesire {
                    key: RouteDesire::make_key(self.config.table, Some(link_index), *cidr),
                    dst: *cidr,
                    link_index: Some(link_index),
                    kind: RouteKind::Unicast,
                    table: self.config.table,
                    proto: self.config.route_protocol,
                });
            }
        }
        for cidr in fallback_cidrs(&self.store, &effective) {
            desires.push(RouteDesire {
                key: RouteDesire::make_key(self.config.table, None, cidr),
                dst: cidr,
                link_index: None,
                kind: RouteKind::Throw,
                table: self.config.table,
                proto: self.config.route_protocol,
            });
        }

        self.routes.set_routes(self.config.table, desires);
        self.routes.apply().map_err(ReconcileError::RouteTable)
    }

    fn publish_zero_key(&mut self) -> Result<(), ReconcileError> {
        self.publish_key(Key::zero())
    }

    fn publish_key(&mut self, key: Key) -> Result<(), ReconcileError> {
        self.status
            .publish(key, &mut self.status_cb)
            .map_err(ReconcileError::Status)
    }

    fn iface_name(&self) -> String {
        self.config.interface.as_str_lossy().into_owned()
    }

    /// Runs `f` against the open netlink client, marking it dead and
    /// propagating the error if the call fails (C6).
    fn with_netlink<T>(
        &mut self,
        f: impl FnOnce(&mut N) -> DpResult<T>,
    ) -> Result<T, ReconcileError> {
        match self.with_netlink_opt(f)? {
            Some(v) => Ok(v),
            None => Err(DataplaneError::retriable("netlink client unexpectedly unavailable").into()),
        }
    }

    /// Like [`Self::with_netlink`], but returns `Ok(None)` instead of an
    /// error when the client is sticky-unsupported.
    fn with_netlink_opt<T>(
        &mut self,
        f: impl FnOnce(&mut N) -> DpResult<T>,
    ) -> Result<Option<T>, ReconcileError> {
        let Some(client) = self.netlink.ensure_open()? else {
            return Ok(None);
        };
        match f(client) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                self.netlink.mark_dead();
                Err(e.into())
            },
        }
    }

    /// Runs `f` against the open wireguard client, marking it dead and
    /// propagating the error if the call fails (C6).
    fn with_wg<T>(&mut self, f: impl FnOnce(&mut W) -> DpResult<T>) -> Result<T, ReconcileError> {
        let Some(client) = self.wg.ensure_open()? else {
            return Err(DataplaneError::retriable("wireguard client unexpectedly unavailable").into());
        };
        match f(client) {
            Ok(v) => Ok(v),
            Err(e) => {
                self.wg.mark_dead();
                Err(e.into())
            },
        }
    }
}

fn same_allowed_ips(live: &[Ipv4Net], desired: &[Ipv4Net]) -> bool {
    let live: HashSet<_> = live.iter().collect();
    let desired: HashSet<_> = desired.iter().collect();
    live == desired
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ipnet::Ipv4Net;
    use wireguard_control::Key;

    use super::*;
    use crate::{
        dataplane::PeerState,
        fake::{FakeDataplane, FakeRouteTable, FakeStatusCallback, FakeWireguard, NullInstaller},
        route_table::FakeClock,
        LocalConfig, Reconciler,
    };

    fn key(byte: u8) -> Key {
        Key([byte; 32])
    }

    fn cfg(iface: &str) -> LocalConfig {
        LocalConfig {
            hostname: "local".into(),
            interface: iface.parse().unwrap(),
            listen_port: 1000,
            firewall_mark: 10,
            table: 99,
            rule_priority: 98,
            mtu: 2000,
            // Zero grace: these tests assert on the route set immediately
            // after an Apply rather than exercising the grace-window delay
            // itself, which [`crate::route_table`] tests independently.
            route_cleanup_delay: Duration::ZERO,
            route_protocol: 80,
            enabled: true,
        }
    }

    type TestReconciler =
        Reconciler<FakeDataplane, FakeWireguard, FakeRouteTable<FakeClock>, FakeStatusCallback>;

    fn new_reconciler(cfg: LocalConfig) -> (TestReconciler, FakeStatusCallback) {
        let dataplane = FakeDataplane::shared();
        let wireguard = FakeWireguard::shared();
        let routes: FakeRouteTable<FakeClock> =
            FakeRouteTable::new(FakeClock::new(), NullInstaller, cfg.route_cleanup_delay);
        let status = FakeStatusCallback::new();
        let r = Reconciler::new(
            cfg,
            dataplane.opener(),
            wireguard.opener(),
            routes,
            status.clone(),
        );
        (r, status)
    }

    /// S1 - Bring-up from empty.
    #[test]
    fn s1_bring_up_from_empty() {
        let (mut r, status) = new_reconciler(cfg("wg-mesh0"));

        r.apply().unwrap();
        assert!(r.netlink.rebuild_count() >= 1);

        r.on_iface_state_changed("wg-mesh0", LinkState::Up);
        r.apply().unwrap();

        assert_eq!(status.published().len(), 1);
        assert_ne!(status.published()[0], Key::zero());
    }

    /// S2 - Two peers, two CIDRs.
    #[test]
    fn s2_two_peers_two_cidrs() {
        let (mut r, _status) = new_reconciler(cfg("wg-mesh0"));
        r.apply().unwrap();
        r.on_iface_state_changed("wg-mesh0", LinkState::Up);
        r.apply().unwrap();

        r.endpoint_wireguard_update("peer1", key(1), None);
        r.endpoint_update("peer1", "1.2.3.5".parse().unwrap());
        r.allowed_cidr_add("peer1", "192.168.1.0/24".parse().unwrap());
        r.endpoint_wireguard_update("peer2", key(2), None);
        r.endpoint_update("peer2", "1.2.3.6".parse().unwrap());
        r.allowed_cidr_add("peer2", "192.168.2.0/24".parse().unwrap());

        r.apply().unwrap();

        let device = r.wg.ensure_open().unwrap().unwrap().device();
        assert_eq!(device.peers.len(), 2);
        assert!(device.peers.iter().any(|p| p.public_key == key(1)
            && p.endpoint == Some("1.2.3.5:1000".parse().unwrap())));
        assert!(device.peers.iter().any(|p| p.public_key == key(2)
            && p.endpoint == Some("1.2.3.6:1000".parse().unwrap())));
    }

    /// S3 - Key conflict removes both peers and falls back to throw routes.
    #[test]
    fn s3_key_conflict_falls_back() {
        let (mut r, _status) = new_reconciler(cfg("wg-mesh0"));
        r.apply().unwrap();
        r.on_iface_state_changed("wg-mesh0", LinkState::Up);
        r.apply().unwrap();

        r.endpoint_wireguard_update("peer1", key(1), None);
        r.endpoint_update("peer1", "1.2.3.5".parse().unwrap());
        r.allowed_cidr_add("peer1", "192.168.1.0/24".parse().unwrap());
        r.endpoint_wireguard_update("peer2", key(2), None);
        r.endpoint_update("peer2", "1.2.3.6".parse().unwrap());
        r.allowed_cidr_add("peer2", "192.168.2.0/24".parse().unwrap());
        r.apply().unwrap();

        r.endpoint_wireguard_update("peer2", key(1), None);
        r.apply().unwrap();

        let device = r.wg.ensure_open().unwrap().unwrap().device();
        assert!(device.peers.is_empty());
        let routes = r.routes.live_kinds();
        assert_eq!(routes.len(), 2);
        assert!(routes.values().all(|k| *k == RouteKind::Throw));

        r.endpoint_wireguard_update("peer2", key(2), None);
        r.apply().unwrap();
        let device = r.wg.ensure_open().unwrap().unwrap().device();
        assert_eq!(device.peers.len(), 2);
    }

    /// S4 - Interface hijacked out-of-band; a QueueResync'd Apply restores
    /// the configured port/mark/MTU and the desired peer set.
    #[test]
    fn s4_resync_restores_hijacked_device() {
        let (mut r, _status) = new_reconciler(cfg("wg-mesh0"));
        r.apply().unwrap();
        r.on_iface_state_changed("wg-mesh0", LinkState::Up);
        r.apply().unwrap();

        r.endpoint_wireguard_update("peer1", key(1), None);
        r.endpoint_update("peer1", "1.2.3.5".parse().unwrap());
        r.allowed_cidr_add("peer1", "192.168.1.0/24".parse().unwrap());
        r.endpoint_wireguard_update("peer2", key(2), None);
        r.endpoint_update("peer2", "1.2.3.6".parse().unwrap());
        r.allowed_cidr_add("peer2", "192.168.2.0/24".parse().unwrap());
        r.apply().unwrap();

        {
            let wg = r.wg.ensure_open().unwrap().unwrap();
            wg.hijack(|device| {
                device.listen_port = 1001;
                device.firewall_mark = 11;
                device.peers.clear();
                device.peers.push(PeerState {
                    public_key: key(99),
                    endpoint: Some("9.9.9.9:9999".parse().unwrap()),
                    allowed_ips: vec![],
                });
            });
            let netlink = r.netlink.ensure_open().unwrap().unwrap();
            netlink.link_set_mtu("wg-mesh0", 2001).unwrap();
        }

        r.queue_resync();
        r.apply().unwrap();

        let device = r.wg.ensure_open().unwrap().unwrap().device();
        assert_eq!(device.listen_port, 1000);
        assert_eq!(device.firewall_mark, 10);
        assert_eq!(device.peers.len(), 2);
        assert!(!device.peers.iter().any(|p| p.public_key == key(99)));
        let netlink = r.netlink.ensure_open().unwrap().unwrap();
        assert_eq!(netlink.link_by_name("wg-mesh0").unwrap().unwrap().mtu, 2000);
    }

    /// S5 - Transient failure at link-add recovers on the next Apply.
    #[test]
    fn s5_transient_failure_recovers() {
        let (mut r, _status) = new_reconciler(cfg("wg-mesh0"));
        r.netlink.ensure_open().unwrap();
        let dataplane = r.netlink.ensure_open().unwrap().unwrap();
        dataplane.fail_next_link_add();

        assert!(r.apply().is_err());
        assert!(r.apply().is_ok());
        assert_eq!(r.netlink.rebuild_count(), 2);
    }

    /// S6 - Disable tear-down deletes the link and only our rule.
    #[test]
    fn s6_disable_tears_down() {
        let (mut r, _status) = new_reconciler(cfg("wg-mesh0"));
        r.apply().unwrap();
        r.on_iface_state_changed("wg-mesh0", LinkState::Up);
        r.apply().unwrap();

        {
            let client = r.netlink.ensure_open().unwrap().unwrap();
            client.add_foreign_rule(IpRule {
                priority: 5,
                table: 7,
                mark: 0,
                invert: false,
            });
        }

        r.config.enabled = false;
        r.apply().unwrap();

        let client = r.netlink.ensure_open().unwrap().unwrap();
        assert!(client.link_by_name("wg-mesh0").unwrap().is_none());
        let rules = client.rule_list(99).unwrap();
        assert!(rules.is_empty());
        assert_eq!(client.all_rules().len(), 1);

        let before = client.mutation_count();
        r.apply().unwrap();
        let client = r.netlink.ensure_open().unwrap().unwrap();
        assert_eq!(client.mutation_count(), before);
    }

    /// Testable property 1: a converged Apply with no new updates performs
    /// zero dataplane mutations.
    #[test]
    fn property_second_apply_is_mutation_free() {
        let (mut r, _status) = new_reconciler(cfg("wg-mesh0"));
        r.apply().unwrap();
        r.on_iface_state_changed("wg-mesh0", LinkState::Up);
        r.apply().unwrap();

        let netlink_before = {
            let c = r.netlink.ensure_open().unwrap().unwrap();
            c.mutation_count()
        };
        let wg_before = {
            let c = r.wg.ensure_open().unwrap().unwrap();
            c.mutation_count()
        };

        r.apply().unwrap();

        let netlink_after = r.netlink.ensure_open().unwrap().unwrap().mutation_count();
        let wg_after = r.wg.ensure_open().unwrap().unwrap().mutation_count();
        assert_eq!(netlink_before, netlink_after);
        assert_eq!(wg_before, wg_after);
    }

    /// Testable property 2: a net-empty sequence of updates causes zero
    /// dataplane mutations on the next Apply.
    #[test]
    fn property_net_empty_updates_are_mutation_free() {
        let (mut r, _status) = new_reconciler(cfg("wg-mesh0"));
        r.apply().unwrap();
        r.on_iface_state_changed("wg-mesh0", LinkState::Up);
        r.apply().unwrap();

        let cidr: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        r.allowed_cidr_add("peer1", cidr);
        r.allowed_cidr_remove(cidr);

        let before = r.netlink.ensure_open().unwrap().unwrap().mutation_count();
        r.apply().unwrap();
        let after = r.netlink.ensure_open().unwrap().unwrap().mutation_count();
        assert_eq!(before, after);
    }
}
