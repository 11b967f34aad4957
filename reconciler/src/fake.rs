//! In-memory test doubles for the dataplane contracts (spec.md §6), used by
//! [`crate::apply`]'s scenario tests. Each fake is a cheap `Rc<RefCell<_>>`
//! handle so a test can keep one clone for assertions while another clone is
//! handed to the [`crate::client::ClientManager`] as the "open" client --
//! both see the same underlying state.

use std::{cell::RefCell, collections::HashMap, net::Ipv4Addr, rc::Rc};

use wireguard_control::Key;

use crate::{
    dataplane::{
        DataplaneClient, DeviceConfig, DeviceState, DpResult, IpRule, LinkInfo, LinkState,
        PeerState, RouteDesire, WireguardClient,
    },
    error::DataplaneError,
    route_table::{GraceWindowRouteTable, RouteInstaller},
};

pub type FakeRouteTable<C> = GraceWindowRouteTable<C, NullInstaller>;

/// A [`RouteInstaller`] that always succeeds and records nothing; the route
/// state worth asserting on lives in [`GraceWindowRouteTable::live_kinds`].
#[derive(Debug, Default)]
pub struct NullInstaller;

impl RouteInstaller for NullInstaller {
    fn add_route(&mut self, _route: &RouteDesire) -> Result<(), String> {
        Ok(())
    }

    fn del_route(&mut self, _route: &RouteDesire) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Default)]
struct DpState {
    links: HashMap<String, LinkInfo>,
    next_index: u32,
    addrs: HashMap<u32, Vec<Ipv4Addr>>,
    rules: Vec<IpRule>,
    mutation_count: u64,
    fail_next_link_add: bool,
}

/// Shared handle implementing [`DataplaneClient`] over in-memory state.
#[derive(Clone)]
pub struct FakeDataplane(Rc<RefCell<DpState>>);

impl FakeDataplane {
    pub fn shared() -> Self {
        Self(Rc::new(RefCell::new(DpState::default())))
    }

    /// A factory suitable for [`crate::Reconciler::new`]; every call returns
    /// a handle onto the same shared state.
    pub fn opener(&self) -> impl FnMut() -> Result<FakeDataplane, DataplaneError> + 'static {
        let handle = self.clone();
        move || Ok(handle.clone())
    }

    /// Makes the next `link_add_wireguard` call fail retriably, simulating a
    /// transient kernel error (S5).
    pub fn fail_next_link_add(&self) {
        self.0.borrow_mut().fail_next_link_add = true;
    }

    /// Injects a rule belonging to a table this reconciler doesn't own, to
    /// assert teardown leaves other reconcilers' rules alone (S6).
    pub fn add_foreign_rule(&self, rule: IpRule) {
        self.0.borrow_mut().rules.push(rule);
    }

    pub fn all_rules(&self) -> Vec<IpRule> {
        self.0.borrow().rules.clone()
    }

    pub fn mutation_count(&self) -> u64 {
        self.0.borrow().mutation_count
    }
}

impl DataplaneClient for FakeDataplane {
    fn link_add_wireguard(&mut self, name: &str, mtu: u32) -> DpResult<()> {
        let mut state = self.0.borrow_mut();
        if state.fail_next_link_add {
            state.fail_next_link_add = false;
            return Err(DataplaneError::retriable("simulated transient link-add failure"));
        }
        let index = state.next_index + 1;
        state.next_index = index;
        state.links.insert(
            name.to_string(),
            LinkInfo {
                index,
                state: LinkState::Down,
                mtu,
            },
        );
        state.mutation_count += 1;
        Ok(())
    }

    fn link_del(&mut self, name: &str) -> DpResult<()> {
        let mut state = self.0.borrow_mut();
        if let Some(link) = state.links.remove(name) {
            state.addrs.remove(&link.index);
        }
        state.mutation_count += 1;
        Ok(())
    }

    fn link_set_up(&mut self, name: &str) -> DpResult<()> {
        let mut state = self.0.borrow_mut();
        if let Some(link) = state.links.get_mut(name) {
            link.state = LinkState::Up;
        }
        state.mutation_count += 1;
        Ok(())
    }

    fn link_set_mtu(&mut self, name: &str, mtu: u32) -> DpResult<()> {
        let mut state = self.0.borrow_mut();
        if let Some(link) = state.links.get_mut(name) {
            link.mtu = mtu;
        }
        state.mutation_count += 1;
        Ok(())
    }

    fn link_by_name(&mut self, name: &str) -> DpResult<Option<LinkInfo>> {
        Ok(self.0.borrow().links.get(name).copied())
    }

    fn addr_list(&mut self, link_index: u32) -> DpResult<Vec<Ipv4Addr>> {
        Ok(self
            .0
            .borrow()
            .addrs
            .get(&link_index)
            .cloned()
            .unwrap_or_default())
    }

    fn addr_add(&mut self, link_index: u32, addr: Ipv4Addr) -> DpResult<()> {
        let mut state = self.0.borrow_mut();
        let list = state.addrs.entry(link_index).or_default();
        if !list.contains(&addr) {
            list.push(addr);
        }
        state.mutation_count += 1;
        Ok(())
    }

    fn addr_del(&mut self, link_index: u32, addr: Ipv4Addr) -> DpResult<()> {
        let mut state = self.0.borrow_mut();
        if let Some(list) = state.addrs.get_mut(&link_index) {
            list.retain(|a| *a != addr);
        }
        state.mutation_count += 1;
        Ok(())
    }

    fn rule_list(&mut self, table: u32) -> DpResult<Vec<IpRule>> {
        Ok(self
            .0
            .borrow()
            .rules
            .iter()
            .filter(|r| r.table == table)
            .copied()
            .collect())
    }

    fn rule_add(&mut self, rule: IpRule) -> DpResult<()> {
        let mut state = self.0.borrow_mut();
        state.rules.push(rule);
        state.mutation_count += 1;
        Ok(())
    }

    fn rule_del(&mut self, rule: IpRule) -> DpResult<()> {
        let mut state = self.0.borrow_mut();
        state.rules.retain(|r| *r != rule);
        state.mutation_count += 1;
        Ok(())
    }
}

#[derive(Default)]
struct WgState {
    device: Option<DeviceState>,
    mutation_count: u64,
}

/// Shared handle implementing [`WireguardClient`] over in-memory state.
#[derive(Clone)]
pub struct FakeWireguard(Rc<RefCell<WgState>>);

impl FakeWireguard {
    pub fn shared() -> Self {
        Self(Rc::new(RefCell::new(WgState::default())))
    }

    pub fn opener(&self) -> impl FnMut() -> Result<FakeWireguard, DataplaneError> + 'static {
        let handle = self.clone();
        move || Ok(handle.clone())
    }

    /// A snapshot of the device's current state, for test assertions.
    pub fn device(&self) -> DeviceState {
        self.0.borrow().device.clone().unwrap_or_else(empty_device)
    }

    pub fn mutation_count(&self) -> u64 {
        self.0.borrow().mutation_count
    }

    /// Mutates the device directly, bypassing `configure_device`, to
    /// simulate out-of-band tampering between Applies (S4).
    pub fn hijack(&self, f: impl FnOnce(&mut DeviceState)) {
        let mut state = self.0.borrow_mut();
        let device = state.device.get_or_insert_with(empty_device);
        f(device);
    }
}

fn empty_device() -> DeviceState {
    DeviceState {
        public_key: None,
        private_key: None,
        listen_port: 0,
        firewall_mark: 0,
        peers: Vec::new(),
    }
}

impl WireguardClient for FakeWireguard {
    fn device_by_name(&mut self, _name: &str) -> DpResult<DeviceState> {
        Ok(self.device())
    }

    fn configure_device(&mut self, _name: &str, config: DeviceConfig) -> DpResult<()> {
        let mut state = self.0.borrow_mut();
        let device = state.device.get_or_insert_with(empty_device);

        if let Some(private_key) = config.private_key {
            device.public_key = Some(private_key.get_public());
            device.private_key = Some(private_key);
        }
        if let Some(port) = config.listen_port {
            device.listen_port = port;
        }
        if let Some(mark) = config.firewall_mark {
            device.firewall_mark = mark;
        }

        for update in config.peers {
            if update.remove {
                device.peers.retain(|p| p.public_key != update.public_key);
                continue;
            }
            match device.peers.iter_mut().find(|p| p.public_key == update.public_key) {
                Some(existing) => {
                    if update.endpoint.is_some() {
                        existing.endpoint = update.endpoint;
                    }
                    if update.replace_allowed_ips {
                        existing.allowed_ips = update.allowed_ips;
                    }
                },
                None => device.peers.push(PeerState {
                    public_key: update.public_key,
                    endpoint: update.endpoint,
                    allowed_ips: update.allowed_ips,
                }),
            }
        }

        state.mutation_count += 1;
        Ok(())
    }
}

/// Records every published key, for test assertions (`status.published()`).
#[derive(Clone, Default)]
pub struct FakeStatusCallback(Rc<RefCell<Vec<Key>>>);

impl FakeStatusCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<Key> {
        self.0.borrow().clone()
    }
}

impl crate::dataplane::StatusCallback for FakeStatusCallback {
    fn status(&mut self, public_key: Key) -> Result<(), String> {
        self.0.borrow_mut().push(public_key);
        Ok(())
    }
}
