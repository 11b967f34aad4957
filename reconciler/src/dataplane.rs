//! The abstract contracts the Apply Engine (C5) drives, per spec.md §6.
//!
//! The core never talks to netlink or a wireguard-config socket directly; it
//! only calls through these traits. [`crate::linux`] provides a real Linux
//! implementation and [`crate::fake`] an in-memory test double, but neither
//! is part of the core's own contract -- the core is generic over any `impl`
//! of these traits.

use std::net::{Ipv4Addr, SocketAddrV4};

use ipnet::Ipv4Net;
use wireguard_control::Key;

use crate::error::DataplaneError;

pub type DpResult<T> = Result<T, DataplaneError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Down,
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    pub index: u32,
    pub state: LinkState,
    pub mtu: u32,
}

/// `Core -> Dataplane client`: link, address and IP-rule operations
/// (spec.md §6). Implemented by a real netlink-backed client in production
/// and by an in-memory fake in tests.
pub trait DataplaneClient {
    fn link_add_wireguard(&mut self, name: &str, mtu: u32) -> DpResult<()>;
    fn link_del(&mut self, name: &str) -> DpResult<()>;
    fn link_set_up(&mut self, name: &str) -> DpResult<()>;
    fn link_set_mtu(&mut self, name: &str, mtu: u32) -> DpResult<()>;
    fn link_by_name(&mut self, name: &str) -> DpResult<Option<LinkInfo>>;

    fn addr_list(&mut self, link_index: u32) -> DpResult<Vec<Ipv4Addr>>;
    fn addr_add(&mut self, link_index: u32, addr: Ipv4Addr) -> DpResult<()>;
    fn addr_del(&mut self, link_index: u32, addr: Ipv4Addr) -> DpResult<()>;

    fn rule_list(&mut self, table: u32) -> DpResult<Vec<IpRule>>;
    fn rule_add(&mut self, rule: IpRule) -> DpResult<()>;
    fn rule_del(&mut self, rule: IpRule) -> DpResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpRule {
    pub priority: u32,
    pub table: u32,
    pub mark: u32,
    pub invert: bool,
}

/// One entry of a `configure-device` peer list (spec.md §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUpdate {
    pub public_key: Key,
    pub endpoint: Option<SocketAddrV4>,
    pub allowed_ips: Vec<Ipv4Net>,
    pub replace_allowed_ips: bool,
    pub remove: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceConfig {
    pub private_key: Option<Key>,
    pub listen_port: Option<u16>,
    pub firewall_mark: Option<u32>,
    pub peers: Vec<PeerUpdate>,
}

#[derive(Debug, Clone)]
pub struct DeviceState {
    pub public_key: Option<Key>,
    pub private_key: Option<Key>,
    pub listen_port: u16,
    pub firewall_mark: u32,
    pub peers: Vec<PeerState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerState {
    pub public_key: Key,
    pub endpoint: Option<SocketAddrV4>,
    pub allowed_ips: Vec<Ipv4Net>,
}

/// `Core -> Dataplane client` (wireguard half): device read/configure.
pub trait WireguardClient {
    fn device_by_name(&mut self, name: &str) -> DpResult<DeviceState>;
    fn configure_device(&mut self, name: &str, config: DeviceConfig) -> DpResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Unicast,
    Throw,
}

/// One entry submitted to the route-table reconciler (spec.md §3, §6).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteDesire {
    pub key: String,
    pub dst: Ipv4Net,
    pub link_index: Option<u32>,
    pub kind: RouteKind,
    pub table: u32,
    pub proto: u8,
}

impl RouteDesire {
    /// `"<table>-<linkIndex>-<cidr>"`, or `"<table>-0-<cidr>"` for throw
    /// routes that have no link, per spec.md §4.4 Phase H.
    pub fn make_key(table: u32, link_index: Option<u32>, dst: Ipv4Net) -> String {
        format!("{table}-{}-{dst}", link_index.unwrap_or(0))
    }
}

/// `Core -> Route reconciler` (spec.md §6). The core drives this contract
/// but does not own the implementation's internals.
pub trait RouteReconciler {
    fn set_routes(&mut self, table: u32, routes: Vec<RouteDesire>);
    fn queue_resync(&mut self);
    fn apply(&mut self) -> Result<(), String>;
}

/// `Core -> Status callback` (spec.md §6).
pub trait StatusCallback {
    fn status(&mut self, public_key: Key) -> Result<(), String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_key_format_unicast() {
        let k = RouteDesire::make_key(99, Some(4), "192.168.1.0/24".parse().unwrap());
        assert_eq!(k, "99-4-192.168.1.0/24");
    }

    #[test]
    fn route_key_format_throw_has_zero_link() {
        let k = RouteDesire::make_key(99, None, "192.168.2.0/24".parse().unwrap());
        assert_eq!(k, "99-0-192.168.2.0/24");
    }
}
