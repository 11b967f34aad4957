//! `wg_reconciler`: a convergent control-plane reconciler that programs a
//! Linux WireGuard device, its IP rule, routes and addresses from a desired
//! state store (see SPEC_FULL.md for the full system description).
//!
//! The crate is organized around the components named in SPEC_FULL.md §4:
//! - [`store`] / [`conflict`]: the desired-state Node/Peer Store and its
//!   public-key-conflict resolution (C1, C2).
//! - [`delta`]: dirty-bit change tracking between Apply cycles (C3).
//! - [`dataplane`]: the abstract contracts the Apply Engine drives (C6's
//!   clients, plus the route reconciler and status callback).
//! - [`client`]: the lazy open/rebuild lifecycle shared by both dataplane
//!   clients (C6).
//! - [`apply`]: the Apply Engine itself (C5), phases A-I.
//! - [`status`]: publish-on-change status reporting (C7).
//! - [`route_table`]: a grace-windowed [`dataplane::RouteReconciler`]
//!   implementation usable on its own or as a reference for another one.
//! - [`linux`] (Linux only): real netlink-backed [`dataplane::DataplaneClient`]
//!   and [`dataplane::WireguardClient`] implementations.
//! - [`config`]: [`LocalConfig`], the reconciler's immutable configuration.

pub mod apply;
pub mod client;
pub mod conflict;
pub mod config;
pub mod dataplane;
pub mod delta;
pub mod error;
pub mod route_table;
pub mod status;
pub mod store;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(test)]
mod fake;

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use wireguard_control::Key;

pub use config::LocalConfig;
pub use error::{DataplaneError, ReconcileError};

use client::ClientManager;
use dataplane::{DataplaneClient, LinkState, RouteReconciler, StatusCallback, WireguardClient};
use delta::DeltaTracker;
use status::StatusPublisher;
use store::Store;

type Opener<T> = Box<dyn FnMut() -> Result<T, DataplaneError>>;

/// Ties the Node/Peer Store (C1), Delta Tracker (C3), Apply Engine (C5),
/// Client Managers (C6) and Status Publisher (C7) together into one
/// reconciler instance, generic over the dataplane/route/status contracts it
/// drives (spec.md §6). A `Reconciler` owns exactly one WireGuard interface.
pub struct Reconciler<N, W, R, S>
where
    N: DataplaneClient,
    W: WireguardClient,
    R: RouteReconciler,
    S: StatusCallback,
{
    config: LocalConfig,
    store: Store,
    delta: DeltaTracker,
    netlink: ClientManager<N, Opener<N>>,
    wg: ClientManager<W, Opener<W>>,
    routes: R,
    status: StatusPublisher,
    status_cb: S,
    link_up: bool,
}

impl<N, W, R, S> Reconciler<N, W, R, S>
where
    N: DataplaneClient,
    W: WireguardClient,
    R: RouteReconciler,
    S: StatusCallback,
{
    pub fn new(
        config: LocalConfig,
        open_netlink: impl FnMut() -> Result<N, DataplaneError> + 'static,
        open_wireguard: impl FnMut() -> Result<W, DataplaneError> + 'static,
        routes: R,
        status_cb: S,
    ) -> Self {
        let hostname = config.hostname.clone();
        Self {
            config,
            store: Store::new(hostname),
            delta: DeltaTracker::new(),
            netlink: ClientManager::new(Box::new(open_netlink)),
            wg: ClientManager::new(Box::new(open_wireguard)),
            routes,
            status: StatusPublisher::new(),
            status_cb,
            link_up: false,
        }
    }

    pub fn config(&self) -> &LocalConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// `EndpointUpdate(host, ipv4)`.
    pub fn endpoint_update(&mut self, host: &str, ip: Ipv4Addr) {
        self.store.endpoint_update(host, ip, &mut self.delta);
    }

    /// `EndpointRemove(host)`.
    pub fn endpoint_remove(&mut self, host: &str) {
        self.store.endpoint_remove(host, &mut self.delta);
    }

    /// `EndpointWireguardUpdate(host, public_key, iface_addr_opt)`.
    pub fn endpoint_wireguard_update(
        &mut self,
        host: &str,
        public_key: Key,
        iface_addr: Option<Ipv4Addr>,
    ) {
        self.store
            .endpoint_wireguard_update(host, public_key, iface_addr, &mut self.delta);
    }

    /// `EndpointWireguardRemove(host)`.
    pub fn endpoint_wireguard_remove(&mut self, host: &str) {
        self.store.endpoint_wireguard_remove(host, &mut self.delta);
    }

    /// `EndpointAllowedCIDRAdd(host, cidr)`.
    pub fn allowed_cidr_add(&mut self, host: &str, cidr: Ipv4Net) {
        self.store.allowed_cidr_add(host, cidr, &mut self.delta);
    }

    /// `EndpointAllowedCIDRRemove(cidr)`.
    pub fn allowed_cidr_remove(&mut self, cidr: Ipv4Net) {
        self.store.allowed_cidr_remove(cidr, &mut self.delta);
    }

    /// Called by the embedder when it observes a link state change for the
    /// interface this reconciler owns, e.g. via an rtnetlink event
    /// subscription (spec.md §4.2's `OnIfaceStateChanged`). A reconciler that
    /// never calls this stays "link down" forever and Apply becomes a no-op
    /// once the link exists, which is safe but inert.
    pub fn on_iface_state_changed(&mut self, iface: &str, state: LinkState) {
        if iface == self.config.interface.as_str_lossy() {
            let became_up = matches!(state, LinkState::Up) && !self.link_up;
            self.link_up = matches!(state, LinkState::Up);
            self.delta.mark_link_dirty();
            if became_up {
                self.queue_resync();
            }
        }
    }

    /// `QueueResync()`: forces the next Apply to re-validate every piece of
    /// live state against the desired state, re-open any sticky-unsupported
    /// client, and re-diff every route, even if no store update fired in the
    /// meantime (spec.md §4.2, the Resync Scheduler's C8 contract).
    pub fn queue_resync(&mut self) {
        self.delta.queue_resync();
        self.routes.queue_resync();
    }
}
