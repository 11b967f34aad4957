use std::time::Duration;

use wireguard_control::InterfaceName;

/// Default grace window before a route missing from a resync is actually deleted.
pub const DEFAULT_ROUTE_CLEANUP_DELAY: Duration = Duration::from_secs(10);

/// Immutable configuration for a single reconciler instance.
///
/// Constructed once by the embedding program; none of its fields change for the
/// lifetime of the [`crate::Reconciler`] it configures.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// This node's own hostname, as it appears as a key in the node/peer store.
    pub hostname: String,
    /// Name of the WireGuard interface to create/manage (e.g. `wg-mesh0`).
    pub interface: InterfaceName,
    /// UDP port the local WireGuard device listens on.
    pub listen_port: u16,
    /// Firewall mark applied to the device's own outbound UDP, used to keep it
    /// out of our own routing table via the IP rule's `invert` flag.
    pub firewall_mark: u32,
    /// Index of the dedicated routing table this reconciler owns.
    pub table: u32,
    /// Priority of the IP rule that sends non-marked traffic into `table`.
    pub rule_priority: u32,
    /// MTU to set on the WireGuard interface.
    pub mtu: u32,
    /// Grace window the route-table reconciler waits before deleting a route
    /// that disappeared from the desired set.
    pub route_cleanup_delay: Duration,
    /// Routing protocol tag stamped on routes/rules this reconciler owns, so
    /// they can be told apart from a foreign reconciler sharing the same table.
    pub route_protocol: u8,
    /// When false, Phase A tears everything down instead of converging.
    pub enabled: bool,
}

impl LocalConfig {
    /// A config with reasonable defaults for tests and examples; most fields
    /// still need to be filled in by the caller for a real instance.
    pub fn new(hostname: impl Into<String>, interface: InterfaceName) -> Self {
        Self {
            hostname: hostname.into(),
            interface,
            listen_port: 51820,
            firewall_mark: 0,
            table: 0,
            rule_priority: 0,
            mtu: 1420,
            route_cleanup_delay: DEFAULT_ROUTE_CLEANUP_DELAY,
            route_protocol: 0,
            enabled: true,
        }
    }
}
