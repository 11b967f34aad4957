//! Reference binary: loads a [`LocalConfig`] from a TOML file, wires up the
//! Linux netlink/wireguard backends and a [`GraceWindowRouteTable`], and
//! loops `Apply` on a fixed interval until killed (spec.md §6, §10).
//!
//! This binary is scaffolding around the core, not part of it: the library
//! crate's public API takes a [`LocalConfig`] value and trait objects
//! directly, and never reads a file, an environment variable, or a CLI flag
//! itself (spec.md §6).

use std::{env, fs, path::PathBuf, time::Duration};

use serde::Deserialize;
use wireguard_control::InterfaceName;

use wg_reconciler::{config::DEFAULT_ROUTE_CLEANUP_DELAY, dataplane::StatusCallback, LocalConfig, Reconciler};

const DEFAULT_CONFIG_PATH: &str = "/etc/wg-reconciler/config.toml";
const APPLY_INTERVAL: Duration = Duration::from_secs(5);

fn default_mtu() -> u32 {
    1420
}

fn default_cleanup_delay_secs() -> u64 {
    DEFAULT_ROUTE_CLEANUP_DELAY.as_secs()
}

fn default_enabled() -> bool {
    true
}

/// On-disk shape of the reference binary's config file; converted into the
/// library's own [`LocalConfig`] once parsed and validated. Mirrors
/// innernet's own `ConfigFile` (kebab-case, loaded via `toml`/`serde`).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ConfigFile {
    hostname: String,
    interface: String,
    listen_port: u16,
    #[serde(default)]
    firewall_mark: u32,
    table: u32,
    rule_priority: u32,
    #[serde(default = "default_mtu")]
    mtu: u32,
    #[serde(default = "default_cleanup_delay_secs")]
    route_cleanup_delay_secs: u64,
    #[serde(default)]
    route_protocol: u8,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

impl ConfigFile {
    fn read(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("reading {}: {e}", path.display()))?;
        Ok(toml::from_str(&contents)?)
    }

    fn into_local_config(self) -> Result<LocalConfig, Box<dyn std::error::Error>> {
        let interface: InterfaceName = self
            .interface
            .parse()
            .map_err(|e| format!("invalid interface name {:?}: {e}", self.interface))?;
        Ok(LocalConfig {
            hostname: self.hostname,
            interface,
            listen_port: self.listen_port,
            firewall_mark: self.firewall_mark,
            table: self.table,
            rule_priority: self.rule_priority,
            mtu: self.mtu,
            route_cleanup_delay: Duration::from_secs(self.route_cleanup_delay_secs),
            route_protocol: self.route_protocol,
            enabled: self.enabled,
        })
    }
}

/// Logs the locally-advertised public key whenever it changes; a real
/// embedder would instead forward it to whatever upstream collects node
/// status (spec.md §6's "status callback").
struct LoggingStatusCallback;

impl StatusCallback for LoggingStatusCallback {
    fn status(&mut self, public_key: wireguard_control::Key) -> Result<(), String> {
        log::info!("local public key is now {}", public_key.to_base64());
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    use wg_reconciler::{
        dataplane::DataplaneClient,
        linux::{NetlinkClient, NetlinkRouteInstaller, WireguardNetlinkClient},
        route_table::{GraceWindowRouteTable, SystemClock},
    };

    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", "warn,wg_reconciler=info");
    }
    pretty_env_logger::init();

    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = ConfigFile::read(&config_path)?.into_local_config()?;
    let cleanup_delay = config.route_cleanup_delay;

    log::info!(
        "wg-reconciler starting for interface {} (table {}, port {})",
        config.interface,
        config.table,
        config.listen_port
    );

    let routes = GraceWindowRouteTable::new(SystemClock, NetlinkRouteInstaller::new(), cleanup_delay);

    let iface = config.interface.to_string();
    let mut reconciler = Reconciler::new(
        config,
        || NetlinkClient::open(),
        || WireguardNetlinkClient::open(),
        routes,
        LoggingStatusCallback,
    );

    // Polls the link's up/down state on its own netlink handle and feeds it
    // to `on_iface_state_changed` every cycle, standing in for a real
    // rtnetlink event subscription (spec.md §4.2's `OnIfaceStateChanged`).
    // Without this, `link_up` never flips and Apply stays inert past link
    // creation.
    let mut link_monitor = NetlinkClient::open()?;

    loop {
        match link_monitor.link_by_name(&iface) {
            Ok(Some(info)) => reconciler.on_iface_state_changed(&iface, info.state),
            Ok(None) => {},
            Err(e) => log::warn!("link state poll failed: {e}"),
        }

        if let Err(e) = reconciler.apply() {
            log::warn!("apply failed, will retry next cycle: {e}");
        }
        std::thread::sleep(APPLY_INTERVAL);
    }
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("wg-reconciler: no dataplane backend is available on this platform");
    std::process::exit(1);
}
