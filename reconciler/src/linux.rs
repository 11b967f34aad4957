//! Real Linux implementations of the dataplane contracts (spec.md §6), built
//! directly on generic- and route-netlink via [`netlink_request`] -- the same
//! transport [`wireguard_control::backends::kernel`] uses for its own
//! genetlink traffic. Deliberately avoids `wireguard-control-sys`'s C FFI:
//! [`wireguard_control::backends::kernel::get_by_name`] already talks pure
//! genetlink for reads, and the write path here follows the same shape by
//! hand (see DESIGN.md for why the crate doesn't reuse `DeviceUpdate::apply`).

use std::net::{IpAddr, Ipv4Addr};

use ipnet::Ipv4Net;
use netlink_packet_core::{NetlinkPayload, NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL, NLM_F_REQUEST};
use netlink_packet_generic::GenlMessage;
use netlink_packet_route::{
    constants::*,
    link::nlas::{Info, InfoKind, Nla as LinkNla},
    route::Nla as RouteNla,
    rule::Nla as RuleNla,
    AddressHeader, AddressMessage, LinkHeader, LinkMessage, RouteHeader, RouteMessage, RtnlMessage,
    RuleHeader, RuleMessage,
};
use netlink_packet_wireguard::{
    nlas::{WgAllowedIpAttrs, WgDeviceAttrs, WgDeviceFlags, WgPeerAttrs, WgPeerFlags},
    Wireguard, WireguardCmd,
};
use netlink_request::{netlink_request_genl, netlink_request_rtnl};
use wireguard_control::{backends::kernel::get_by_name, InterfaceName};

use crate::{
    dataplane::{
        DataplaneClient, DeviceConfig, DeviceState, DpResult, IpRule, LinkInfo, LinkState,
        PeerState, RouteDesire, RouteKind, WireguardClient,
    },
    error::DataplaneError,
    route_table::RouteInstaller,
};

fn io_err(message: impl Into<String>) -> DataplaneError {
    DataplaneError::from(std::io::Error::new(std::io::ErrorKind::Other, message.into()))
}

/// Route/link/address/rule operations, all over rtnetlink.
#[derive(Debug, Default)]
pub struct NetlinkClient;

impl NetlinkClient {
    pub fn open() -> Result<Self, DataplaneError> {
        Ok(Self)
    }
}

fn link_lookup(name: &str) -> DpResult<Option<(LinkMessage, LinkInfo)>> {
    let responses = netlink_request_rtnl(
        RtnlMessage::GetLink(LinkMessage::default()),
        Some(NLM_F_REQUEST | NLM_F_DUMP),
    )
    .map_err(DataplaneError::from)?;

    for response in responses {
        if let NetlinkPayload::InnerMessage(RtnlMessage::NewLink(link)) = response.payload {
            let matches_name = link.nlas.iter().any(|nla| matches!(
                nla,
                LinkNla::IfName(n) if n == name
            ));
            if !matches_name {
                continue;
            }
            let mtu = link
                .nlas
                .iter()
                .find_map(|nla| match nla {
                    LinkNla::Mtu(mtu) => Some(*mtu),
                    _ => None,
                })
                .unwrap_or(0);
            let state = if link.header.flags & IFF_UP != 0 {
                LinkState::Up
            } else {
                LinkState::Down
            };
            return Ok(Some((
                link.clone(),
                LinkInfo {
                    index: link.header.index,
                    state,
                    mtu,
                },
            )));
        }
    }
    Ok(None)
}

impl DataplaneClient for NetlinkClient {
    fn link_add_wireguard(&mut self, name: &str, mtu: u32) -> DpResult<()> {
        let message = LinkMessage {
            header: LinkHeader {
                ..Default::default()
            },
            nlas: vec![
                LinkNla::IfName(name.to_string()),
                LinkNla::Mtu(mtu),
                LinkNla::Info(vec![Info::Kind(InfoKind::Wireguard)]),
            ],
        };
        netlink_request_rtnl(RtnlMessage::NewLink(message), None)
            .map(drop)
            .map_err(DataplaneError::from)
    }

    fn link_del(&mut self, name: &str) -> DpResult<()> {
        let Some((_, info)) = link_lookup(name)? else {
            return Ok(());
        };
        let message = LinkMessage {
            header: LinkHeader {
                index: info.index,
                ..Default::default()
            },
            nlas: vec![],
        };
        netlink_request_rtnl(RtnlMessage::DelLink(message), None)
            .map(drop)
            .map_err(DataplaneError::from)
    }

    fn link_set_up(&mut self, name: &str) -> DpResult<()> {
        let Some((_, info)) = link_lookup(name)? else {
            return Err(io_err(format!("no such link: {name}")));
        };
        let message = LinkMessage {
            header: LinkHeader {
                index: info.index,
                flags: IFF_UP,
                change_mask: IFF_UP,
                ..Default::default()
            },
            nlas: vec![],
        };
        netlink_request_rtnl(RtnlMessage::SetLink(message), None)
            .map(drop)
            .map_err(DataplaneError::from)
    }

    fn link_set_mtu(&mut self, name: &str, mtu: u32) -> DpResult<()> {
        let Some((_, info)) = link_lookup(name)? else {
            return Err(io_err(format!("no such link: {name}")));
        };
        let message = LinkMessage {
            header: LinkHeader {
                index: info.index,
                ..Default::default()
            },
            nlas: vec![LinkNla::Mtu(mtu)],
        };
        netlink_request_rtnl(RtnlMessage::SetLink(message), None)
            .map(drop)
            .map_err(DataplaneError::from)
    }

    fn link_by_name(&mut self, name: &str) -> DpResult<Option<LinkInfo>> {
        Ok(link_lookup(name)?.map(|(_, info)| info))
    }

    fn addr_list(&mut self, link_index: u32) -> DpResult<Vec<Ipv4Addr>> {
        let responses = netlink_request_rtnl(
            RtnlMessage::GetAddress(AddressMessage::default()),
            Some(NLM_F_REQUEST | NLM_F_DUMP),
        )
        .map_err(DataplaneError::from)?;

        let mut addrs = Vec::new();
        for response in responses {
            if let NetlinkPayload::InnerMessage(RtnlMessage::NewAddress(addr)) = response.payload {
                if addr.header.index != link_index {
                    continue;
                }
                for nla in &addr.nlas {
                    if let netlink_packet_route::address::Nla::Address(bytes) = nla {
                        if let Ok(octets) = <[u8; 4]>::try_from(bytes.as_slice()) {
                            addrs.push(Ipv4Addr::from(octets));
                        }
                    }
                }
            }
        }
        Ok(addrs)
    }

    fn addr_add(&mut self, link_index: u32, addr: Ipv4Addr) -> DpResult<()> {
        let message = AddressMessage {
            header: AddressHeader {
                family: AF_INET as u8,
                prefix_len: 32,
                index: link_index,
                ..Default::default()
            },
            nlas: vec![
                netlink_packet_route::address::Nla::Local(addr.octets().to_vec()),
                netlink_packet_route::address::Nla::Address(addr.octets().to_vec()),
            ],
        };
        netlink_request_rtnl(RtnlMessage::NewAddress(message), None)
            .map(drop)
            .map_err(DataplaneError::from)
    }

    fn addr_del(&mut self, link_index: u32, addr: Ipv4Addr) -> DpResult<()> {
        let message = AddressMessage {
            header: AddressHeader {
                family: AF_INET as u8,
                prefix_len: 32,
                index: link_index,
                ..Default::default()
            },
            nlas: vec![netlink_packet_route::address::Nla::Address(
                addr.octets().to_vec(),
            )],
        };
        netlink_request_rtnl(RtnlMessage::DelAddress(message), None)
            .map(drop)
            .map_err(DataplaneError::from)
    }

    fn rule_list(&mut self, table: u32) -> DpResult<Vec<IpRule>> {
        let responses = netlink_request_rtnl(
            RtnlMessage::GetRule(RuleMessage::default()),
            Some(NLM_F_REQUEST | NLM_F_DUMP),
        )
        .map_err(DataplaneError::from)?;

        let mut rules = Vec::new();
        for response in responses {
            if let NetlinkPayload::InnerMessage(RtnlMessage::NewRule(rule)) = response.payload {
                let rule_table = rule
                    .nlas
                    .iter()
                    .find_map(|nla| match nla {
                        RuleNla::Table(t) => Some(*t),
                        _ => None,
                    })
                    .unwrap_or(rule.header.table as u32);
                if rule_table != table {
                    continue;
                }
                let priority = rule
                    .nlas
                    .iter()
                    .find_map(|nla| match nla {
                        RuleNla::Priority(p) => Some(*p),
                        _ => None,
                    })
                    .unwrap_or(0);
                let mark = rule
                    .nlas
                    .iter()
                    .find_map(|nla| match nla {
                        RuleNla::FwMark(m) => Some(*m),
                        _ => None,
                    })
                    .unwrap_or(0);
                let invert = rule.header.flags & FIB_RULE_INVERT != 0;
                rules.push(IpRule {
                    priority,
                    table: rule_table,
                    mark,
                    invert,
                });
            }
        }
        Ok(rules)
    }

    fn rule_add(&mut self, rule: IpRule) -> DpResult<()> {
        let message = rule_message(rule);
        netlink_request_rtnl(RtnlMessage::NewRule(message), None)
            .map(drop)
            .map_err(DataplaneError::from)
    }

    fn rule_del(&mut self, rule: IpRule) -> DpResult<()> {
        let message = rule_message(rule);
        netlink_request_rtnl(RtnlMessage::DelRule(message), None)
            .map(drop)
            .map_err(DataplaneError::from)
    }
}

fn rule_message(rule: IpRule) -> RuleMessage {
    RuleMessage {
        header: RuleHeader {
            family: AF_INET as u8,
            action: FR_ACT_TO_TBL,
            flags: if rule.invert { FIB_RULE_INVERT } else { 0 },
            ..Default::default()
        },
        nlas: vec![
            RuleNla::Table(rule.table),
            RuleNla::Priority(rule.priority),
            RuleNla::FwMark(rule.mark),
        ],
    }
}

/// The wireguard device's genetlink half: reads reuse
/// [`wireguard_control::backends::kernel::get_by_name`] (already FFI-free);
/// writes are a hand-written `SetDevice` request, since the teacher's own
/// write path goes through `wireguard-control-sys` instead.
#[derive(Debug, Default)]
pub struct WireguardNetlinkClient;

impl WireguardNetlinkClient {
    pub fn open() -> Result<Self, DataplaneError> {
        Ok(Self)
    }
}

impl WireguardClient for WireguardNetlinkClient {
    fn device_by_name(&mut self, name: &str) -> DpResult<DeviceState> {
        let iface: InterfaceName = name
            .parse()
            .map_err(|_| io_err(format!("invalid interface name: {name}")))?;
        let device = get_by_name(&iface).map_err(DataplaneError::from)?;

        let peers = device
            .peers
            .into_iter()
            .map(|p| PeerState {
                public_key: p.config.public_key,
                endpoint: match p.config.endpoint {
                    Some(std::net::SocketAddr::V4(v4)) => Some(v4),
                    _ => None,
                },
                allowed_ips: p
                    .config
                    .allowed_ips
                    .into_iter()
                    .filter_map(|a| match a.address {
                        IpAddr::V4(ip) => Ipv4Net::new(ip, a.cidr).ok(),
                        IpAddr::V6(_) => None,
                    })
                    .collect(),
            })
            .collect();

        Ok(DeviceState {
            public_key: device.public_key,
            private_key: device.private_key,
            listen_port: device.listen_port.unwrap_or(0),
            firewall_mark: device.fwmark.unwrap_or(0),
            peers,
        })
    }

    fn configure_device(&mut self, name: &str, config: DeviceConfig) -> DpResult<()> {
        let mut device_flags = Vec::new();
        let mut nlas = vec![WgDeviceAttrs::IfName(name.to_string())];

        if let Some(private_key) = config.private_key {
            nlas.push(WgDeviceAttrs::PrivateKey(private_key.0));
            device_flags.push(WgDeviceFlags::HasPrivateKey);
        }
        if let Some(port) = config.listen_port {
            nlas.push(WgDeviceAttrs::ListenPort(port));
        }
        if let Some(mark) = config.firewall_mark {
            nlas.push(WgDeviceAttrs::Fwmark(mark));
        }

        if !config.peers.is_empty() {
            let peers = config
                .peers
                .into_iter()
                .map(|update| {
                    let mut peer_flags = Vec::new();
                    let mut peer_nlas = vec![WgPeerAttrs::PublicKey(update.public_key.0)];
                    if update.remove {
                        peer_flags.push(WgPeerFlags::RemoveMe);
                    } else {
                        if let Some(endpoint) = update.endpoint {
                            peer_nlas.push(WgPeerAttrs::Endpoint(std::net::SocketAddr::V4(endpoint)));
                        }
                        if update.replace_allowed_ips {
                            peer_flags.push(WgPeerFlags::ReplaceAllowedIps);
                        }
                        let allowed_ips = update
                            .allowed_ips
                            .iter()
                            .map(|net| {
                                vec![
                                    WgAllowedIpAttrs::Family(AF_INET as u16),
                                    WgAllowedIpAttrs::IpAddr(IpAddr::V4(net.addr())),
                                    WgAllowedIpAttrs::Cidr(net.prefix_len()),
                                ]
                            })
                            .collect();
                        peer_nlas.push(WgPeerAttrs::AllowedIps(allowed_ips));
                    }
                    if !peer_flags.is_empty() {
                        peer_nlas.push(WgPeerAttrs::Flags(peer_flags));
                    }
                    peer_nlas
                })
                .collect();
            nlas.push(WgDeviceAttrs::Peers(peers));
            device_flags.push(WgDeviceFlags::ReplacePeers);
        }

        if !device_flags.is_empty() {
            nlas.push(WgDeviceAttrs::Flags(device_flags));
        }

        let genlmsg: GenlMessage<Wireguard> = GenlMessage::from_payload(Wireguard {
            cmd: WireguardCmd::SetDevice,
            nlas,
        });
        netlink_request_genl(genlmsg, Some(NLM_F_REQUEST | NLM_F_ACK))
            .map(drop)
            .map_err(DataplaneError::from)
    }
}

fn route_message(route: &RouteDesire) -> RouteMessage {
    let (scope, kind) = match route.kind {
        RouteKind::Unicast => (RT_SCOPE_LINK, RTN_UNICAST),
        RouteKind::Throw => (RT_SCOPE_UNIVERSE, RTN_THROW),
    };
    let mut message = RouteMessage {
        header: RouteHeader {
            table: route.table as u8,
            protocol: route.proto,
            scope,
            kind,
            address_family: AF_INET as u8,
            destination_prefix_length: route.dst.prefix_len(),
            ..Default::default()
        },
        nlas: vec![RouteNla::Table(route.table), RouteNla::Destination(route.dst.addr().octets().to_vec())],
    };
    if let Some(index) = route.link_index {
        message.nlas.push(RouteNla::Oif(index));
    }
    message
}

/// Programs routes for [`crate::route_table::GraceWindowRouteTable`] over
/// rtnetlink, following the teacher's `add_route` request shape (see
/// DESIGN.md) but going through this crate's own `netlink_request_rtnl`
/// helper instead of a hand-rolled socket, and covering both the unicast and
/// `throw` route kinds spec.md §3 requires.
#[derive(Debug, Default)]
pub struct NetlinkRouteInstaller;

impl NetlinkRouteInstaller {
    pub fn new() -> Self {
        Self
    }
}

impl RouteInstaller for NetlinkRouteInstaller {
    fn add_route(&mut self, route: &RouteDesire) -> Result<(), String> {
        let message = route_message(route);
        netlink_request_rtnl(
            RtnlMessage::NewRoute(message),
            Some(NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL),
        )
        .map(drop)
        .map_err(|e| e.to_string())
    }

    fn del_route(&mut self, route: &RouteDesire) -> Result<(), String> {
        let message = route_message(route);
        netlink_request_rtnl(RtnlMessage::DelRoute(message), Some(NLM_F_REQUEST | NLM_F_ACK))
            .map(drop)
            .map_err(|e| e.to_string())
    }
}
