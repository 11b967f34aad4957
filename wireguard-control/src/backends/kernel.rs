use crate::{
    device::AllowedIp, key::Key, Backend, Device, DeviceUpdate, InterfaceName, PeerConfig,
    PeerConfigBuilder, PeerInfo, PeerStats,
};
use netlink_packet_core::{
    NetlinkDeserializable, NetlinkMessage, NetlinkPayload, NetlinkSerializable, NLM_F_ACK,
    NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL, NLM_F_REQUEST,
};
use netlink_packet_generic::GenlMessage;
use netlink_packet_route::{
    constants::*,
    link::{
        self,
        nlas::{Info, InfoKind},
    },
    LinkHeader, LinkMessage, RtnlMessage,
};
use netlink_packet_wireguard::{
    self,
    nlas::{WgAllowedIpAttrs, WgDeviceAttrs, WgDeviceFlags, WgPeerAttrs, WgPeerFlags},
    Wireguard, WireguardCmd,
};
use netlink_sys::{protocols::NETLINK_ROUTE, Socket};

use std::{convert::TryFrom, io};

macro_rules! get_nla_value {
    ($nlas:expr, $e:ident, $v:ident) => {
        $nlas.iter().find_map(|attr| match attr {
            $e::$v(value) => Some(value),
            _ => None,
        })
    };
}

impl TryFrom<Vec<WgAllowedIpAttrs>> for AllowedIp {
    type Error = io::Error;

    fn try_from(attrs: Vec<WgAllowedIpAttrs>) -> Result<Self, Self::Error> {
        let address = get_nla_value!(attrs, WgAllowedIpAttrs, IpAddr)
            .ok_or(io::ErrorKind::NotFound)?
            .clone();
        let cidr = *get_nla_value!(attrs, WgAllowedIpAttrs, Cidr).ok_or(io::ErrorKind::NotFound)?;
        Ok(AllowedIp { address, cidr })
    }
}

impl TryFrom<Vec<WgPeerAttrs>> for PeerInfo {
    type Error = io::Error;

    fn try_from(attrs: Vec<WgPeerAttrs>) -> Result<Self, Self::Error> {
        let public_key = get_nla_value!(attrs, WgPeerAttrs, PublicKey)
            .map(|key| Key(*key))
            .ok_or(io::ErrorKind::NotFound)?;
        let preshared_key = get_nla_value!(attrs, WgPeerAttrs, PresharedKey).map(|key| Key(*key));
        let endpoint = get_nla_value!(attrs, WgPeerAttrs, Endpoint).cloned();
        let persistent_keepalive_interval =
            get_nla_value!(attrs, WgPeerAttrs, PersistentKeepalive).cloned();
        let allowed_ips = get_nla_value!(attrs, WgPeerAttrs, AllowedIps)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(AllowedIp::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let last_handshake_time = get_nla_value!(attrs, WgPeerAttrs, LastHandshake).cloned();
        let rx_bytes = get_nla_value!(attrs, WgPeerAttrs, RxBytes)
            .cloned()
            .unwrap_or_default();
        let tx_bytes = get_nla_value!(attrs, WgPeerAttrs, TxBytes)
            .cloned()
            .unwrap_or_default();
        Ok(PeerInfo {
            config: PeerConfig {
                public_key,
                preshared_key,
                endpoint,
                persistent_keepalive_interval,
                allowed_ips,
                __cant_construct_me: (),
            },
            stats: PeerStats {
                last_handshake_time,
                rx_bytes,
                tx_bytes,
            },
        })
    }
}

impl TryFrom<&Wireguard> for Device {
    type Error = io::Error;

    fn try_from(wg: &Wireguard) -> Result<Self, Self::Error> {
        let name = get_nla_value!(wg.nlas, WgDeviceAttrs, IfName)
            .ok_or(io::ErrorKind::NotFound)?
            .parse()?;
        let public_key = get_nla_value!(wg.nlas, WgDeviceAttrs, PublicKey).map(|key| Key(*key));
        let private_key = get_nla_value!(wg.nlas, WgDeviceAttrs, PrivateKey).map(|key| Key(*key));
        let listen_port = get_nla_value!(wg.nlas, WgDeviceAttrs, ListenPort).cloned();
        let fwmark = get_nla_value!(wg.nlas, WgDeviceAttrs, Fwmark).cloned();
        let peers = get_nla_value!(wg.nlas, WgDeviceAttrs, Peers)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(PeerInfo::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Device {
            name,
            public_key,
            private_key,
            listen_port,
            fwmark,
            peers,
            linked_name: None,
            backend: Backend::Kernel,
            __cant_construct_me: (),
        })
    }
}

fn netlink_call<I>(message: I, flags: Option<u16>) -> Result<Vec<NetlinkMessage<I>>, io::Error>
where
    NetlinkPayload<I>: From<I>,
    I: Clone + std::fmt::Debug + Eq + NetlinkSerializable<I> + NetlinkDeserializable<I>,
{
    let mut req = NetlinkMessage::from(message);
    req.header.flags = flags.unwrap_or(NLM_F_REQUEST | NLM_F_ACK | NLM_F_EXCL | NLM_F_CREATE);
    req.finalize();
    let mut buf = [0; 4096];
    req.serialize(&mut buf);
    let len = req.buffer_len();

    let socket = Socket::new(NETLINK_ROUTE)?;
    let kernel_addr = netlink_sys::SocketAddr::new(0, 0);
    socket.connect(&kernel_addr)?;
    let n_sent = socket.send(&buf[..len], 0)?;
    if n_sent != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "failed to send netlink request",
        ));
    }

    let mut responses = vec![];
    loop {
        let n_received = socket.recv(&mut buf[..], 0)?;
        let mut offset = 0;
        loop {
            let bytes = &buf[offset..];
            let response = NetlinkMessage::<I>::deserialize(bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            responses.push(response.clone());
            match response.payload {
                // We've parsed all parts of the response and can leave the loop.
                NetlinkPayload::Ack(_) | NetlinkPayload::Done => return Ok(responses),
                NetlinkPayload::Error(e) => return Err(e.into()),
                _ => {},
            }
            offset += response.header.length as usize;
            if offset == n_received || response.header.length == 0 {
                // We've fully parsed the datagram, but there may be further datagrams
                // with additional netlink response parts.
                break;
            }
        }
    }
}

pub fn enumerate() -> Result<Vec<InterfaceName>, io::Error> {
    let link_responses = netlink_call(
        RtnlMessage::GetLink(LinkMessage::default()),
        Some(NLM_F_DUMP | NLM_F_REQUEST),
    )?;
    let links = link_responses
        .into_iter()
        // Filter out non-link messages
        .filter_map(|response| match response {
            NetlinkMessage {
                payload: NetlinkPayload::InnerMessage(RtnlMessage::NewLink(link)),
                ..
            } => Some(link),
            _ => None,
        })
        .filter(|link| {
            for nla in link.nlas.iter() {
                if let link::nlas::Nla::Info(infos) = nla {
                    return infos.iter().any(|info| info == &Info::Kind(InfoKind::Wireguard));
                }
            }
            false
        })
        .filter_map(|link| {
            link.nlas.iter().find_map(|nla| match nla {
                link::nlas::Nla::IfName(name) => Some(name.clone()),
                _ => None,
            })
        })
        .filter_map(|name| name.parse().ok())
        .collect::<Vec<_>>();

    Ok(links)
}

pub fn get_by_name(name: &InterfaceName) -> Result<Device, io::Error> {
    let genlmsg: GenlMessage<Wireguard> = GenlMessage::from_payload(Wireguard {
        cmd: WireguardCmd::GetDevice,
        nlas: vec![WgDeviceAttrs::IfName(name.as_str_lossy().to_string())],
    });
    let responses = netlink_call(genlmsg, Some(NLM_F_REQUEST | NLM_F_ACK))?;

    let found_error = responses.iter().find_map(|msg| match msg.payload {
        NetlinkPayload::Error(ref e) => Some(e.clone()),
        _ => None,
    });
    if let Some(e) = found_error {
        return Err(e.to_io());
    }
    if responses.len() != 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Unexpected number of messages from netlink response",
        ));
    }
    if let NetlinkPayload::InnerMessage(message) = &responses[0].payload {
        Device::try_from(&message.payload)
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Unexpected number of messages from netlink response",
        ))
    }
}

/// Ensures a wireguard link with this name exists, creating it if absent.
/// Mirrors `ip link add <name> type wireguard`, tolerating a concurrent creation.
fn ensure_link(iface: &InterfaceName) -> io::Result<()> {
    let message = LinkMessage {
        header: LinkHeader::default(),
        nlas: vec![
            link::nlas::Nla::IfName(iface.as_str_lossy().to_string()),
            link::nlas::Nla::Info(vec![Info::Kind(InfoKind::Wireguard)]),
        ],
    };
    match netlink_call(
        RtnlMessage::NewLink(message),
        Some(NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL),
    ) {
        Ok(_) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EEXIST) => Ok(()),
        Err(e) => Err(e),
    }
}

fn peer_nlas(peer: &PeerConfigBuilder) -> Vec<WgPeerAttrs> {
    let mut flags = Vec::new();
    let mut nlas = vec![WgPeerAttrs::PublicKey(peer.public_key().0)];

    if peer.remove_me {
        flags.push(WgPeerFlags::RemoveMe);
        nlas.push(WgPeerAttrs::Flags(flags));
        return nlas;
    }

    if let Some(Key(k)) = peer.preshared_key {
        nlas.push(WgPeerAttrs::PresharedKey(k));
    }
    if let Some(endpoint) = peer.endpoint {
        nlas.push(WgPeerAttrs::Endpoint(endpoint));
    }
    if let Some(interval) = peer.persistent_keepalive_interval {
        nlas.push(WgPeerAttrs::PersistentKeepalive(interval));
    }
    if peer.replace_allowed_ips {
        flags.push(WgPeerFlags::ReplaceAllowedIps);
    }
    if !peer.allowed_ips.is_empty() {
        let allowed_ips = peer
            .allowed_ips
            .iter()
            .map(|ip| {
                vec![
                    WgAllowedIpAttrs::Family(match ip.address {
                        std::net::IpAddr::V4(_) => libc::AF_INET as u16,
                        std::net::IpAddr::V6(_) => libc::AF_INET6 as u16,
                    }),
                    WgAllowedIpAttrs::IpAddr(ip.address),
                    WgAllowedIpAttrs::Cidr(ip.cidr),
                ]
            })
            .collect();
        nlas.push(WgPeerAttrs::AllowedIps(allowed_ips));
    }
    if !flags.is_empty() {
        nlas.push(WgPeerAttrs::Flags(flags));
    }
    nlas
}

pub fn apply(builder: &DeviceUpdate, iface: &InterfaceName) -> io::Result<()> {
    ensure_link(iface)?;

    let mut device_flags = Vec::new();
    let mut nlas = vec![WgDeviceAttrs::IfName(iface.as_str_lossy().to_string())];

    if let Some(Key(k)) = builder.private_key {
        nlas.push(WgDeviceAttrs::PrivateKey(k));
        device_flags.push(WgDeviceFlags::HasPrivateKey);
    }
    if let Some(Key(k)) = builder.public_key {
        nlas.push(WgDeviceAttrs::PublicKey(k));
    }
    if let Some(f) = builder.fwmark {
        nlas.push(WgDeviceAttrs::Fwmark(f));
    }
    if let Some(port) = builder.listen_port {
        nlas.push(WgDeviceAttrs::ListenPort(port));
    }
    if builder.replace_peers {
        device_flags.push(WgDeviceFlags::ReplacePeers);
    }
    if !builder.peers.is_empty() {
        nlas.push(WgDeviceAttrs::Peers(
            builder.peers.iter().map(peer_nlas).collect(),
        ));
    }
    if !device_flags.is_empty() {
        nlas.push(WgDeviceAttrs::Flags(device_flags));
    }

    let genlmsg: GenlMessage<Wireguard> = GenlMessage::from_payload(Wireguard {
        cmd: WireguardCmd::SetDevice,
        nlas,
    });
    netlink_call(genlmsg, Some(NLM_F_REQUEST | NLM_F_ACK)).map(drop)
}

pub fn delete_interface(iface: &InterfaceName) -> io::Result<()> {
    let name = iface.as_str_lossy();
    let link_responses = netlink_call(
        RtnlMessage::GetLink(LinkMessage::default()),
        Some(NLM_F_DUMP | NLM_F_REQUEST),
    )?;
    let index = link_responses
        .into_iter()
        .filter_map(|response| match response {
            NetlinkMessage {
                payload: NetlinkPayload::InnerMessage(RtnlMessage::NewLink(link)),
                ..
            } => Some(link),
            _ => None,
        })
        .find(|link| {
            link.nlas
                .iter()
                .any(|nla| matches!(nla, link::nlas::Nla::IfName(n) if n == name.as_ref()))
        })
        .map(|link| link.header.index);

    let Some(index) = index else {
        return Ok(());
    };

    let message = LinkMessage {
        header: LinkHeader {
            index,
            ..Default::default()
        },
        nlas: vec![],
    };
    netlink_call(RtnlMessage::DelLink(message), None).map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_ip_roundtrips_through_nlas() {
        let attrs = vec![
            WgAllowedIpAttrs::Family(libc::AF_INET as u16),
            WgAllowedIpAttrs::IpAddr("10.0.0.1".parse().unwrap()),
            WgAllowedIpAttrs::Cidr(32),
        ];
        let ip = AllowedIp::try_from(attrs).unwrap();
        assert_eq!(ip.address, "10.0.0.1".parse::<std::net::IpAddr>().unwrap());
        assert_eq!(ip.cidr, 32);
    }

    #[test]
    fn allowed_ip_missing_address_is_rejected() {
        let attrs = vec![WgAllowedIpAttrs::Cidr(32)];
        assert!(AllowedIp::try_from(attrs).is_err());
    }
}
