//! Neighbor Solicitation probing for IPv6 addresses (RFC 4861).

use async_trait::async_trait;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read};
use std::net::{IpAddr, Ipv6Addr, SocketAddrV6};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::netlink::Link;
use crate::types::MacAddr;

pub const ICMPV6_NEIGHBOR_SOLICITATION: u8 = 135;
pub const ICMPV6_NEIGHBOR_ADVERTISEMENT: u8 = 136;
const OPTION_SOURCE_LINK_LAYER: u8 = 1;
const OPTION_TARGET_LINK_LAYER: u8 = 2;
/// Type, code, checksum, reserved/flags, target
const NDP_MSG_SIZE: usize = 24;
/// Receivers drop neighbor discovery with any other hop limit
const NDP_HOP_LIMIT: u32 = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NdpOption {
    SourceLinkLayer(MacAddr),
    TargetLinkLayer(MacAddr),
    Other { kind: u8, data: Vec<u8> },
}

impl NdpOption {
    pub fn link_layer_addr(&self) -> Option<MacAddr> {
        match self {
            NdpOption::SourceLinkLayer(mac) | NdpOption::TargetLinkLayer(mac) => Some(*mac),
            NdpOption::Other { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NdpMessage {
    NeighborSolicitation {
        target: Ipv6Addr,
        options: Vec<NdpOption>,
    },
    NeighborAdvertisement {
        router: bool,
        solicited: bool,
        override_flag: bool,
        target: Ipv6Addr,
        options: Vec<NdpOption>,
    },
    /// Any other ICMPv6 type
    Other(u8),
}

impl NdpMessage {
    /// Solicitation for `target` carrying our link-layer address
    pub fn solicitation(target: Ipv6Addr, source: MacAddr) -> Self {
        NdpMessage::NeighborSolicitation {
            target,
            options: vec![NdpOption::SourceLinkLayer(source)],
        }
    }

    /// Hardware address announced for `target`, if this is an
    /// advertisement for it with exactly one link-layer option
    pub fn advertised_mac(&self, target: Ipv6Addr) -> Option<MacAddr> {
        match self {
            NdpMessage::NeighborAdvertisement {
                target: advertised,
                options,
                ..
            } if *advertised == target && options.len() == 1 => options[0].link_layer_addr(),
            _ => None,
        }
    }

    /// ICMPv6 body; the checksum is left zero for the kernel to fill in
    pub fn to_bytes(&self) -> Vec<u8> {
        let (kind, flags, target, options) = match self {
            NdpMessage::NeighborSolicitation { target, options } => {
                (ICMPV6_NEIGHBOR_SOLICITATION, 0u32, target, options)
            }
            NdpMessage::NeighborAdvertisement {
                router,
                solicited,
                override_flag,
                target,
                options,
            } => {
                let flags = (u32::from(*router) << 31)
                    | (u32::from(*solicited) << 30)
                    | (u32::from(*override_flag) << 29);
                (ICMPV6_NEIGHBOR_ADVERTISEMENT, flags, target, options)
            }
            NdpMessage::Other(kind) => return vec![*kind, 0, 0, 0],
        };

        let mut buf = Vec::with_capacity(NDP_MSG_SIZE + 8 * options.len());
        buf.extend_from_slice(&[kind, 0, 0, 0]);
        buf.extend_from_slice(&flags.to_be_bytes());
        buf.extend_from_slice(&target.octets());
        for option in options {
            let (kind, data): (u8, &[u8]) = match option {
                NdpOption::SourceLinkLayer(mac) => (OPTION_SOURCE_LINK_LAYER, mac.as_bytes()),
                NdpOption::TargetLinkLayer(mac) => (OPTION_TARGET_LINK_LAYER, mac.as_bytes()),
                NdpOption::Other { kind, data } => (*kind, data.as_slice()),
            };
            let units = (2 + data.len()).div_ceil(8);
            buf.push(kind);
            buf.push(units as u8);
            buf.extend_from_slice(data);
            buf.resize(buf.len() + units * 8 - 2 - data.len(), 0);
        }
        buf
    }

    /// Parse an ICMPv6 message as delivered by a raw socket
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let kind = *buf.first()?;
        if kind != ICMPV6_NEIGHBOR_SOLICITATION && kind != ICMPV6_NEIGHBOR_ADVERTISEMENT {
            return Some(NdpMessage::Other(kind));
        }
        if buf.len() < NDP_MSG_SIZE || buf[1] != 0 {
            return None;
        }
        let flags = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let target = Ipv6Addr::from(<[u8; 16]>::try_from(&buf[8..24]).ok()?);
        let options = parse_options(&buf[NDP_MSG_SIZE..])?;

        Some(if kind == ICMPV6_NEIGHBOR_SOLICITATION {
            NdpMessage::NeighborSolicitation { target, options }
        } else {
            NdpMessage::NeighborAdvertisement {
                router: flags & (1 << 31) != 0,
                solicited: flags & (1 << 30) != 0,
                override_flag: flags & (1 << 29) != 0,
                target,
                options,
            }
        })
    }
}

fn parse_options(mut buf: &[u8]) -> Option<Vec<NdpOption>> {
    let mut options = Vec::new();
    while buf.len() >= 2 {
        let kind = buf[0];
        let len = usize::from(buf[1]) * 8;
        // zero-length options are invalid and would loop forever
        if len == 0 || len > buf.len() {
            return None;
        }
        let data = &buf[2..len];
        options.push(match kind {
            OPTION_SOURCE_LINK_LAYER | OPTION_TARGET_LINK_LAYER if data.len() >= 6 => {
                let mac = MacAddr::from_slice(&data[..6])?;
                if kind == OPTION_SOURCE_LINK_LAYER {
                    NdpOption::SourceLinkLayer(mac)
                } else {
                    NdpOption::TargetLinkLayer(mac)
                }
            }
            _ => NdpOption::Other {
                kind,
                data: data.to_vec(),
            },
        });
        buf = &buf[len..];
    }
    Some(options)
}

/// ff02::1:ffXX:XXXX for the low 24 bits of `target`
pub fn solicited_node_multicast(target: Ipv6Addr) -> Ipv6Addr {
    let o = target.octets();
    Ipv6Addr::from([
        0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01, 0xff, o[13], o[14], o[15],
    ])
}

/// ICMPv6 transport for neighbor discovery
#[async_trait]
pub trait NdpLink: Send + Sync {
    fn name(&self) -> &str;
    fn hardware_addr(&self) -> MacAddr;
    async fn send_to(&self, message: &NdpMessage, dst: Ipv6Addr) -> io::Result<()>;
    /// Next neighbor discovery message seen on the link
    async fn recv(&self) -> io::Result<NdpMessage>;
}

/// Probe `target` with up to `retry` solicitations.
///
/// Each attempt waits `interval` for a matching advertisement. An
/// advertisement carrying our own hardware address is not a conflict.
/// Running out of attempts yields `Error::RetryExhausted`.
pub async fn probe<L>(link: &L, target: Ipv6Addr, retry: u32, interval: Duration) -> Result<()>
where
    L: NdpLink + ?Sized,
{
    super::ensure_interval(interval)?;
    let local = link.hardware_addr();
    let solicitation = NdpMessage::solicitation(target, local);
    let group = solicited_node_multicast(target);

    for attempt in 1..=retry {
        debug!(interface = link.name(), %target, %group, attempt, "sending neighbor solicitation");
        link.send_to(&solicitation, group)
            .await
            .map_err(|source| Error::Transport {
                op: "send neighbor solicitation",
                source,
            })?;

        let deadline = Instant::now() + interval;
        loop {
            let message = match time::timeout_at(deadline, link.recv()).await {
                Err(_elapsed) => break,
                Ok(Err(source)) => {
                    return Err(Error::Transport {
                        op: "read neighbor advertisement",
                        source,
                    })
                }
                Ok(Ok(message)) => message,
            };
            let Some(mac) = message.advertised_mac(target) else {
                continue;
            };
            if mac == local {
                debug!(interface = link.name(), %target, "advertisement carries our own address");
                return Ok(());
            }
            warn!(interface = link.name(), %target, %mac, "ip conflict detected");
            return Err(Error::IpConflict {
                interface: link.name().to_string(),
                address: IpAddr::V6(target),
                mac,
            });
        }
    }

    Err(Error::RetryExhausted {
        interface: link.name().to_string(),
        address: IpAddr::V6(target),
        retries: retry,
    })
}

/// Raw ICMPv6 socket bound to one interface
pub struct NdpSocket {
    fd: AsyncFd<Socket>,
    name: String,
    index: u32,
    mac: MacAddr,
}

impl NdpSocket {
    /// Open on `link`, sending from `source` (its link-local address) when given
    pub fn bind(link: &Link, source: Option<Ipv6Addr>) -> Result<Self> {
        let mac = link
            .mac
            .ok_or_else(|| Error::Config(format!("{} has no hardware address", link.name)))?;
        let open = |source| Error::Transport { op: "open ICMPv6 socket", source };

        let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6)).map_err(open)?;
        socket.set_nonblocking(true).map_err(open)?;
        socket.bind_device(Some(link.name.as_bytes())).map_err(open)?;
        socket.set_multicast_if_v6(link.index).map_err(open)?;
        socket.set_multicast_hops_v6(NDP_HOP_LIMIT).map_err(open)?;
        socket.set_unicast_hops_v6(NDP_HOP_LIMIT).map_err(open)?;
        if let Some(source) = source {
            let addr = SocketAddrV6::new(source, 0, 0, link.index);
            socket.bind(&SockAddr::from(addr)).map_err(open)?;
        }

        let fd = AsyncFd::new(socket).map_err(open)?;
        Ok(Self {
            fd,
            name: link.name.clone(),
            index: link.index,
            mac,
        })
    }
}

#[async_trait]
impl NdpLink for NdpSocket {
    fn name(&self) -> &str {
        &self.name
    }

    fn hardware_addr(&self) -> MacAddr {
        self.mac
    }

    async fn send_to(&self, message: &NdpMessage, dst: Ipv6Addr) -> io::Result<()> {
        let bytes = message.to_bytes();
        let addr = SockAddr::from(SocketAddrV6::new(dst, 0, 0, self.index));
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send_to(&bytes, &addr)) {
                Ok(result) => return result.map(|_| ()),
                Err(_would_block) => continue,
            }
        }
    }

    async fn recv(&self) -> io::Result<NdpMessage> {
        let mut buf = [0u8; 1500];
        loop {
            let mut guard = self.fd.readable().await?;
            let len = match guard.try_io(|inner| (&*inner.get_ref()).read(&mut buf)) {
                Ok(result) => result?,
                Err(_would_block) => continue,
            };
            if let Some(message) = NdpMessage::parse(&buf[..len]) {
                return Ok(message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solicited_node_multicast() {
        let target: Ipv6Addr = "fd00::1234:5678".parse().unwrap();
        assert_eq!(
            solicited_node_multicast(target),
            "ff02::1:ff34:5678".parse::<Ipv6Addr>().unwrap()
        );
    }

    #[test]
    fn test_solicitation_bytes() {
        let mac = MacAddr([0x02, 0x42, 0xac, 0x11, 0x00, 0x02]);
        let target: Ipv6Addr = "fd00::5".parse().unwrap();
        let bytes = NdpMessage::solicitation(target, mac).to_bytes();
        assert_eq!(bytes.len(), 32);
        assert_eq!(bytes[0], ICMPV6_NEIGHBOR_SOLICITATION);
        assert_eq!(&bytes[8..24], &target.octets());
        assert_eq!(&bytes[24..26], &[OPTION_SOURCE_LINK_LAYER, 1]);
        assert_eq!(&bytes[26..32], mac.as_bytes());
    }

    #[test]
    fn test_advertisement_parse() {
        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let target: Ipv6Addr = "fd00::5".parse().unwrap();
        let na = NdpMessage::NeighborAdvertisement {
            router: false,
            solicited: false,
            override_flag: true,
            target,
            options: vec![NdpOption::TargetLinkLayer(mac)],
        };
        let parsed = NdpMessage::parse(&na.to_bytes()).unwrap();
        assert_eq!(parsed, na);
        assert_eq!(parsed.advertised_mac(target), Some(mac));
        assert_eq!(parsed.advertised_mac("fd00::6".parse().unwrap()), None);
    }

    #[test]
    fn test_advertisement_needs_exactly_one_option() {
        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let target: Ipv6Addr = "fd00::5".parse().unwrap();
        let na = NdpMessage::NeighborAdvertisement {
            router: false,
            solicited: true,
            override_flag: true,
            target,
            options: vec![
                NdpOption::TargetLinkLayer(mac),
                NdpOption::Other { kind: 5, data: vec![0; 6] },
            ],
        };
        assert_eq!(na.advertised_mac(target), None);
    }

    #[test]
    fn test_zero_length_option_rejected() {
        let mut bytes = NdpMessage::solicitation("fd00::5".parse().unwrap(), MacAddr::ZERO).to_bytes();
        bytes[25] = 0;
        assert!(NdpMessage::parse(&bytes).is_none());
    }
}
