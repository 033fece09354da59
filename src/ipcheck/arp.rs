//! ARP probing for IPv4 addresses (RFC 826, RFC 5227 style probes).

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use super::Cancellation;
use crate::error::{Error, Result};
use crate::netlink::Link;
use crate::types::MacAddr;

/// ARP payload size for Ethernet/IPv4
pub const ARP_PACKET_SIZE: usize = 28;
pub const ETHERTYPE_ARP: u16 = 0x0806;
const ETH_HEADER_LEN: usize = 14;
const MIN_FRAME_LEN: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ArpOp {
    Request = 1,
    Reply = 2,
}

/// ARP packet (Ethernet/IPv4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpPacket {
    pub operation: ArpOp,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    /// Probe for `target`: sender address 0.0.0.0 so no neighbor cache
    /// learns a binding from it.
    pub fn probe(sender_mac: MacAddr, target: Ipv4Addr) -> Self {
        Self {
            operation: ArpOp::Request,
            sender_mac,
            sender_ip: Ipv4Addr::UNSPECIFIED,
            target_mac: MacAddr::ZERO,
            target_ip: target,
        }
    }

    pub fn reply(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_mac: MacAddr, target_ip: Ipv4Addr) -> Self {
        Self {
            operation: ArpOp::Reply,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        }
    }

    /// Parse an Ethernet/IPv4 ARP payload
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < ARP_PACKET_SIZE {
            return None;
        }
        // htype 1 (Ethernet), ptype 0x0800, hlen 6, plen 4
        if buf[0..6] != [0x00, 0x01, 0x08, 0x00, 6, 4] {
            return None;
        }
        let operation = match u16::from_be_bytes([buf[6], buf[7]]) {
            1 => ArpOp::Request,
            2 => ArpOp::Reply,
            _ => return None,
        };
        Some(Self {
            operation,
            sender_mac: MacAddr::from_slice(&buf[8..14])?,
            sender_ip: Ipv4Addr::new(buf[14], buf[15], buf[16], buf[17]),
            target_mac: MacAddr::from_slice(&buf[18..24])?,
            target_ip: Ipv4Addr::new(buf[24], buf[25], buf[26], buf[27]),
        })
    }

    pub fn to_bytes(&self) -> [u8; ARP_PACKET_SIZE] {
        let mut buf = [0u8; ARP_PACKET_SIZE];
        buf[0..6].copy_from_slice(&[0x00, 0x01, 0x08, 0x00, 6, 4]);
        buf[6..8].copy_from_slice(&(self.operation as u16).to_be_bytes());
        buf[8..14].copy_from_slice(self.sender_mac.as_bytes());
        buf[14..18].copy_from_slice(&self.sender_ip.octets());
        buf[18..24].copy_from_slice(self.target_mac.as_bytes());
        buf[24..28].copy_from_slice(&self.target_ip.octets());
        buf
    }

    /// Wrap in a broadcast Ethernet frame from `source`
    pub fn to_frame(&self, source: MacAddr) -> Vec<u8> {
        let mut frame = Vec::with_capacity(MIN_FRAME_LEN);
        frame.extend_from_slice(MacAddr::BROADCAST.as_bytes());
        frame.extend_from_slice(source.as_bytes());
        frame.extend_from_slice(&ETHERTYPE_ARP.to_be_bytes());
        frame.extend_from_slice(&self.to_bytes());
        frame.resize(MIN_FRAME_LEN, 0);
        frame
    }

    /// Parse an Ethernet frame carrying ARP
    pub fn from_frame(frame: &[u8]) -> Option<Self> {
        if frame.len() < ETH_HEADER_LEN + ARP_PACKET_SIZE {
            return None;
        }
        if u16::from_be_bytes([frame[12], frame[13]]) != ETHERTYPE_ARP {
            return None;
        }
        Self::parse(&frame[ETH_HEADER_LEN..])
    }
}

/// Link-layer transport for ARP probes
#[async_trait]
pub trait ArpLink: Send + Sync {
    fn name(&self) -> &str;
    fn hardware_addr(&self) -> MacAddr;
    async fn send(&self, packet: &ArpPacket) -> io::Result<()>;
    /// Next ARP packet seen on the link
    async fn recv(&self) -> io::Result<ArpPacket>;
}

/// Probe `target` with up to `retry` requests, one per `interval`.
///
/// A listener task watches for replies from `target` while the prober
/// sends. Any reply is a conflict; silence after the last tick is not.
pub async fn probe<L>(link: Arc<L>, target: Ipv4Addr, retry: u32, interval: Duration) -> Result<()>
where
    L: ArpLink + 'static,
{
    super::ensure_interval(interval)?;
    let cancel = Cancellation::new();
    let listener = tokio::spawn(listen(Arc::clone(&link), target, cancel.clone()));

    let request = ArpPacket::probe(link.hardware_addr(), target);
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    let mut send_error = None;

    for attempt in 1..=retry {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                debug!(interface = link.name(), %target, attempt, "sending ARP probe");
                if let Err(err) = link.send(&request).await {
                    send_error = Some(err);
                    break;
                }
            }
        }
    }
    cancel.cancel();

    let seen = listener.await.map_err(|err| Error::Transport {
        op: "ARP listener",
        source: io::Error::other(err),
    })?;

    if let Some(source) = send_error {
        return Err(Error::Transport {
            op: "send ARP probe",
            source,
        });
    }
    match seen? {
        Some(mac) => {
            warn!(interface = link.name(), %target, %mac, "ip conflict detected");
            Err(Error::IpConflict {
                interface: link.name().to_string(),
                address: IpAddr::V4(target),
                mac,
            })
        }
        None => Ok(()),
    }
}

/// Read until a reply for `target` arrives or the probe is cancelled.
async fn listen<L>(link: Arc<L>, target: Ipv4Addr, cancel: Cancellation) -> Result<Option<MacAddr>>
where
    L: ArpLink + 'static,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            received = link.recv() => match received {
                Ok(packet) if packet.operation == ArpOp::Reply && packet.sender_ip == target => {
                    cancel.cancel();
                    return Ok(Some(packet.sender_mac));
                }
                Ok(_) => {}
                Err(source) => {
                    cancel.cancel();
                    return Err(Error::Transport { op: "read ARP reply", source });
                }
            },
        }
    }
}

/// AF_PACKET socket receiving ARP frames on one interface
pub struct ArpSocket {
    fd: AsyncFd<Socket>,
    name: String,
    mac: MacAddr,
}

impl ArpSocket {
    pub fn bind(link: &Link) -> Result<Self> {
        let mac = link
            .mac
            .ok_or_else(|| Error::Config(format!("{} has no hardware address", link.name)))?;
        let protocol = i32::from(ETHERTYPE_ARP.to_be());
        let socket = Socket::new(Domain::PACKET, Type::RAW, Some(Protocol::from(protocol)))
            .map_err(|source| Error::Transport { op: "open ARP socket", source })?;
        socket
            .set_nonblocking(true)
            .map_err(|source| Error::Transport { op: "open ARP socket", source })?;

        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = ETHERTYPE_ARP.to_be();
        addr.sll_ifindex = link.index as i32;
        let ret = unsafe {
            libc::bind(
                socket.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::Transport {
                op: "bind ARP socket",
                source: io::Error::last_os_error(),
            });
        }

        let fd = AsyncFd::new(socket).map_err(|source| Error::Transport { op: "register ARP socket", source })?;
        Ok(Self {
            fd,
            name: link.name.clone(),
            mac,
        })
    }
}

#[async_trait]
impl ArpLink for ArpSocket {
    fn name(&self) -> &str {
        &self.name
    }

    fn hardware_addr(&self) -> MacAddr {
        self.mac
    }

    async fn send(&self, packet: &ArpPacket) -> io::Result<()> {
        let frame = packet.to_frame(self.mac);
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send(&frame)) {
                Ok(result) => return result.map(|_| ()),
                Err(_would_block) => continue,
            }
        }
    }

    async fn recv(&self) -> io::Result<ArpPacket> {
        let mut buf = [0u8; 1514];
        loop {
            let mut guard = self.fd.readable().await?;
            let len = match guard.try_io(|inner| (&*inner.get_ref()).read(&mut buf)) {
                Ok(result) => result?,
                Err(_would_block) => continue,
            };
            if let Some(packet) = ArpPacket::from_frame(&buf[..len]) {
                return Ok(packet);
            }
        }
    }
}
