//! Veth pair lifecycle and static neighbor entries between host and pod.

use std::net::IpAddr;
use std::os::unix::io::AsRawFd;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::inventory::{self, AddressSet};
use crate::netlink::{Families, Link, Neighbor, NetlinkOps, Rtnl};
use crate::netns::NetNs;
use crate::types::MacAddr;

/// Pod side of the veth pair
pub const POD_VETH_NAME: &str = "veth0";
pub const VETH_MTU: u32 = 1500;
/// Container id characters used in the host-side name (IFNAMSIZ allows 15)
const HOST_VETH_ID_LEN: usize = 11;

/// Host-side veth name for a container
pub fn host_veth_name(container_id: &str) -> String {
    let id: String = container_id.chars().take(HOST_VETH_ID_LEN).collect();
    format!("veth{id}")
}

/// Both ends of the pod's veth pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethPair {
    /// End in the host namespace
    pub host: Link,
    /// End in the pod namespace
    pub pod: Link,
}

impl VethPair {
    pub fn host_mac(&self) -> Result<MacAddr> {
        link_mac(&self.host)
    }

    pub fn pod_mac(&self) -> Result<MacAddr> {
        link_mac(&self.pod)
    }
}

fn link_mac(link: &Link) -> Result<MacAddr> {
    link.mac
        .ok_or_else(|| Error::Config(format!("{} has no hardware address", link.name)))
}

/// True when the pod has no `veth0` yet, i.e. this is the first chained
/// interface to be wired.
pub async fn pod_veth_missing(pod_ns: &NetNs) -> Result<bool> {
    pod_ns
        .run(|| async move {
            let nl = Rtnl::connect()?;
            Ok(nl.link_by_name(POD_VETH_NAME).await?.is_none())
        })
        .await
}

/// Create the veth pair for the first chained interface, or look up the
/// existing one for later interfaces.
pub async fn setup_veth_pair(
    host_ns: &NetNs,
    pod_ns: &NetNs,
    container_id: &str,
    is_first: bool,
) -> Result<VethPair> {
    let host_name = host_veth_name(container_id);
    let host_fd = host_ns.as_raw_fd();
    let name = &host_name;

    let pod = pod_ns
        .run(move || async move {
            let nl = Rtnl::connect()?;
            if is_first {
                info!(pod = POD_VETH_NAME, host = %name, "creating veth pair");
                nl.create_veth(POD_VETH_NAME, name).await?;

                let host_end = nl
                    .link_by_name(name)
                    .await?
                    .ok_or_else(|| Error::LinkNotFound(name.clone()))?;
                nl.set_mtu(host_end.index, VETH_MTU).await?;
                nl.move_to_netns(host_end.index, host_fd).await?;

                let pod_end = nl
                    .link_by_name(POD_VETH_NAME)
                    .await?
                    .ok_or_else(|| Error::LinkNotFound(POD_VETH_NAME.to_string()))?;
                nl.set_mtu(pod_end.index, VETH_MTU).await?;
                nl.set_up(pod_end.index).await?;
            } else {
                debug!("reusing existing {POD_VETH_NAME}");
            }
            nl.link_by_name(POD_VETH_NAME)
                .await?
                .ok_or_else(|| Error::LinkNotFound(POD_VETH_NAME.to_string()))
        })
        .await?;

    let nl = Rtnl::connect()?;
    let host = nl
        .link_by_name(&host_name)
        .await?
        .ok_or_else(|| Error::LinkNotFound(host_name.clone()))?;
    if is_first {
        nl.set_up(host.index).await?;
    }

    let pair = VethPair { host, pod };
    debug!(host = %pair.host.name, host_mac = ?pair.host.mac, pod_mac = ?pair.pod.mac, "veth pair ready");
    Ok(pair)
}

/// Delete the host end of a container's veth pair. A missing link is fine.
pub async fn delete_host_veth(nl: &Rtnl, container_id: &str) -> Result<()> {
    let name = host_veth_name(container_id);
    let Some(link) = nl.link_by_name(&name).await? else {
        debug!(link = %name, "host veth already gone");
        return Ok(());
    };
    match nl.delete_link(link.index).await {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}

/// Add permanent neighbor entries for `ips` pointing at `mac` on `link`.
/// Entries already present are left alone.
pub async fn add_neighbors<N, I>(nl: &N, link: &Link, mac: MacAddr, ips: I) -> Result<()>
where
    N: NetlinkOps + ?Sized,
    I: IntoIterator<Item = IpAddr>,
{
    for ip in ips {
        let neighbor = Neighbor {
            index: link.index,
            ip,
            mac,
        };
        match nl.neighbor_add(&neighbor).await {
            Ok(()) => debug!(dev = %link.name, %ip, %mac, "added neighbor"),
            Err(err) if err.is_exists() => debug!(dev = %link.name, %ip, "neighbor already present"),
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Static neighbors in both directions across the veth pair: the host
/// learns every pod address at the pod end's MAC, the pod learns every
/// host address at the host end's MAC.
pub async fn sync_neighbors<N>(
    host_nl: &N,
    pod_ns: &NetNs,
    pair: &VethPair,
    host_ips: &AddressSet,
    pod_ips: &AddressSet,
) -> Result<()>
where
    N: NetlinkOps + ?Sized,
{
    add_neighbors(host_nl, &pair.host, pair.pod_mac()?, pod_ips.ips()).await?;

    let host_mac = pair.host_mac()?;
    pod_ns
        .run(move || async move {
            let nl = Rtnl::connect()?;
            add_neighbors(&nl, &pair.pod, host_mac, host_ips.ips()).await
        })
        .await
}

/// The overlay CNI's veth: `eth0` in the pod and its peer on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayVeth {
    pub pod: Link,
    pub host: Link,
}

/// Locate the overlay interface in the pod and its peer on the host through
/// the pod end's parent link index.
pub async fn find_overlay_veth<N>(host_nl: &N, pod_ns: &NetNs, overlay_interface: &str) -> Result<OverlayVeth>
where
    N: NetlinkOps + ?Sized,
{
    let pod = pod_ns
        .run(move || async move {
            let nl = Rtnl::connect()?;
            nl.link_by_name(overlay_interface)
                .await?
                .ok_or_else(|| Error::LinkNotFound(overlay_interface.to_string()))
        })
        .await?;
    overlay_host_peer(host_nl, pod).await
}

/// Pair the pod end of the overlay veth with the host link at its parent
/// index. A pod end without a parent is not a veth.
pub async fn overlay_host_peer<N>(host_nl: &N, pod: Link) -> Result<OverlayVeth>
where
    N: NetlinkOps + ?Sized,
{
    let parent_index = pod
        .parent_index
        .filter(|index| *index > 0)
        .ok_or_else(|| Error::LinkNotFound(format!("veth peer of {}", pod.name)))?;
    let host = host_nl
        .link_by_index(parent_index)
        .await?
        .ok_or_else(|| Error::LinkNotFound(format!("index {parent_index}")))?;
    debug!(pod = %pod.name, host = %host.name, "found overlay veth");
    Ok(OverlayVeth { pod, host })
}

/// Static neighbors across the overlay CNI's veth: the pod learns host
/// addresses at the host peer's MAC, the host learns the chained
/// interface's addresses at the overlay interface's MAC.
pub async fn sync_overlay_neighbors<N>(
    host_nl: &N,
    pod_ns: &NetNs,
    overlay: &OverlayVeth,
    host_ips: &AddressSet,
    chained_ips: &AddressSet,
) -> Result<()>
where
    N: NetlinkOps + ?Sized,
{
    let host_peer_mac = link_mac(&overlay.host)?;

    let pod_end = &overlay.pod;
    pod_ns
        .run(move || async move {
            let nl = Rtnl::connect()?;
            add_neighbors(&nl, pod_end, host_peer_mac, host_ips.ips()).await
        })
        .await?;
    add_overlay_host_neighbors(host_nl, overlay, chained_ips).await
}

/// Host half of the overlay neighbor sync: chained addresses resolve to
/// the overlay interface's MAC on the host peer.
pub async fn add_overlay_host_neighbors<N>(host_nl: &N, overlay: &OverlayVeth, chained_ips: &AddressSet) -> Result<()>
where
    N: NetlinkOps + ?Sized,
{
    let overlay_mac = link_mac(&overlay.pod)?;
    add_neighbors(host_nl, &overlay.host, overlay_mac, chained_ips.ips()).await
}

/// MAC built from a two-octet prefix and the last four octets of `ip`
pub fn prefixed_mac(prefix: &str, ip: IpAddr) -> Result<MacAddr> {
    let tail = match ip {
        IpAddr::V4(v4) => v4.octets(),
        IpAddr::V6(v6) => {
            let o = v6.octets();
            [o[12], o[13], o[14], o[15]]
        }
    };
    let text = format!(
        "{prefix}:{:02x}:{:02x}:{:02x}:{:02x}",
        tail[0], tail[1], tail[2], tail[3]
    );
    text.parse::<MacAddr>().map_err(Error::Config)
}

/// Give `ifname` in the pod a MAC derived from its first address
pub async fn overwrite_mac(pod_ns: &NetNs, prefix: &str, ifname: &str) -> Result<MacAddr> {
    pod_ns
        .run(move || async move {
            let nl = Rtnl::connect()?;
            let addrs = inventory::interface_addresses(&nl, ifname, Families::ALL).await?;
            let ip = addrs
                .ips()
                .next()
                .ok_or_else(|| Error::NoAddressFound(ifname.to_string()))?;
            let mac = prefixed_mac(prefix, ip)?;
            let link = nl
                .link_by_name(ifname)
                .await?
                .ok_or_else(|| Error::LinkNotFound(ifname.to_string()))?;
            nl.set_mac(link.index, mac).await?;
            info!(interface = ifname, %mac, "overwrote hardware address");
            Ok(mac)
        })
        .await
}
