use async_trait::async_trait;
use futures::TryStreamExt;
use ipnetwork::IpNetwork;
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use netlink_packet_route::neighbour::NeighbourState;
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteMessage, RouteMetric, RouteProtocol,
    RouteScope as NlRouteScope, RouteType,
};
use netlink_packet_route::rule::{RuleAction, RuleAttribute, RuleMessage};
use netlink_packet_route::AddressFamily;
use rtnetlink::{Handle, IpVersion};
use std::io;
use std::net::IpAddr;
use std::os::unix::io::RawFd;
use tracing::debug;

use super::{IpFamily, Link, Neighbor, NetlinkOps, NextHop, RouteEntry, RuleEntry, Scope};
use crate::error::{Error, Result};
use crate::types::MacAddr;

/// rtnetlink connection bound to the namespace it was opened in.
///
/// The socket stays in that namespace for its whole life, so open a new
/// one inside every namespace scope.
pub struct Rtnl {
    handle: Handle,
}

impl Rtnl {
    /// Open a connection in the calling thread's current namespace
    pub fn connect() -> Result<Self> {
        let (connection, handle, _) =
            rtnetlink::new_connection().map_err(|source| Error::Kernel {
                op: "open netlink socket".into(),
                source,
            })?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    /// Create a veth pair in the current namespace
    pub async fn create_veth(&self, name: &str, peer: &str) -> Result<()> {
        debug!(name, peer, "creating veth pair");
        self.handle
            .link()
            .add()
            .veth(name.to_string(), peer.to_string())
            .execute()
            .await
            .map_err(|e| netlink_error(format!("create veth {name}/{peer}"), e))
    }

    pub async fn set_up(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|e| netlink_error(format!("set link {index} up"), e))
    }

    pub async fn set_mtu(&self, index: u32, mtu: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .mtu(mtu)
            .execute()
            .await
            .map_err(|e| netlink_error(format!("set link {index} mtu {mtu}"), e))
    }

    pub async fn set_mac(&self, index: u32, mac: MacAddr) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .address(mac.as_bytes().to_vec())
            .execute()
            .await
            .map_err(|e| netlink_error(format!("set link {index} address {mac}"), e))
    }

    /// Move a link into the namespace behind `netns_fd`
    pub async fn move_to_netns(&self, index: u32, netns_fd: RawFd) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .setns_by_fd(netns_fd)
            .execute()
            .await
            .map_err(|e| netlink_error(format!("move link {index} to namespace"), e))
    }

    pub async fn delete_link(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| netlink_error(format!("delete link {index}"), e))
    }
}

#[async_trait]
impl NetlinkOps for Rtnl {
    async fn links(&self) -> Result<Vec<Link>> {
        let messages: Vec<LinkMessage> = self
            .handle
            .link()
            .get()
            .execute()
            .try_collect()
            .await
            .map_err(|e| netlink_error("list links", e))?;
        Ok(messages.iter().map(link_from_message).collect())
    }

    async fn link_by_name(&self, name: &str) -> Result<Option<Link>> {
        let found: std::result::Result<Vec<LinkMessage>, _> = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute()
            .try_collect()
            .await;
        absent_if_not_found(found.map_err(|e| netlink_error(format!("get link {name}"), e)))
    }

    async fn link_by_index(&self, index: u32) -> Result<Option<Link>> {
        let found: std::result::Result<Vec<LinkMessage>, _> = self
            .handle
            .link()
            .get()
            .match_index(index)
            .execute()
            .try_collect()
            .await;
        absent_if_not_found(found.map_err(|e| netlink_error(format!("get link {index}"), e)))
    }

    async fn addresses(&self, index: u32) -> Result<Vec<IpNetwork>> {
        let messages: Vec<AddressMessage> = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute()
            .try_collect()
            .await
            .map_err(|e| netlink_error(format!("list addresses of link {index}"), e))?;
        Ok(messages.iter().filter_map(address_from_message).collect())
    }

    async fn neighbor_add(&self, neighbor: &Neighbor) -> Result<()> {
        self.handle
            .neighbours()
            .add(neighbor.index, neighbor.ip)
            .link_local_address(neighbor.mac.as_bytes())
            .state(NeighbourState::Permanent)
            .execute()
            .await
            .map_err(|e| {
                netlink_error(
                    format!("add neighbor {} lladdr {} dev {}", neighbor.ip, neighbor.mac, neighbor.index),
                    e,
                )
            })
    }

    async fn routes(&self, family: IpFamily) -> Result<Vec<RouteEntry>> {
        let version = match family {
            IpFamily::V4 => IpVersion::V4,
            IpFamily::V6 => IpVersion::V6,
        };
        let messages: Vec<RouteMessage> = self
            .handle
            .route()
            .get(version)
            .execute()
            .try_collect()
            .await
            .map_err(|e| netlink_error(format!("list {family} routes"), e))?;
        Ok(messages.iter().map(route_from_message).collect())
    }

    async fn route_add(&self, route: &RouteEntry) -> Result<()> {
        let mut request = self.handle.route().add();
        *request.message_mut() = route_message(route, false);
        request
            .execute()
            .await
            .map_err(|e| netlink_error(format!("add route {}", describe_route(route)), e))
    }

    async fn route_del(&self, route: &RouteEntry) -> Result<()> {
        self.handle
            .route()
            .del(route_message(route, true))
            .execute()
            .await
            .map_err(|e| netlink_error(format!("delete route {}", describe_route(route)), e))
    }

    async fn rule_add(&self, rule: &RuleEntry) -> Result<()> {
        let mut request = self.handle.rule().add();
        *request.message_mut() = rule_message(rule);
        request
            .execute()
            .await
            .map_err(|e| netlink_error(format!("add rule {}", describe_rule(rule)), e))
    }
}

/// Keep the kernel errno so callers can tell EEXIST/ENOENT apart.
fn netlink_error(op: impl Into<String>, err: rtnetlink::Error) -> Error {
    let source = match &err {
        rtnetlink::Error::NetlinkError(message) if message.raw_code() != 0 => {
            io::Error::from_raw_os_error(-message.raw_code())
        }
        _ => io::Error::other(err.to_string()),
    };
    Error::Kernel {
        op: op.into(),
        source,
    }
}

fn absent_if_not_found(found: Result<Vec<LinkMessage>>) -> Result<Option<Link>> {
    match found {
        Ok(messages) => Ok(messages.first().map(link_from_message)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

fn link_from_message(message: &LinkMessage) -> Link {
    let mut link = Link {
        index: message.header.index,
        name: String::new(),
        mac: None,
        parent_index: None,
        mtu: None,
    };
    for attribute in &message.attributes {
        match attribute {
            LinkAttribute::IfName(name) => link.name = name.clone(),
            LinkAttribute::Address(bytes) => link.mac = MacAddr::from_slice(bytes),
            LinkAttribute::Link(parent) => link.parent_index = Some(*parent),
            LinkAttribute::Mtu(mtu) => link.mtu = Some(*mtu),
            _ => {}
        }
    }
    link
}

fn address_from_message(message: &AddressMessage) -> Option<IpNetwork> {
    // IFA_ADDRESS is the peer on point-to-point links; prefer IFA_LOCAL there.
    let mut address = None;
    let mut local = None;
    for attribute in &message.attributes {
        match attribute {
            AddressAttribute::Address(ip) => address = Some(*ip),
            AddressAttribute::Local(ip) => local = Some(*ip),
            _ => {}
        }
    }
    let ip = local.or(address)?;
    IpNetwork::new(ip, message.header.prefix_len).ok()
}

fn route_address_ip(address: &RouteAddress) -> Option<IpAddr> {
    match address {
        RouteAddress::Inet(v4) => Some(IpAddr::V4(*v4)),
        RouteAddress::Inet6(v6) => Some(IpAddr::V6(*v6)),
        _ => None,
    }
}

fn route_address(ip: IpAddr) -> RouteAddress {
    match ip {
        IpAddr::V4(v4) => RouteAddress::Inet(v4),
        IpAddr::V6(v6) => RouteAddress::Inet6(v6),
    }
}

fn address_family(family: IpFamily) -> AddressFamily {
    match family {
        IpFamily::V4 => AddressFamily::Inet,
        IpFamily::V6 => AddressFamily::Inet6,
    }
}

fn route_from_message(message: &RouteMessage) -> RouteEntry {
    let header = &message.header;
    let family = if header.address_family == AddressFamily::Inet6 {
        IpFamily::V6
    } else {
        IpFamily::V4
    };
    let mut route = RouteEntry {
        family,
        table: u32::from(header.table),
        dst: None,
        gateway: None,
        oif: None,
        scope: match header.scope {
            NlRouteScope::Link => Scope::Link,
            NlRouteScope::Host => Scope::Host,
            _ => Scope::Universe,
        },
        priority: None,
        mtu: None,
        protocol: u8::from(header.protocol),
        multipath: Vec::new(),
    };

    for attribute in &message.attributes {
        match attribute {
            RouteAttribute::Table(table) => route.table = *table,
            RouteAttribute::Destination(address) => {
                route.dst = route_address_ip(address)
                    .and_then(|ip| IpNetwork::new(ip, header.destination_prefix_length).ok());
            }
            RouteAttribute::Gateway(address) => route.gateway = route_address_ip(address),
            RouteAttribute::Oif(index) => route.oif = Some(*index),
            RouteAttribute::Priority(priority) => route.priority = Some(*priority),
            RouteAttribute::Metrics(metrics) => {
                route.mtu = metrics.iter().find_map(|metric| match metric {
                    RouteMetric::Mtu(mtu) => Some(*mtu),
                    _ => None,
                });
            }
            RouteAttribute::MultiPath(hops) => {
                route.multipath = hops
                    .iter()
                    .map(|hop| NextHop {
                        oif: hop.interface_index,
                        gateway: hop.attributes.iter().find_map(|attribute| match attribute {
                            RouteAttribute::Gateway(address) => route_address_ip(address),
                            _ => None,
                        }),
                        weight: hop.hops,
                    })
                    .collect();
            }
            _ => {}
        }
    }
    route
}

/// Delete requests leave protocol, type and scope unspecified so the
/// kernel matches on destination, table, gateway, device and metric only.
fn route_message(route: &RouteEntry, for_delete: bool) -> RouteMessage {
    let mut message = RouteMessage::default();
    let header = &mut message.header;
    header.address_family = address_family(route.family);
    header.destination_prefix_length = route.dst.map_or(0, |dst| dst.prefix());
    header.table = u8::try_from(route.table).unwrap_or(0);
    if for_delete {
        header.protocol = RouteProtocol::Unspec;
        header.scope = NlRouteScope::NoWhere;
        header.kind = RouteType::Unspec;
    } else {
        header.protocol = RouteProtocol::from(route.protocol);
        header.scope = match route.scope {
            Scope::Universe => NlRouteScope::Universe,
            Scope::Link => NlRouteScope::Link,
            Scope::Host => NlRouteScope::Host,
        };
        header.kind = RouteType::Unicast;
    }

    let attributes = &mut message.attributes;
    attributes.push(RouteAttribute::Table(route.table));
    if let Some(dst) = route.dst.filter(|dst| dst.prefix() > 0) {
        attributes.push(RouteAttribute::Destination(route_address(dst.ip())));
    }
    if let Some(gateway) = route.gateway {
        attributes.push(RouteAttribute::Gateway(route_address(gateway)));
    }
    if let Some(oif) = route.oif {
        attributes.push(RouteAttribute::Oif(oif));
    }
    if let Some(priority) = route.priority {
        attributes.push(RouteAttribute::Priority(priority));
    }
    if let Some(mtu) = route.mtu.filter(|_| !for_delete) {
        attributes.push(RouteAttribute::Metrics(vec![RouteMetric::Mtu(mtu)]));
    }
    message
}

fn rule_message(rule: &RuleEntry) -> RuleMessage {
    let mut message = RuleMessage::default();
    message.header.family = address_family(rule.family);
    message.header.action = RuleAction::ToTable;
    message.header.table = u8::try_from(rule.table).unwrap_or(0);
    message.attributes.push(RuleAttribute::Table(rule.table));
    if let Some(priority) = rule.priority {
        message.attributes.push(RuleAttribute::Priority(priority));
    }
    if let Some(dst) = rule.dst {
        message.header.dst_len = dst.prefix();
        message.attributes.push(RuleAttribute::Destination(dst.ip()));
    }
    if let Some(src) = rule.src {
        message.header.src_len = src.prefix();
        message.attributes.push(RuleAttribute::Source(src.ip()));
    }
    message
}

fn describe_route(route: &RouteEntry) -> String {
    let mut text = match route.dst {
        Some(dst) if !route.is_default() => dst.to_string(),
        _ => "default".to_string(),
    };
    if let Some(gateway) = route.gateway {
        text.push_str(&format!(" via {gateway}"));
    }
    if let Some(oif) = route.oif {
        text.push_str(&format!(" dev {oif}"));
    }
    text.push_str(&format!(" table {}", route.table));
    text
}

fn describe_rule(rule: &RuleEntry) -> String {
    let from = rule.src.map_or("all".to_string(), |src| src.to_string());
    let mut text = format!("from {from}");
    if let Some(dst) = rule.dst {
        text.push_str(&format!(" to {dst}"));
    }
    text.push_str(&format!(" lookup {}", rule.table));
    if let Some(priority) = rule.priority {
        text.push_str(&format!(" priority {priority}"));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_message_round_trip_keeps_identity() {
        let route = RouteEntry::host("10.1.2.3".parse().unwrap(), 4, 101);
        let parsed = route_from_message(&route_message(&route, false));
        assert_eq!(parsed.dst, route.dst);
        assert_eq!(parsed.oif, Some(4));
        assert_eq!(parsed.table, 101);
        assert_eq!(parsed.scope, Scope::Link);
        assert_eq!(parsed.protocol, crate::netlink::RTPROT_STATIC);
    }

    #[test]
    fn test_route_message_keeps_protocol() {
        let mut route = RouteEntry::via("0.0.0.0/0".parse().unwrap(), "10.7.0.1".parse().unwrap(), 3, 101);
        route.dst = None;
        route.protocol = u8::from(RouteProtocol::Dhcp);
        let message = route_message(&route, false);
        assert_eq!(u8::from(message.header.protocol), u8::from(RouteProtocol::Dhcp));
        assert_eq!(route_from_message(&message).protocol, u8::from(RouteProtocol::Dhcp));
    }

    #[test]
    fn test_default_route_has_no_destination() {
        let mut route = RouteEntry::via(
            "0.0.0.0/0".parse().unwrap(),
            "192.168.1.1".parse().unwrap(),
            3,
            100,
        );
        route.dst = None;
        let message = route_message(&route, true);
        assert_eq!(message.header.destination_prefix_length, 0);
        assert!(!message
            .attributes
            .iter()
            .any(|attribute| matches!(attribute, RouteAttribute::Destination(_))));
        assert!(route_from_message(&message).is_default());
    }

    #[test]
    fn test_rule_description() {
        let rule = RuleEntry::to("10.96.0.0/12".parse().unwrap(), 100);
        assert_eq!(describe_rule(&rule), "from all to 10.96.0.0/12 lookup 100");
        let rule = RuleEntry::all(IpFamily::V4, 500, 1000);
        assert_eq!(describe_rule(&rule), "from all lookup 500 priority 1000");
    }
}
