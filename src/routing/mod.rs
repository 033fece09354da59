//! Policy Route Manager: rule tables, hijack rules and default-route
//! migration for pods with more than one interface.

use ipnetwork::IpNetwork;
use std::net::IpAddr;
use tracing::{debug, info, warn};

use crate::config::{HijackSubnets, MigrationPolicy};
use crate::error::{Error, Result};
use crate::inventory::AddressSet;
use crate::netlink::{
    host_network, Families, IpFamily, NetlinkOps, RouteEntry, RuleEntry, Scope, MAIN_TABLE,
};

/// Table of the first chained interface, also the target of the migrated
/// default route
pub const OVERLAY_ROUTE_TABLE: u32 = 100;
/// Chained interfaces are named `net<N>`
pub const INTERFACE_PREFIX: &str = "net";
/// Priority of the host-side rule for chained addresses
pub const CHAINED_IP_RULE_PRIORITY: u32 = 1000;

const LINK_LOCAL_V6: &str = "fe80::/64";

fn ordinal(name: &str) -> Option<u32> {
    let digits = name.strip_prefix(INTERFACE_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Rule table for a chained interface: `net<N>` maps to `100 + N - 1`.
/// Any other name has no table.
pub fn allocate_table(name: &str) -> Option<u32> {
    let n = ordinal(name)?;
    (OVERLAY_ROUTE_TABLE + n).checked_sub(1)
}

/// Interface that carried the default route before `name`:
/// `net1` follows the overlay interface, `net<N>` follows `net<N-1>`.
pub fn previous_interface_name(name: &str, overlay: &str) -> Option<String> {
    match ordinal(name)? {
        0 => None,
        1 => Some(overlay.to_string()),
        n => Some(format!("{INTERFACE_PREFIX}{}", n - 1)),
    }
}

/// Whether `current` sorts at or after `previous`. Every interface comes
/// after the overlay interface; otherwise both must be `net<N>` names.
pub fn compare_interface_name(current: &str, previous: &str, overlay: &str) -> bool {
    if previous == overlay {
        return true;
    }
    if !current.starts_with(INTERFACE_PREFIX) || !previous.starts_with(INTERFACE_PREFIX) {
        return false;
    }
    current >= previous
}

/// Network address of `addr` with its prefix
fn network_of(addr: &IpNetwork) -> IpNetwork {
    IpNetwork::new(addr.network(), addr.prefix()).unwrap_or(*addr)
}

/// Add a rule; an identical rule already present is success
pub async fn ensure_rule<N: NetlinkOps + ?Sized>(nl: &N, rule: &RuleEntry) -> Result<()> {
    match nl.rule_add(rule).await {
        Ok(()) => Ok(()),
        Err(err) if err.is_exists() => {
            debug!(table = rule.table, "rule already present");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Add a route; an identical route already present is success
pub async fn ensure_route<N: NetlinkOps + ?Sized>(nl: &N, route: &RouteEntry) -> Result<()> {
    match nl.route_add(route).await {
        Ok(()) => Ok(()),
        Err(err) if err.is_exists() => {
            debug!(table = route.table, dst = ?route.dst, "route already present");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// `to <cidr> lookup <table>` for every CIDR of an enabled family
async fn add_dst_rules<'a, N, I>(nl: &N, cidrs: I, table: u32, families: Families) -> Result<()>
where
    N: NetlinkOps + ?Sized,
    I: IntoIterator<Item = &'a IpNetwork>,
{
    for cidr in cidrs {
        let family = IpFamily::of(&cidr.ip());
        if !families.contains(family) {
            warn!(route = %cidr, %family, "subnet does not match the pod's address families, skipping");
            continue;
        }
        let dst = network_of(cidr);
        debug!(%dst, table, "adding hijack rule");
        ensure_rule(nl, &RuleEntry::to(dst, table)).await?;
    }
    Ok(())
}

/// Steer hijacked destinations into `table`.
///
/// The first chained interface (table 100) takes the service and overlay
/// subnets. Later interfaces take the subnets of the interface before them
/// so replies do not leak out of it. Additional subnets go to every table.
pub async fn hijack_subnets<N>(
    nl: &N,
    table: u32,
    subnets: &HijackSubnets,
    previous: &AddressSet,
    families: Families,
) -> Result<()>
where
    N: NetlinkOps + ?Sized,
{
    info!(table, v4 = families.v4, v6 = families.v6, "hijacking custom subnets");
    if table == OVERLAY_ROUTE_TABLE {
        add_dst_rules(nl, subnets.primary(), table, families).await?;
    } else {
        add_dst_rules(nl, previous.iter(), table, families).await?;
    }
    add_dst_rules(nl, subnets.additional.iter(), table, families).await
}

/// `to <network of addr> lookup <table>` for the pod's own subnets
pub async fn add_to_rules<N>(nl: &N, addrs: &AddressSet, table: u32, families: Families) -> Result<()>
where
    N: NetlinkOps + ?Sized,
{
    for addr in addrs {
        let ip = addr.ip();
        if ip.is_multicast() || !families.contains(IpFamily::of(&ip)) {
            continue;
        }
        ensure_rule(nl, &RuleEntry::to(network_of(addr), table)).await?;
    }
    Ok(())
}

/// `from <addr>/max lookup <table>` so traffic sourced from these
/// addresses stays in `table`
pub async fn add_from_rules<N>(nl: &N, addrs: &AddressSet, table: u32, families: Families) -> Result<()>
where
    N: NetlinkOps + ?Sized,
{
    for ip in addrs.ips() {
        if !families.contains(IpFamily::of(&ip)) {
            continue;
        }
        let rule = RuleEntry::from(host_network(ip), table);
        debug!(src = %ip, table, "adding source rule");
        ensure_rule(nl, &rule).await?;
    }
    Ok(())
}

/// Link-scope host routes to `ips` through `link_index`. Table 100 means
/// the main table here.
pub async fn add_host_routes<N, I>(nl: &N, table: u32, ips: I, link_index: u32) -> Result<()>
where
    N: NetlinkOps + ?Sized,
    I: IntoIterator<Item = IpAddr>,
{
    let table = if table == OVERLAY_ROUTE_TABLE { MAIN_TABLE } else { table };
    for ip in ips {
        debug!(dst = %ip, table, oif = link_index, "adding host route");
        ensure_route(nl, &RouteEntry::host(ip, link_index, table)).await?;
    }
    Ok(())
}

/// Route `subnets` through the host address of the matching family
pub async fn add_subnet_routes<'a, N, I>(
    nl: &N,
    table: u32,
    link_index: u32,
    subnets: I,
    via: &AddressSet,
    families: Families,
) -> Result<()>
where
    N: NetlinkOps + ?Sized,
    I: IntoIterator<Item = &'a IpNetwork>,
{
    for subnet in subnets {
        let family = IpFamily::of(&subnet.ip());
        let gateway = via.get(family).filter(|_| families.contains(family));
        let Some(gateway) = gateway else {
            warn!(route = %subnet, %family, "no gateway of the subnet's family, skipping");
            continue;
        };
        let route = RouteEntry::via(network_of(subnet), gateway, link_index, table);
        debug!(dst = %subnet, gw = %gateway, table, "adding subnet route");
        ensure_route(nl, &route).await?;
    }
    Ok(())
}

/// Host side of an overlay-first pod: for every chained address whose
/// network holds a host address, pin the chained address to the overlay
/// veth peer in `table`.
pub async fn add_chained_ip_routes<N>(
    nl: &N,
    table: u32,
    peer_index: u32,
    host_ips: &AddressSet,
    chained: &AddressSet,
) -> Result<()>
where
    N: NetlinkOps + ?Sized,
{
    for net in chained {
        if !host_ips.ips().any(|ip| net.contains(ip)) {
            continue;
        }
        let family = IpFamily::of(&net.ip());
        ensure_rule(nl, &RuleEntry::all(family, table, CHAINED_IP_RULE_PRIORITY)).await?;
        ensure_route(nl, &RouteEntry::host(net.ip(), peer_index, table)).await?;
        debug!(dst = %net.ip(), oif = peer_index, table, "added chained address route on host");
    }
    Ok(())
}

/// Move the default route of one pod interface out of the main table.
#[derive(Debug, Clone)]
pub struct DefaultRouteMigration<'a> {
    /// Interface whose routes move
    pub link: &'a str,
    /// Name compared against `previous` under `MigrationPolicy::Auto`
    pub current: &'a str,
    pub previous: &'a str,
    /// Addresses pinned to `table` by source rules
    pub addresses: &'a AddressSet,
    pub policy: MigrationPolicy,
    pub table: u32,
    pub families: Families,
    pub overlay_interface: &'a str,
}

impl DefaultRouteMigration<'_> {
    /// Whether the policy asks for a migration
    pub fn wanted(&self) -> bool {
        match self.policy {
            MigrationPolicy::Never => false,
            MigrationPolicy::Enable => true,
            MigrationPolicy::Auto => compare_interface_name(self.current, self.previous, self.overlay_interface),
        }
    }

    pub async fn apply<N: NetlinkOps + ?Sized>(&self, nl: &N) -> Result<()> {
        if !self.wanted() {
            info!(current = self.current, previous = self.previous, policy = ?self.policy, "not migrating default route");
            return Ok(());
        }
        info!(link = self.link, table = self.table, policy = ?self.policy, "migrating default route");

        // Source rules first so replies are pinned before the route moves
        add_from_rules(nl, self.addresses, self.table, self.families).await?;

        let link = nl
            .link_by_name(self.link)
            .await?
            .ok_or_else(|| Error::LinkNotFound(self.link.to_string()))?;

        for family in self.families.iter() {
            self.move_routes(nl, link.index, family).await?;
        }
        Ok(())
    }

    async fn move_routes<N: NetlinkOps + ?Sized>(&self, nl: &N, index: u32, family: IpFamily) -> Result<()> {
        let link_local: Option<IpNetwork> = LINK_LOCAL_V6.parse().ok();
        let routes = nl.routes(family).await?;

        for route in routes {
            if route.table != MAIN_TABLE || (route.dst.is_some() && route.dst == link_local) {
                continue;
            }

            if route.oif == Some(index) {
                if route.is_default() {
                    nl.route_del(&route).await?;
                    debug!(%family, "deleted default route from main table");
                }
                let moved = RouteEntry {
                    table: self.table,
                    ..route
                };
                ensure_route(nl, &moved).await?;
                debug!(dst = ?moved.dst, table = self.table, "route now in rule table");
                continue;
            }

            // ECMP: only the next hop leaving through this link moves
            let Some(hop) = route.multipath.iter().find(|hop| hop.oif == index) else {
                continue;
            };
            let generated = RouteEntry {
                family,
                table: self.table,
                dst: None,
                gateway: hop.gateway,
                oif: Some(hop.oif),
                scope: Scope::Universe,
                priority: None,
                mtu: route.mtu,
                protocol: route.protocol,
                multipath: Vec::new(),
            };
            ensure_route(nl, &generated).await?;

            let deleted = RouteEntry {
                table: MAIN_TABLE,
                mtu: None,
                ..generated
            };
            nl.route_del(&deleted).await?;
            debug!(gw = ?hop.gateway, oif = hop.oif, "moved multipath next hop");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_table() {
        assert_eq!(allocate_table("net1"), Some(100));
        assert_eq!(allocate_table("net2"), Some(101));
        assert_eq!(allocate_table("net10"), Some(109));
        assert_eq!(allocate_table("eth0"), None);
        assert_eq!(allocate_table("ens192"), None);
        assert_eq!(allocate_table("net"), None);
        assert_eq!(allocate_table("net-1"), None);
    }

    #[test]
    fn test_previous_interface_name() {
        assert_eq!(previous_interface_name("net1", "eth0").as_deref(), Some("eth0"));
        assert_eq!(previous_interface_name("net2", "eth0").as_deref(), Some("net1"));
        assert_eq!(previous_interface_name("net1", "ens3").as_deref(), Some("ens3"));
        assert_eq!(previous_interface_name("eth0", "eth0"), None);
    }

    #[test]
    fn test_compare_interface_name() {
        assert!(compare_interface_name("net1", "eth0", "eth0"));
        assert!(!compare_interface_name("eth0", "net1", "eth0"));
        assert!(compare_interface_name("net2", "net1", "eth0"));
        assert!(!compare_interface_name("net1", "net2", "eth0"));
        assert!(compare_interface_name("anything", "eth0", "eth0"));
    }

    #[test]
    fn test_network_of() {
        let addr: IpNetwork = "10.6.1.23/24".parse().unwrap();
        assert_eq!(network_of(&addr).to_string(), "10.6.1.0/24");
    }

    #[test]
    fn test_migration_wanted() {
        let addrs = AddressSet::default();
        let mut migration = DefaultRouteMigration {
            link: "net1",
            current: "net1",
            previous: "net2",
            addresses: &addrs,
            policy: MigrationPolicy::Auto,
            table: 100,
            families: Families::ALL,
            overlay_interface: "eth0",
        };
        assert!(!migration.wanted());
        migration.policy = MigrationPolicy::Enable;
        assert!(migration.wanted());
        migration.policy = MigrationPolicy::Never;
        migration.previous = "eth0";
        assert!(!migration.wanted());
    }
}
