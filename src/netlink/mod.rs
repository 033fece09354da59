//! Kernel routing state as seen by the wiring engine.
//!
//! `NetlinkOps` is the seam between the routing logic and the kernel. `Rtnl`
//! talks rtnetlink; tests drive the same logic against an in-memory table.

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use std::fmt;
use std::net::IpAddr;

use crate::error::Result;
use crate::types::MacAddr;

mod rtnl;

pub use rtnl::Rtnl;

/// Kernel main routing table
pub const MAIN_TABLE: u32 = 254;
/// Protocol of routes this crate installs
pub const RTPROT_STATIC: u8 = libc::RTPROT_STATIC;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    /// Prefix length of a single-host network
    pub fn max_prefix(self) -> u8 {
        match self {
            IpFamily::V4 => 32,
            IpFamily::V6 => 128,
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => f.write_str("ipv4"),
            IpFamily::V6 => f.write_str("ipv6"),
        }
    }
}

/// Address families enabled for one invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Families {
    pub v4: bool,
    pub v6: bool,
}

impl Families {
    pub const ALL: Families = Families { v4: true, v6: true };

    /// Families present among `addrs`
    pub fn from_addrs<I: IntoIterator<Item = IpAddr>>(addrs: I) -> Self {
        addrs.into_iter().fold(Families::default(), |mut families, ip| {
            match ip {
                IpAddr::V4(_) => families.v4 = true,
                IpAddr::V6(_) => families.v6 = true,
            }
            families
        })
    }

    pub fn contains(&self, family: IpFamily) -> bool {
        match family {
            IpFamily::V4 => self.v4,
            IpFamily::V6 => self.v6,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = IpFamily> {
        let families = *self;
        [IpFamily::V4, IpFamily::V6]
            .into_iter()
            .filter(move |family| families.contains(*family))
    }
}

/// Single-host network for `ip` (`/32` or `/128`)
pub fn host_network(ip: IpAddr) -> IpNetwork {
    IpNetwork::from(ip)
}

/// A network device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub mac: Option<MacAddr>,
    /// IFLA_LINK: for a veth, the peer's index in the peer's namespace
    pub parent_index: Option<u32>,
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    #[default]
    Universe,
    Link,
    Host,
}

/// One leg of a multipath route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextHop {
    pub oif: u32,
    pub gateway: Option<IpAddr>,
    pub weight: u8,
}

/// A route in one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub family: IpFamily,
    pub table: u32,
    /// `None` for the default route
    pub dst: Option<IpNetwork>,
    pub gateway: Option<IpAddr>,
    pub oif: Option<u32>,
    pub scope: Scope,
    pub priority: Option<u32>,
    pub mtu: Option<u32>,
    /// `rtm_protocol`: who installed the route (`RTPROT_*`)
    pub protocol: u8,
    /// Next hops of an ECMP route; empty for single-path routes
    pub multipath: Vec<NextHop>,
}

impl RouteEntry {
    /// Link-scope route to one address through `oif`
    pub fn host(ip: IpAddr, oif: u32, table: u32) -> Self {
        Self {
            family: IpFamily::of(&ip),
            table,
            dst: Some(host_network(ip)),
            gateway: None,
            oif: Some(oif),
            scope: Scope::Link,
            priority: None,
            mtu: None,
            protocol: RTPROT_STATIC,
            multipath: Vec::new(),
        }
    }

    /// Route to `dst` through a gateway on `oif`
    pub fn via(dst: IpNetwork, gateway: IpAddr, oif: u32, table: u32) -> Self {
        Self {
            family: IpFamily::of(&dst.ip()),
            table,
            dst: Some(dst),
            gateway: Some(gateway),
            oif: Some(oif),
            scope: Scope::Universe,
            priority: None,
            mtu: None,
            protocol: RTPROT_STATIC,
            multipath: Vec::new(),
        }
    }

    pub fn is_default(&self) -> bool {
        self.dst.map_or(true, |dst| dst.prefix() == 0)
    }

    /// Whether the route leaves through `index`, directly or by any next hop
    pub fn uses_link(&self, index: u32) -> bool {
        self.oif == Some(index) || self.multipath.iter().any(|hop| hop.oif == index)
    }
}

/// A policy routing rule selecting `table`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleEntry {
    pub family: IpFamily,
    pub table: u32,
    pub priority: Option<u32>,
    pub src: Option<IpNetwork>,
    pub dst: Option<IpNetwork>,
}

impl RuleEntry {
    /// `to <dst> lookup <table>`
    pub fn to(dst: IpNetwork, table: u32) -> Self {
        Self {
            family: IpFamily::of(&dst.ip()),
            table,
            priority: None,
            src: None,
            dst: Some(dst),
        }
    }

    /// `from <src> lookup <table>`
    pub fn from(src: IpNetwork, table: u32) -> Self {
        Self {
            family: IpFamily::of(&src.ip()),
            table,
            priority: None,
            src: Some(src),
            dst: None,
        }
    }

    /// `from all lookup <table>` at `priority`
    pub fn all(family: IpFamily, table: u32, priority: u32) -> Self {
        Self {
            family,
            table,
            priority: Some(priority),
            src: None,
            dst: None,
        }
    }
}

/// A static neighbor entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub index: u32,
    pub ip: IpAddr,
    pub mac: MacAddr,
}

/// Routing, rule, neighbor and link queries against one network namespace
#[async_trait]
pub trait NetlinkOps: Send + Sync {
    async fn links(&self) -> Result<Vec<Link>>;
    /// `Ok(None)` when no link has that name
    async fn link_by_name(&self, name: &str) -> Result<Option<Link>>;
    async fn link_by_index(&self, index: u32) -> Result<Option<Link>>;
    /// Addresses configured on a link, with their prefix
    async fn addresses(&self, index: u32) -> Result<Vec<IpNetwork>>;
    /// Add a permanent neighbor entry. Fails with EEXIST when present.
    async fn neighbor_add(&self, neighbor: &Neighbor) -> Result<()>;
    /// Routes of one family across all tables
    async fn routes(&self, family: IpFamily) -> Result<Vec<RouteEntry>>;
    /// Fails with EEXIST when an identical route is present
    async fn route_add(&self, route: &RouteEntry) -> Result<()>;
    async fn route_del(&self, route: &RouteEntry) -> Result<()>;
    /// Fails with EEXIST when an identical rule is present
    async fn rule_add(&self, rule: &RuleEntry) -> Result<()>;
}
