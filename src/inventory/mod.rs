//! Address discovery on the host and inside the pod.

use ipnetwork::IpNetwork;
use itertools::Itertools;
use regex::Regex;
use std::net::IpAddr;
use tracing::debug;

use crate::error::{Error, Result};
use crate::netlink::{Families, IpFamily, NetlinkOps};

/// Host interfaces whose addresses are never used as routing endpoints
pub const DEFAULT_INTERFACES_TO_EXCLUDE: &[&str] = &[
    "docker.*",
    "cbr.*",
    "dummy.*",
    "virbr.*",
    "lxcbr.*",
    "veth.*",
    "lo",
    "cali.*",
    "tunl.*",
    "flannel.*",
    "kube-ipvs.*",
    "cni.*",
];

/// Addresses of one scope, at most one per family
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSet {
    addrs: Vec<IpNetwork>,
}

impl AddressSet {
    /// Keep the first address of each family from `addrs`
    pub fn new<I: IntoIterator<Item = IpNetwork>>(addrs: I) -> Self {
        Self {
            addrs: filter_ips(addrs),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpNetwork> {
        self.addrs.iter()
    }

    pub fn ips(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.addrs.iter().map(|net| net.ip())
    }

    /// The address of `family`, used as a "via" endpoint
    pub fn get(&self, family: IpFamily) -> Option<IpAddr> {
        self.ips().find(|ip| IpFamily::of(ip) == family)
    }

    pub fn families(&self) -> Families {
        Families::from_addrs(self.ips())
    }
}

impl<'a> IntoIterator for &'a AddressSet {
    type Item = &'a IpNetwork;
    type IntoIter = std::slice::Iter<'a, IpNetwork>;

    fn into_iter(self) -> Self::IntoIter {
        self.addrs.iter()
    }
}

/// First IPv4 and first IPv6 address, in order of appearance
pub fn filter_ips<I: IntoIterator<Item = IpNetwork>>(addrs: I) -> Vec<IpNetwork> {
    let mut seen = Families::default();
    let mut kept = Vec::new();
    for addr in addrs {
        let family = IpFamily::of(&addr.ip());
        if seen.contains(family) {
            continue;
        }
        match family {
            IpFamily::V4 => seen.v4 = true,
            IpFamily::V6 => seen.v6 = true,
        }
        kept.push(addr);
    }
    kept
}

/// Compile exclusion patterns into one alternation
pub fn exclusion_regex<S: AsRef<str>>(patterns: &[S]) -> Result<Regex> {
    let alternation = format!(
        "({})",
        patterns.iter().map(|pattern| pattern.as_ref()).join(")|(")
    );
    Regex::new(&alternation).map_err(|e| Error::Config(format!("interface exclusion pattern: {e}")))
}

fn usable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !v4.is_multicast() && !v4.is_link_local(),
        IpAddr::V6(v6) => !v6.is_multicast() && (v6.segments()[0] & 0xffc0) != 0xfe80,
    }
}

/// Representative addresses of the current namespace.
///
/// Interfaces are visited in reverse index order and skipped when their
/// name matches one of `exclude`. Multicast and link-local addresses are
/// ignored; the first match of each enabled family wins.
pub async fn discover_addresses<N, S>(nl: &N, exclude: &[S], families: Families) -> Result<AddressSet>
where
    N: NetlinkOps + ?Sized,
    S: AsRef<str>,
{
    let excluded = exclusion_regex(exclude)?;
    let mut links = nl.links().await?;
    links.sort_by_key(|link| link.index);

    let mut found = Vec::new();
    for link in links.iter().rev() {
        if excluded.is_match(&link.name) {
            continue;
        }
        for addr in nl.addresses(link.index).await? {
            let ip = addr.ip();
            if usable(&ip) && families.contains(IpFamily::of(&ip)) {
                found.push(addr);
            }
        }
    }

    let set = AddressSet::new(found);
    if set.is_empty() {
        return Err(Error::NoAddressFound("the node".into()));
    }
    debug!(addresses = ?set.iter().map(|a| a.to_string()).collect::<Vec<_>>(), "discovered host addresses");
    Ok(set)
}

/// Representative addresses of one named interface
pub async fn interface_addresses<N>(nl: &N, name: &str, families: Families) -> Result<AddressSet>
where
    N: NetlinkOps + ?Sized,
{
    let link = nl
        .link_by_name(name)
        .await?
        .ok_or_else(|| Error::LinkNotFound(name.to_string()))?;
    let addrs = nl
        .addresses(link.index)
        .await?
        .into_iter()
        .filter(|addr| usable(&addr.ip()) && families.contains(IpFamily::of(&addr.ip())));
    let set = AddressSet::new(addrs);
    if set.is_empty() {
        return Err(Error::NoAddressFound(name.to_string()));
    }
    Ok(set)
}

/// Link-local IPv6 address of an interface, used as the NDP probe source
pub async fn link_local_v6<N>(nl: &N, index: u32) -> Result<Option<std::net::Ipv6Addr>>
where
    N: NetlinkOps + ?Sized,
{
    Ok(nl.addresses(index).await?.into_iter().find_map(|addr| match addr.ip() {
        IpAddr::V6(v6) if (v6.segments()[0] & 0xffc0) == 0xfe80 => Some(v6),
        _ => None,
    }))
}
