// In-memory kernel used by the routing and inventory tests.
#![allow(dead_code)]

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use std::collections::HashMap;
use std::sync::Mutex;

use chaincni::netlink::{IpFamily, Link, Neighbor, NetlinkOps, NextHop, RouteEntry, RuleEntry, Scope, MAIN_TABLE, RTPROT_STATIC};
use chaincni::types::MacAddr;
use chaincni::{Error, Result};

#[derive(Debug, Default)]
struct State {
    links: Vec<Link>,
    addrs: HashMap<u32, Vec<IpNetwork>>,
    neighbors: Vec<Neighbor>,
    routes: Vec<RouteEntry>,
    rules: Vec<RuleEntry>,
}

/// One network namespace worth of links, addresses, routes and rules
#[derive(Debug, Default)]
pub struct FakeKernel {
    state: Mutex<State>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_link(self, index: u32, name: &str, addrs: &[&str]) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.links.push(Link {
                index,
                name: name.to_string(),
                mac: Some(MacAddr([0x02, 0, 0, 0, 0, index as u8])),
                parent_index: None,
                mtu: Some(1500),
            });
            state
                .addrs
                .insert(index, addrs.iter().map(|a| a.parse().unwrap()).collect());
        }
        self
    }

    pub fn with_route(self, route: RouteEntry) -> Self {
        self.state.lock().unwrap().routes.push(route);
        self
    }

    pub fn routes_in(&self, table: u32) -> Vec<RouteEntry> {
        let state = self.state.lock().unwrap();
        state.routes.iter().filter(|r| r.table == table).cloned().collect()
    }

    pub fn all_routes(&self) -> Vec<RouteEntry> {
        self.state.lock().unwrap().routes.clone()
    }

    pub fn rules(&self) -> Vec<RuleEntry> {
        self.state.lock().unwrap().rules.clone()
    }

    pub fn neighbors(&self) -> Vec<Neighbor> {
        self.state.lock().unwrap().neighbors.clone()
    }
}

/// Default route through `gateway` on `oif` in the main table
pub fn default_route(gateway: &str, oif: u32) -> RouteEntry {
    let gateway: std::net::IpAddr = gateway.parse().unwrap();
    RouteEntry {
        family: IpFamily::of(&gateway),
        table: MAIN_TABLE,
        dst: None,
        gateway: Some(gateway),
        oif: Some(oif),
        scope: Scope::Universe,
        priority: None,
        mtu: None,
        protocol: RTPROT_STATIC,
        multipath: Vec::new(),
    }
}

/// Link-scope subnet route on `oif` in the main table
pub fn link_route(dst: &str, oif: u32) -> RouteEntry {
    let dst: IpNetwork = dst.parse().unwrap();
    RouteEntry {
        family: IpFamily::of(&dst.ip()),
        table: MAIN_TABLE,
        dst: Some(dst),
        gateway: None,
        oif: Some(oif),
        scope: Scope::Link,
        priority: None,
        mtu: None,
        protocol: RTPROT_STATIC,
        multipath: Vec::new(),
    }
}

/// IPv6 ECMP default route in the main table
pub fn ecmp_default(hops: &[(u32, &str)]) -> RouteEntry {
    RouteEntry {
        family: IpFamily::V6,
        table: MAIN_TABLE,
        dst: None,
        gateway: None,
        oif: None,
        scope: Scope::Universe,
        priority: None,
        mtu: Some(1500),
        protocol: u8::from(netlink_packet_route::route::RouteProtocol::Ra),
        multipath: hops
            .iter()
            .map(|(oif, gw)| NextHop {
                oif: *oif,
                gateway: Some(gw.parse().unwrap()),
                weight: 1,
            })
            .collect(),
    }
}

fn same_destination(a: &RouteEntry, b: &RouteEntry) -> bool {
    a.family == b.family && a.table == b.table && a.dst == b.dst && a.priority == b.priority
}

#[async_trait]
impl NetlinkOps for FakeKernel {
    async fn links(&self) -> Result<Vec<Link>> {
        Ok(self.state.lock().unwrap().links.clone())
    }

    async fn link_by_name(&self, name: &str) -> Result<Option<Link>> {
        let state = self.state.lock().unwrap();
        Ok(state.links.iter().find(|l| l.name == name).cloned())
    }

    async fn link_by_index(&self, index: u32) -> Result<Option<Link>> {
        let state = self.state.lock().unwrap();
        Ok(state.links.iter().find(|l| l.index == index).cloned())
    }

    async fn addresses(&self, index: u32) -> Result<Vec<IpNetwork>> {
        let state = self.state.lock().unwrap();
        Ok(state.addrs.get(&index).cloned().unwrap_or_default())
    }

    async fn neighbor_add(&self, neighbor: &Neighbor) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state
            .neighbors
            .iter()
            .any(|n| n.index == neighbor.index && n.ip == neighbor.ip)
        {
            return Err(Error::kernel("add neighbor", libc::EEXIST));
        }
        state.neighbors.push(neighbor.clone());
        Ok(())
    }

    async fn routes(&self, family: IpFamily) -> Result<Vec<RouteEntry>> {
        let state = self.state.lock().unwrap();
        Ok(state.routes.iter().filter(|r| r.family == family).cloned().collect())
    }

    async fn route_add(&self, route: &RouteEntry) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.routes.iter().any(|r| same_destination(r, route)) {
            return Err(Error::kernel("add route", libc::EEXIST));
        }
        state.routes.push(route.clone());
        Ok(())
    }

    async fn route_del(&self, route: &RouteEntry) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let matches_hop = |hop: &NextHop| {
            route.oif.map_or(true, |oif| oif == hop.oif)
                && (route.gateway.is_none() || route.gateway == hop.gateway)
        };

        let Some(pos) = state.routes.iter().position(|r| {
            same_destination(r, route)
                && if r.multipath.is_empty() {
                    route.oif.map_or(true, |oif| r.oif == Some(oif))
                        && (route.gateway.is_none() || route.gateway == r.gateway)
                } else {
                    r.multipath.iter().any(|hop| matches_hop(hop))
                }
        }) else {
            return Err(Error::kernel("delete route", libc::ESRCH));
        };

        let existing = &mut state.routes[pos];
        if existing.multipath.is_empty() {
            state.routes.remove(pos);
        } else {
            existing.multipath.retain(|hop| !matches_hop(hop));
            if existing.multipath.is_empty() {
                state.routes.remove(pos);
            }
        }
        Ok(())
    }

    async fn rule_add(&self, rule: &RuleEntry) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.rules.contains(rule) {
            return Err(Error::kernel("add rule", libc::EEXIST));
        }
        state.rules.push(rule.clone());
        Ok(())
    }
}
