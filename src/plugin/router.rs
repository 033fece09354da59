use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, info, Instrument};

use super::{add_prelude, host_addresses, invocation_span, pod_addresses, AddContext, ChainedPlugin, Prelude};
use crate::config::PluginConf;
use crate::inventory::AddressSet;
use crate::logging;
use crate::netlink::{NetlinkOps, Rtnl};
use crate::netns::NetNs;
use crate::provision;
use crate::routing::{self, DefaultRouteMigration};
use crate::sysctl;
use crate::types::CmdArgs;

/// Routes a macvlan interface alongside the overlay CNI's `eth0`
pub struct RouterPlugin {
    /// Network configuration
    conf: PluginConf,
    /// Command arguments
    args: CmdArgs,
}

#[async_trait(?Send)]
impl ChainedPlugin for RouterPlugin {
    const NAME: &'static str = "router";
    const LOG_FILE: &'static str = logging::ROUTER_LOG_FILE;

    fn new(conf: PluginConf, args: CmdArgs) -> Self {
        Self { conf, args }
    }

    async fn add_network(&self) -> Result<Value> {
        let span = invocation_span("add", Self::NAME, &self.args);
        self.add().instrument(span).await
    }

    async fn del_network(&self) -> Result<()> {
        // Routes and rules go away with the pod's namespace
        Ok(())
    }

    async fn check_network(&self) -> Result<()> {
        let span = invocation_span("check", Self::NAME, &self.args);
        async {
            let pod_ns = NetNs::open(&self.args.netns)?;
            let ifname = self.args.ifname.as_str();
            let present = pod_ns
                .run(move || async move {
                    let nl = Rtnl::connect()?;
                    Ok(nl.link_by_name(ifname).await?.is_some())
                })
                .await?;
            if !present {
                bail!("{ifname} not found in the pod");
            }
            Ok(())
        }
        .instrument(span)
        .await
    }
}

impl RouterPlugin {
    async fn add(&self) -> Result<Value> {
        let started = Instant::now();
        let ctx = match add_prelude(&self.conf, &self.args).await? {
            Prelude::Done(result) => return Ok(result),
            Prelude::Continue(ctx) => ctx,
        };
        debug!(prev = ?ctx.prev, "previous result");

        let host_nl = Rtnl::connect()?;
        let host_ips = host_addresses(&host_nl, ctx.families).await?;
        let chained_ips = pod_addresses(&ctx.pod_ns, &self.args.ifname, ctx.families).await?;

        if ctx.families.v6 {
            sysctl::enable_ipv6(&ctx.pod_ns).await.context("failed to enable ipv6 in the pod")?;
        }

        let table = routing::allocate_table(&ctx.chained)
            .with_context(|| format!("failed to get the number of rule table for interface {}", ctx.chained))?;

        // Step 1: overlay veth wiring, skipped for SR-IOV
        if self.conf.sriov {
            info!("main CNI is sriov, skipping overlay veth wiring");
        } else {
            self.wire_overlay(&ctx, &host_nl, table, &host_ips, &chained_ips).await?;
        }

        // Step 2: hijack rules and default route migration
        let overlay = self.conf.overlay_interface.as_str();
        let previous = routing::previous_interface_name(&ctx.chained, overlay)
            .with_context(|| format!("no interface precedes {}", ctx.chained))?;
        let previous_ips = pod_addresses(&ctx.pod_ns, &previous, ctx.families).await?;

        let subnets = &self.conf.subnets;
        let families = ctx.families;
        let previous_ips = &previous_ips;
        ctx.pod_ns
            .run(move || async move {
                let nl = Rtnl::connect()?;
                routing::hijack_subnets(&nl, table, subnets, previous_ips, families).await
            })
            .await
            .context("failed to hijack custom subnets")?;

        let migration = DefaultRouteMigration {
            link: &previous,
            current: &ctx.chained,
            previous: &previous,
            addresses: previous_ips,
            policy: self.conf.migrate_route,
            table,
            families,
            overlay_interface: overlay,
        };
        let migration = &migration;
        ctx.pod_ns
            .run(move || async move {
                let nl = Rtnl::connect()?;
                migration.apply(&nl).await
            })
            .await
            .context("failed to migrate default route")?;

        sysctl::apply_rp_filter(&ctx.pod_ns, self.conf.rp_filter())
            .await
            .context("failed to set rp_filter")?;

        info!(
            interface = %ctx.chained,
            elapsed_us = started.elapsed().as_micros() as u64,
            "succeeded to set up chained interface for overlay interface"
        );
        Ok(super::passthrough(&self.conf))
    }

    async fn wire_overlay(
        &self,
        ctx: &AddContext,
        host_nl: &Rtnl,
        table: u32,
        host_ips: &AddressSet,
        chained_ips: &AddressSet,
    ) -> Result<()> {
        let overlay = provision::find_overlay_veth(host_nl, &ctx.pod_ns, &self.conf.overlay_interface)
            .await
            .context("failed to find the overlay veth")?;

        provision::sync_overlay_neighbors(host_nl, &ctx.pod_ns, &overlay, host_ips, chained_ips)
            .await
            .context("failed to add neighbor entries")?;

        routing::add_chained_ip_routes(host_nl, self.conf.host_rule_table, overlay.host.index, host_ips, chained_ips)
            .await
            .context("failed to add route for underlay interface on the host")?;

        let overlay_index = overlay.pod.index;
        ctx.pod_ns
            .run(move || async move {
                let nl = Rtnl::connect()?;
                routing::add_host_routes(&nl, table, host_ips.ips(), overlay_index).await
            })
            .await
            .context("failed to add host ip route in the pod")?;
        Ok(())
    }
}
