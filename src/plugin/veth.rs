use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, info, Instrument};

use super::{add_prelude, host_addresses, invocation_span, pod_addresses, AddContext, ChainedPlugin, Prelude};
use crate::config::PluginConf;
use crate::inventory::AddressSet;
use crate::logging;
use crate::netlink::{NetlinkOps, Rtnl, MAIN_TABLE};
use crate::netns::NetNs;
use crate::provision::{self, VethPair, POD_VETH_NAME};
use crate::routing::{self, DefaultRouteMigration};
use crate::sysctl;
use crate::types::CmdArgs;

/// Connects the pod to the host through `veth0`, for pods whose first
/// interface comes from macvlan
pub struct VethPlugin {
    /// Network configuration
    conf: PluginConf,
    /// Command arguments
    args: CmdArgs,
}

#[async_trait(?Send)]
impl ChainedPlugin for VethPlugin {
    const NAME: &'static str = "veth";
    const LOG_FILE: &'static str = logging::VETH_LOG_FILE;

    fn new(conf: PluginConf, args: CmdArgs) -> Self {
        Self { conf, args }
    }

    async fn add_network(&self) -> Result<Value> {
        let span = invocation_span("add", Self::NAME, &self.args);
        self.add().instrument(span).await
    }

    async fn del_network(&self) -> Result<()> {
        let span = invocation_span("del", Self::NAME, &self.args);
        async {
            let nl = Rtnl::connect()?;
            provision::delete_host_veth(&nl, &self.args.container_id)
                .await
                .with_context(|| format!("failed to delete {}", provision::host_veth_name(&self.args.container_id)))?;
            info!("host veth removed");
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn check_network(&self) -> Result<()> {
        let span = invocation_span("check", Self::NAME, &self.args);
        async {
            let pod_ns = NetNs::open(&self.args.netns)?;
            if provision::pod_veth_missing(&pod_ns).await? {
                bail!("{POD_VETH_NAME} not found in the pod");
            }
            let host_name = provision::host_veth_name(&self.args.container_id);
            let nl = Rtnl::connect()?;
            if nl.link_by_name(&host_name).await?.is_none() {
                bail!("{host_name} not found on the host");
            }
            Ok(())
        }
        .instrument(span)
        .await
    }
}

impl VethPlugin {
    async fn add(&self) -> Result<Value> {
        let started = Instant::now();
        let ctx = match add_prelude(&self.conf, &self.args).await? {
            Prelude::Done(result) => return Ok(result),
            Prelude::Continue(ctx) => ctx,
        };
        debug!(prev = ?ctx.prev, "previous result");

        // Step 1: create or find the veth pair
        let is_first = provision::pod_veth_missing(&ctx.pod_ns)
            .await
            .context("failed to check first veth interface")?;
        info!(is_first, chained = %ctx.chained, "wiring chained interface");
        let host_ns = NetNs::current()?;
        let pair = provision::setup_veth_pair(&host_ns, &ctx.pod_ns, &self.args.container_id, is_first)
            .await
            .context("failed to set up veth pair")?;

        // Step 2: addresses on both sides
        let host_nl = Rtnl::connect()?;
        let host_ips = host_addresses(&host_nl, ctx.families).await?;
        let pod_ips = pod_addresses(&ctx.pod_ns, &ctx.chained, ctx.families).await?;

        if ctx.families.v6 {
            sysctl::enable_ipv6(&ctx.pod_ns).await.context("failed to enable ipv6 in the pod")?;
        }

        // Step 3: static neighbors
        provision::sync_neighbors(&host_nl, &ctx.pod_ns, &pair, &host_ips, &pod_ips)
            .await
            .context("failed to add neighbor entries")?;

        // Step 4: routes and rules
        let table = if is_first {
            MAIN_TABLE
        } else {
            routing::allocate_table(&ctx.chained)
                .with_context(|| format!("failed to get the number of rule table for interface {}", ctx.chained))?
        };
        self.setup_routes(&ctx, &host_nl, &pair, table, &host_ips, &pod_ips).await?;

        // Step 5: default route
        if !is_first {
            self.migrate(&ctx, table, &pod_ips).await?;
        }

        sysctl::apply_rp_filter(&ctx.pod_ns, self.conf.rp_filter())
            .await
            .context("failed to set rp_filter")?;

        info!(elapsed_us = started.elapsed().as_micros() as u64, "succeeded to call veth plugin");
        Ok(super::passthrough(&self.conf))
    }

    async fn setup_routes(
        &self,
        ctx: &AddContext,
        host_nl: &Rtnl,
        pair: &VethPair,
        table: u32,
        host_ips: &AddressSet,
        pod_ips: &AddressSet,
    ) -> Result<()> {
        let families = ctx.families;
        let subnets = &self.conf.subnets;
        let pod_link = pair.pod.index;
        ctx.pod_ns
            .run(move || async move {
                let nl = Rtnl::connect()?;
                routing::add_host_routes(&nl, table, host_ips.ips(), pod_link).await?;
                routing::add_subnet_routes(&nl, table, pod_link, subnets.all(), host_ips, families).await?;
                if table != MAIN_TABLE {
                    routing::add_to_rules(&nl, pod_ips, table, families).await?;
                }
                Ok(())
            })
            .await
            .context("[pod side] failed to add routes")?;

        routing::add_host_routes(host_nl, MAIN_TABLE, pod_ips.ips(), pair.host.index)
            .await
            .context("[host side] failed to add routes")?;
        Ok(())
    }

    async fn migrate(&self, ctx: &AddContext, table: u32, pod_ips: &AddressSet) -> Result<()> {
        let overlay = self.conf.overlay_interface.as_str();
        let previous = routing::previous_interface_name(&ctx.chained, overlay).unwrap_or_else(|| overlay.to_string());
        let migration = DefaultRouteMigration {
            link: &ctx.chained,
            current: &ctx.chained,
            previous: &previous,
            addresses: pod_ips,
            policy: self.conf.migrate_route,
            table,
            families: ctx.families,
            overlay_interface: overlay,
        };
        let migration = &migration;
        ctx.pod_ns
            .run(move || async move {
                let nl = Rtnl::connect()?;
                migration.apply(&nl).await
            })
            .await
            .context("failed to migrate default route")
    }
}
