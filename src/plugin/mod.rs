//! ADD/DEL/CHECK orchestration for the chained plugins.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::net::IpAddr;
use tracing::{info, info_span, Span};

use crate::config::PluginConf;
use crate::inventory::{self, AddressSet};
use crate::ipcheck;
use crate::netlink::{Families, Rtnl};
use crate::netns::NetNs;
use crate::provision;
use crate::types::{CmdArgs, Result as CniResult};

mod router;
mod veth;

pub use router::RouterPlugin;
pub use veth::VethPlugin;

/// A chained CNI plugin driven by `commands::run_cni`
#[async_trait(?Send)]
pub trait ChainedPlugin: Sized {
    /// Binary name, used in logs
    const NAME: &'static str;
    /// Log file used when the configuration names none
    const LOG_FILE: &'static str;

    fn new(conf: PluginConf, args: CmdArgs) -> Self;

    /// Wire the chained interface; returns the result to print
    async fn add_network(&self) -> Result<Value>;

    async fn del_network(&self) -> Result<()>;

    async fn check_network(&self) -> Result<()>;
}

/// Span carrying the pod identity for one invocation
pub(crate) fn invocation_span(action: &'static str, plugin: &'static str, args: &CmdArgs) -> Span {
    let k8s = args.k8s();
    info_span!(
        "cni",
        action,
        plugin,
        container_id = %args.container_id,
        pod_uid = %k8s.pod_uid,
        pod_name = %k8s.pod_name,
        pod_namespace = %k8s.pod_namespace,
        ifname = %args.ifname,
    )
}

/// State shared by the ADD flows once the previous result is decoded
pub(crate) struct AddContext {
    pub prev: CniResult,
    pub pod_ns: NetNs,
    pub families: Families,
    /// Interface named first in the previous result
    pub chained: String,
}

/// What ADD should do after the early steps
pub(crate) enum Prelude {
    /// Nothing left to wire; print this result
    Done(Value),
    Continue(AddContext),
}

/// Steps common to both plugins: skip handling, previous result decoding,
/// duplicate address detection and the MAC overwrite.
pub(crate) async fn add_prelude(conf: &PluginConf, args: &CmdArgs) -> Result<Prelude> {
    if conf.skip_call {
        info!("skip_call is set, returning the previous result");
        return Ok(Prelude::Done(passthrough(conf)));
    }

    let prev = conf.prev_result()?;
    let chained = prev
        .first_interface()
        .context("failed to find interface name from prevResult")?
        .to_string();
    let pod_ns = NetNs::open(&args.netns).with_context(|| format!("failed to open netns {:?}", args.netns))?;

    let ips: Vec<IpAddr> = prev.ip_networks()?.iter().map(|net| net.ip()).collect();
    if let Some(conflict) = conf.conflict_check() {
        ipcheck::check_addresses(&pod_ns, &args.ifname, &ips, conflict.retries(), conflict.interval())
            .await
            .context("ip conflict check failed")?;
    }

    if let Some(prefix) = conf.mac_prefix.as_deref() {
        let mac = provision::overwrite_mac(&pod_ns, prefix, &args.ifname)
            .await
            .with_context(|| format!("failed to update mac address, maybe mac_prefix is invalid: {prefix}"))?;
        info!(interface = %args.ifname, %mac, "updated mac address");
        if conf.only_op_mac {
            return Ok(Prelude::Done(passthrough(conf)));
        }
    }

    Ok(Prelude::Continue(AddContext {
        families: Families::from_addrs(ips),
        prev,
        pod_ns,
        chained,
    }))
}

/// The previous result, untouched
pub(crate) fn passthrough(conf: &PluginConf) -> Value {
    conf.prev_result
        .clone()
        .unwrap_or_else(|| serde_json::json!({ "cniVersion": conf.cni_version }))
}

/// Host addresses used as routing endpoints
pub(crate) async fn host_addresses(nl: &Rtnl, families: Families) -> Result<AddressSet> {
    inventory::discover_addresses(nl, inventory::DEFAULT_INTERFACES_TO_EXCLUDE, families)
        .await
        .context("failed to get host ips")
}

/// Addresses of one interface inside the pod
pub(crate) async fn pod_addresses(pod_ns: &NetNs, name: &str, families: Families) -> Result<AddressSet> {
    let addrs = pod_ns
        .run(move || async move {
            let nl = Rtnl::connect()?;
            inventory::interface_addresses(&nl, name, families).await
        })
        .await
        .with_context(|| format!("failed to find ip from interface {name} inside the pod"))?;
    info!(interface = name, addresses = ?addrs.ips().collect::<Vec<_>>(), "pod interface addresses");
    Ok(addrs)
}
