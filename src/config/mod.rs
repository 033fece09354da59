use ipnetwork::IpNetwork;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::Result as CniResult;

mod duration;

pub use duration::parse_duration;

/// Interface the overlay CNI hands to the pod
pub const DEFAULT_OVERLAY_INTERFACE: &str = "eth0";
/// Host-side table holding routes back to chained pod addresses
pub const DEFAULT_HOST_RULE_TABLE: u32 = 500;
/// Loose reverse-path filtering
pub const DEFAULT_RP_FILTER: i64 = 2;
pub const DEFAULT_CONFLICT_INTERVAL: &str = "1s";
pub const DEFAULT_CONFLICT_RETRY: u32 = 3;

const MAC_PREFIX_PATTERN: &str = "^[a-fA-F0-9]{2}[:-][a-fA-F0-9]{2}$";

/// Network configuration shared by the chained plugins
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConf {
    /// CNI specification version
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    /// Name of the network
    #[serde(default)]
    pub name: String,
    /// Type of CNI plugin
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    /// Result of the previous plugin in the chain
    #[serde(rename = "prevResult", default, skip_serializing_if = "Option::is_none")]
    pub prev_result: Option<Value>,

    /// Kubernetes service CIDRs
    #[serde(default)]
    pub service_hijack_subnet: Vec<String>,
    /// Overlay (pod network) CIDRs
    #[serde(default)]
    pub overlay_hijack_subnet: Vec<String>,
    /// Extra CIDRs routed like the overlay
    #[serde(default)]
    pub additional_hijack_subnet: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rp_filter: Option<RPFilter>,
    #[serde(default)]
    pub migrate_route: MigrationPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_conflict: Option<IPConflict>,

    /// Interface created by the overlay CNI inside the pod
    #[serde(default = "default_overlay_interface")]
    pub overlay_interface: String,
    /// Host table for routes to chained pod addresses
    #[serde(default = "default_host_rule_table")]
    pub host_rule_table: u32,
    /// Chained interface is an SR-IOV VF; no overlay veth wiring
    #[serde(default)]
    pub sriov: bool,
    /// Print the previous result and do nothing else
    #[serde(default)]
    pub skip_call: bool,
    /// Two hex octets prepended to the address-derived MAC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_prefix: Option<String>,
    /// Stop after the MAC overwrite
    #[serde(default)]
    pub only_op_mac: bool,
    #[serde(default)]
    pub log_options: LogOptions,

    /// Parsed hijack subnets, filled by `parse`
    #[serde(skip)]
    pub subnets: HijackSubnets,
}

/// Reverse-path filter settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RPFilter {
    /// Also apply the value in the host namespace
    #[serde(rename = "set_host", alias = "enable", default)]
    pub enabled: bool,
    /// 0 off, 1 strict, 2 loose
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<i64>,
}

impl Default for RPFilter {
    fn default() -> Self {
        Self {
            enabled: true,
            value: Some(DEFAULT_RP_FILTER),
        }
    }
}

impl RPFilter {
    /// Value written to the pod's `rp_filter` entries
    pub fn pod_value(&self) -> u8 {
        self.value.map(|v| v as u8).unwrap_or(0)
    }

    /// Value written to the host's entries, if the host is touched at all
    pub fn host_value(&self) -> Option<u8> {
        self.enabled.then(|| self.pod_value())
    }

    fn normalize(&mut self) {
        let valid = matches!(self.value, Some(0..=2));
        if !valid && (self.enabled || self.value.is_some()) {
            self.value = Some(DEFAULT_RP_FILTER);
        }
    }
}

/// What to do with the default route when a chained interface is added
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum MigrationPolicy {
    /// Leave the default route alone
    Never,
    /// Migrate when the new interface sorts after the previous one
    #[default]
    Auto,
    /// Always migrate
    Enable,
}

impl From<i64> for MigrationPolicy {
    fn from(value: i64) -> Self {
        match value {
            0 => MigrationPolicy::Never,
            1 => MigrationPolicy::Enable,
            _ => MigrationPolicy::Auto,
        }
    }
}

impl From<MigrationPolicy> for i64 {
    fn from(policy: MigrationPolicy) -> Self {
        match policy {
            MigrationPolicy::Never => 0,
            MigrationPolicy::Auto => -1,
            MigrationPolicy::Enable => 1,
        }
    }
}

/// Duplicate address detection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IPConflict {
    #[serde(default)]
    pub enabled: bool,
    /// Probe interval, e.g. "1s"
    #[serde(default)]
    pub interval: String,
    /// Number of probes
    #[serde(default)]
    pub retry: i64,
}

impl IPConflict {
    /// Probe interval. Only meaningful after `PluginConf::parse`.
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(1))
    }

    pub fn retries(&self) -> u32 {
        u32::try_from(self.retry).unwrap_or(DEFAULT_CONFLICT_RETRY)
    }

    fn normalize(&mut self) -> Result<()> {
        if self.interval.trim().is_empty() {
            self.interval = DEFAULT_CONFLICT_INTERVAL.to_string();
        }
        if self.retry <= 0 {
            self.retry = i64::from(DEFAULT_CONFLICT_RETRY);
        }
        let interval = parse_duration(&self.interval)
            .map_err(|e| Error::Config(format!("ip_conflict.interval: {e}")))?;
        if interval.is_zero() {
            return Err(Error::Config("ip_conflict.interval must be positive".into()));
        }
        Ok(())
    }
}

/// Log destination and verbosity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
}

/// Parsed hijack subnet groups
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HijackSubnets {
    pub service: Vec<IpNetwork>,
    pub overlay: Vec<IpNetwork>,
    pub additional: Vec<IpNetwork>,
}

impl HijackSubnets {
    /// Parse the three groups; entries are trimmed and reduced to their
    /// network address.
    pub fn parse(service: &[String], overlay: &[String], additional: &[String]) -> Result<Self> {
        Ok(Self {
            service: parse_cidrs(service)?,
            overlay: parse_cidrs(overlay)?,
            additional: parse_cidrs(additional)?,
        })
    }

    /// Service and overlay CIDRs
    pub fn primary(&self) -> impl Iterator<Item = &IpNetwork> {
        self.service.iter().chain(self.overlay.iter())
    }

    /// Every CIDR, in service, overlay, additional order
    pub fn all(&self) -> impl Iterator<Item = &IpNetwork> {
        self.primary().chain(self.additional.iter())
    }
}

/// Parse a list of CIDR strings
pub fn parse_cidrs(cidrs: &[String]) -> Result<Vec<IpNetwork>> {
    cidrs.iter().map(|cidr| parse_cidr(cidr)).collect()
}

/// Parse one CIDR, keeping only the network part
pub fn parse_cidr(cidr: &str) -> Result<IpNetwork> {
    let trimmed = cidr.trim();
    let net: IpNetwork = trimmed.parse().map_err(|e: ipnetwork::IpNetworkError| Error::InvalidCidr {
        cidr: trimmed.to_string(),
        reason: e.to_string(),
    })?;
    IpNetwork::new(net.network(), net.prefix()).map_err(|e| Error::InvalidCidr {
        cidr: trimmed.to_string(),
        reason: e.to_string(),
    })
}

fn default_overlay_interface() -> String {
    DEFAULT_OVERLAY_INTERFACE.to_string()
}

fn default_host_rule_table() -> u32 {
    DEFAULT_HOST_RULE_TABLE
}

impl PluginConf {
    /// Parse and validate the configuration read from stdin
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut conf: PluginConf = serde_json::from_slice(bytes)
            .map_err(|e| Error::Config(format!("failed to parse network configuration: {e}")))?;

        if let Some(prefix) = &conf.mac_prefix {
            let pattern = Regex::new(MAC_PREFIX_PATTERN)
                .map_err(|e| Error::Config(e.to_string()))?;
            if !pattern.is_match(prefix) {
                return Err(Error::Config(format!(
                    "mac_prefix {prefix:?} must look like \"0a:1b\""
                )));
            }
        }

        if let Some(conflict) = conf.ip_conflict.as_mut().filter(|c| c.enabled) {
            conflict.normalize()?;
        }

        if !conf.skip_call && !conf.only_op_mac {
            if conf.service_hijack_subnet.is_empty() {
                return Err(Error::Config("service_hijack_subnet must be set".into()));
            }
            if conf.overlay_hijack_subnet.is_empty() {
                return Err(Error::Config("overlay_hijack_subnet must be set".into()));
            }
        }
        conf.subnets = HijackSubnets::parse(
            &conf.service_hijack_subnet,
            &conf.overlay_hijack_subnet,
            &conf.additional_hijack_subnet,
        )?;

        let mut rp_filter = conf.rp_filter.unwrap_or_default();
        rp_filter.normalize();
        conf.rp_filter = Some(rp_filter);

        if conf.overlay_interface.is_empty() {
            conf.overlay_interface = default_overlay_interface();
        }

        Ok(conf)
    }

    /// Reverse-path filter settings after defaulting
    pub fn rp_filter(&self) -> RPFilter {
        self.rp_filter.unwrap_or_default()
    }

    /// Duplicate address detection settings, when enabled
    pub fn conflict_check(&self) -> Option<&IPConflict> {
        self.ip_conflict.as_ref().filter(|c| c.enabled)
    }

    /// The previous plugin's result; chained plugins cannot run without it
    pub fn prev_result(&self) -> Result<CniResult> {
        let value = self.prev_result.as_ref().ok_or_else(|| {
            Error::Config("failed to find prevResult, must be called as chained plugin".into())
        })?;
        CniResult::from_value(value)
    }
}
