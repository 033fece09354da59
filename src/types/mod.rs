use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::Error;

mod mac;

pub use mac::MacAddr;

/// Versions accepted for `cniVersion`
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// CNI command arguments
#[derive(Debug, Clone)]
pub struct CmdArgs {
    /// Container ID
    pub container_id: String,
    /// Network namespace path
    pub netns: String,
    /// Interface name
    pub ifname: String,
    /// Arguments
    pub args: HashMap<String, String>,
    /// Path
    pub path: String,
    /// Standard input data
    pub stdin_data: Vec<u8>,
}

impl CmdArgs {
    /// Kubernetes pod identity carried in `CNI_ARGS`
    pub fn k8s(&self) -> K8sArgs {
        K8sArgs::from_args(&self.args)
    }
}

/// Pod identity passed by the kubelet through `CNI_ARGS`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct K8sArgs {
    pub pod_name: String,
    pub pod_namespace: String,
    pub pod_uid: String,
    pub infra_container_id: String,
}

impl K8sArgs {
    pub fn from_args(args: &HashMap<String, String>) -> Self {
        let get = |key: &str| args.get(key).cloned().unwrap_or_default();
        Self {
            pod_name: get("K8S_POD_NAME"),
            pod_namespace: get("K8S_POD_NAMESPACE"),
            pod_uid: get("K8S_POD_UID"),
            infra_container_id: get("K8S_POD_INFRA_CONTAINER_ID"),
        }
    }
}

/// Current result format (CNI 1.0.0)
///
/// Unknown keys are kept in `extra` so a chained plugin can hand the
/// previous result back without losing anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Result {
    /// CNI specification version
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    /// Interfaces created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<Interface>>,
    /// IP configurations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ips: Option<Vec<IPConfig>>,
    /// DNS configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<DNS>,
    /// Routes to configure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<Route>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Interface information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    /// Interface name
    pub name: String,
    /// MAC address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Sandbox path (network namespace)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// IP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IPConfig {
    /// Interface index this IP is assigned to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
    /// IP address with prefix length
    pub address: String,
    /// Gateway
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    /// Address family marker used by results older than 1.0.0
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// DNS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DNS {
    /// DNS nameservers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nameservers: Option<Vec<String>>,
    /// DNS search domains
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<Vec<String>>,
    /// DNS options
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// Route configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    /// Destination CIDR
    pub dst: String,
    /// Gateway for this route
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

impl Result {
    /// Decode a `prevResult` object
    pub fn from_value(value: &Value) -> std::result::Result<Self, Error> {
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Addresses of every IP configuration, in result order
    pub fn ip_networks(&self) -> std::result::Result<Vec<IpNetwork>, Error> {
        self.ips
            .iter()
            .flatten()
            .map(|ip| {
                ip.address.parse::<IpNetwork>().map_err(|e| Error::InvalidCidr {
                    cidr: ip.address.clone(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    /// Name of the interface the previous plugin created
    pub fn first_interface(&self) -> Option<&str> {
        self.interfaces
            .as_ref()
            .and_then(|interfaces| interfaces.first())
            .map(|interface| interface.name.as_str())
            .filter(|name| !name.is_empty())
    }

    /// Print result as JSON
    pub fn print(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        println!("{}", json);
        Ok(())
    }
}

/// Error object reported to the runtime on failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CniError {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub details: String,
}

impl CniError {
    /// Generic failure code from the CNI error table
    pub const CODE_GENERIC: u32 = 100;

    pub fn new(cni_version: &str, msg: impl Into<String>) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            code: Self::CODE_GENERIC,
            msg: msg.into(),
            details: String::new(),
        }
    }
}
