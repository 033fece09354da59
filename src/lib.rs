//! Chained CNI plugins for macvlan/overlay Kubernetes pods.
//!
//! After a primary CNI has handed the pod its address, these plugins:
//! - Probe the address for duplicates over ARP/NDP
//! - Create or reuse the `veth0` pair back to the host
//! - Install static neighbor entries in both directions
//! - Give every chained `net<N>` interface its own policy-routing table
//! - Move the default route out of the main table when asked to

pub mod commands;
pub mod config;
pub mod error;
pub mod inventory;
pub mod ipcheck;
pub mod logging;
pub mod netlink;
pub mod netns;
pub mod plugin;
pub mod provision;
pub mod routing;
pub mod sysctl;
pub mod types;

// Re-export commonly used items
pub use config::PluginConf;
pub use error::{Error, Result};
pub use plugin::{ChainedPlugin, RouterPlugin, VethPlugin};
