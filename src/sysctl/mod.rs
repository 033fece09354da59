//! Per-interface sysctl writers under `/proc/sys`.
//!
//! Values under `/proc/sys/net` belong to the namespace of the thread that
//! opens them, so these run synchronously inside a `NetNs::run` scope.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::RPFilter;
use crate::error::{Error, Result};
use crate::netns::NetNs;

pub const PROC_SYS: &str = "/proc/sys";

/// Sysctl tree rooted at `/proc/sys`, or at a test directory
#[derive(Debug, Clone)]
pub struct Sysctl {
    root: PathBuf,
}

impl Default for Sysctl {
    fn default() -> Self {
        Self::with_root(PROC_SYS)
    }
}

impl Sysctl {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn conf_entries(&self, family_dir: &str, key: &str) -> Result<Vec<PathBuf>> {
        let dir = self.root.join("net").join(family_dir).join("conf");
        let entries = fs::read_dir(&dir).map_err(|source| Error::Sysctl {
            path: dir.clone(),
            source,
        })?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| Error::Sysctl {
                path: dir.clone(),
                source,
            })?;
            paths.push(entry.path().join(key));
        }
        paths.sort();
        Ok(paths)
    }

    pub fn read(&self, path: &Path) -> io::Result<String> {
        Ok(fs::read_to_string(path)?.trim().to_string())
    }

    pub fn write(&self, path: &Path, value: &str) -> Result<()> {
        fs::write(path, value).map_err(|source| Error::Sysctl {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Set `net/ipv4/conf/*/rp_filter` to `value`. Entries that cannot be
    /// read are skipped; entries already at `value` are left untouched.
    pub fn set_rp_filter(&self, value: u8) -> Result<()> {
        let wanted = value.to_string();
        debug!(value, "setting rp_filter");
        for path in self.conf_entries("ipv4", "rp_filter")? {
            let current = match self.read(&path) {
                Ok(current) => current,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to read rp_filter");
                    continue;
                }
            };
            if current == wanted {
                continue;
            }
            self.write(&path, &wanted)?;
        }
        Ok(())
    }

    /// Set `net/ipv6/conf/*/disable_ipv6` to 0
    pub fn enable_ipv6(&self) -> Result<()> {
        debug!("setting disable_ipv6 to 0 on every interface");
        for path in self.conf_entries("ipv6", "disable_ipv6")? {
            let current = self.read(&path).map_err(|source| Error::Sysctl {
                path: path.clone(),
                source,
            })?;
            if current != "0" {
                self.write(&path, "0")?;
            }
        }
        Ok(())
    }
}

/// Apply reverse-path filtering to the host (when enabled) and the pod
pub async fn apply_rp_filter(pod_ns: &NetNs, rp_filter: RPFilter) -> Result<()> {
    let sysctl = Sysctl::default();
    if let Some(value) = rp_filter.host_value() {
        sysctl.set_rp_filter(value)?;
    }
    let value = rp_filter.pod_value();
    let sysctl = &sysctl;
    pod_ns.run(move || async move { sysctl.set_rp_filter(value) }).await
}

/// Make sure IPv6 is not disabled on any interface in the pod
pub async fn enable_ipv6(pod_ns: &NetNs) -> Result<()> {
    pod_ns
        .run(|| async { Sysctl::default().enable_ipv6() })
        .await
}
