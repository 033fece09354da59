//! Duplicate address detection over ARP (IPv4) and NDP (IPv6).
//!
//! Addresses handed out by the primary CNI are probed on the pod's
//! interface before any routing is installed. A confirmed answer from a
//! different station aborts the ADD.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::inventory;
use crate::netlink::{NetlinkOps, Rtnl};
use crate::netns::NetNs;

pub mod arp;
pub mod ndp;

pub use arp::{ArpLink, ArpOp, ArpPacket, ArpSocket};
pub use ndp::{NdpLink, NdpMessage, NdpOption, NdpSocket};

/// One-shot stop signal shared by a prober and its listener.
///
/// Cancelling twice is harmless. Anything written before `cancel` is
/// visible to a task that observed `cancelled` complete.
#[derive(Debug, Clone)]
pub struct Cancellation {
    tx: Arc<watch::Sender<bool>>,
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            let done = *rx.borrow_and_update();
            if done {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// A probe interval of zero would never wait for a reply
pub fn ensure_interval(interval: Duration) -> Result<()> {
    if interval.is_zero() {
        return Err(Error::Config("ip conflict probe interval must be greater than zero".to_string()));
    }
    Ok(())
}

/// Probe every address in `addrs` on `ifname` inside `netns`.
///
/// Retries running out on IPv6 without any advertisement is logged and
/// treated as success.
pub async fn check_addresses(
    netns: &NetNs,
    ifname: &str,
    addrs: &[IpAddr],
    retry: u32,
    interval: Duration,
) -> Result<()> {
    ensure_interval(interval)?;
    netns
        .run(move || async move {
            let nl = Rtnl::connect()?;
            let link = nl
                .link_by_name(ifname)
                .await?
                .ok_or_else(|| Error::LinkNotFound(ifname.to_string()))?;

            for ip in addrs {
                match ip {
                    IpAddr::V4(v4) => {
                        let socket = Arc::new(ArpSocket::bind(&link)?);
                        arp::probe(socket, *v4, retry, interval).await?;
                    }
                    IpAddr::V6(v6) => {
                        let source = inventory::link_local_v6(&nl, link.index).await?;
                        let socket = NdpSocket::bind(&link, source)?;
                        match ndp::probe(&socket, *v6, retry, interval).await {
                            Err(err @ Error::RetryExhausted { .. }) => {
                                warn!(interface = ifname, address = %v6, error = %err, "no neighbor advertisement received, assuming the address is free");
                            }
                            other => other?,
                        }
                    }
                }
                info!(interface = ifname, address = %ip, "no ip conflict detected");
            }
            Ok(())
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancellation_is_idempotent() {
        let token = Cancellation::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        handle.await.unwrap();
        assert!(token.is_cancelled());

        // Observing after the fact resolves immediately.
        token.cancelled().await;
    }
}
