// End-to-end checks against real network namespaces. Root only.

use std::process::Command;
use std::time::Duration;

use chaincni::ipcheck;
use chaincni::netlink::{NetlinkOps, Rtnl};
use chaincni::netns::NetNs;
use chaincni::provision::{self, POD_VETH_NAME};
use chaincni::Error;

fn ip(args: &[&str]) -> Result<(), Box<dyn std::error::Error>> {
    let output = Command::new("ip").args(args).output()?;
    if !output.status.success() {
        return Err(format!("ip {}: {}", args.join(" "), String::from_utf8_lossy(&output.stderr)).into());
    }
    Ok(())
}

// Function to create a test netns
fn create_test_netns(name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let _ = Command::new("ip").args(["netns", "delete", name]).output();
    ip(&["netns", "add", name])
}

// Function to delete a test netns
fn delete_test_netns(name: &str) {
    let _ = Command::new("ip").args(["netns", "delete", name]).output();
}

fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

// This test requires root privileges to run
#[tokio::test(flavor = "current_thread")]
#[ignore]
async fn test_veth_pair_lifecycle() -> Result<(), Box<dyn std::error::Error>> {
    if !is_root() {
        println!("Skipping test_veth_pair_lifecycle: not running as root");
        return Ok(());
    }
    let name = "chaincni-test-veth";
    create_test_netns(name)?;
    let container_id = "chaincnitest0123456789";

    let outcome = async {
        let pod_ns = NetNs::open(format!("/var/run/netns/{name}"))?;
        let host_ns = NetNs::current()?;

        assert!(provision::pod_veth_missing(&pod_ns).await?);
        let pair = provision::setup_veth_pair(&host_ns, &pod_ns, container_id, true).await?;
        assert_eq!(pair.pod.name, POD_VETH_NAME);
        assert_eq!(pair.host.name, provision::host_veth_name(container_id));
        assert!(!provision::pod_veth_missing(&pod_ns).await?);

        // A second chained interface reuses the pair
        let again = provision::setup_veth_pair(&host_ns, &pod_ns, container_id, false).await?;
        assert_eq!(again.pod.mac, pair.pod.mac);

        let nl = Rtnl::connect()?;
        provision::delete_host_veth(&nl, container_id).await?;
        assert!(nl.link_by_name(&pair.host.name).await?.is_none());
        // Deleting twice is fine
        provision::delete_host_veth(&nl, container_id).await?;
        Ok::<_, Error>(())
    }
    .await;

    delete_test_netns(name);
    outcome?;
    Ok(())
}

// This test requires root privileges to run
#[tokio::test(flavor = "current_thread")]
#[ignore]
async fn test_arp_probe_detects_neighbor() -> Result<(), Box<dyn std::error::Error>> {
    if !is_root() {
        println!("Skipping test_arp_probe_detects_neighbor: not running as root");
        return Ok(());
    }
    let (left, right) = ("chaincni-test-left", "chaincni-test-right");
    create_test_netns(left)?;
    create_test_netns(right)?;

    let setup = (|| -> Result<(), Box<dyn std::error::Error>> {
        ip(&["-n", left, "link", "add", "net1", "type", "veth", "peer", "name", "peer0", "netns", right])?;
        ip(&["-n", left, "link", "set", "net1", "up"])?;
        ip(&["-n", right, "link", "set", "peer0", "address", "aa:bb:cc:dd:ee:ff"])?;
        ip(&["-n", right, "addr", "add", "10.99.0.2/24", "dev", "peer0"])?;
        ip(&["-n", right, "link", "set", "peer0", "up"])?;
        Ok(())
    })();

    let outcome = match setup {
        Ok(()) => {
            let ns = NetNs::open(format!("/var/run/netns/{left}"))?;
            let taken = ipcheck::check_addresses(&ns, "net1", &["10.99.0.2".parse()?], 3, Duration::from_millis(200)).await;
            let free = ipcheck::check_addresses(&ns, "net1", &["10.99.0.3".parse()?], 3, Duration::from_millis(200)).await;
            Ok((taken, free))
        }
        Err(err) => Err(err),
    };

    delete_test_netns(left);
    delete_test_netns(right);

    let (taken, free) = outcome?;
    let err = taken.expect_err("10.99.0.2 is answered by peer0");
    assert!(err.to_string().contains("aa:bb:cc:dd:ee:ff"), "{err}");
    free?;
    Ok(())
}
