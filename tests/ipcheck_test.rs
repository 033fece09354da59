use async_trait::async_trait;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use chaincni::ipcheck::{arp, ndp, ArpLink, ArpPacket, NdpLink, NdpMessage, NdpOption};
use chaincni::types::MacAddr;
use chaincni::Error;

const OURS: MacAddr = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
const THEIRS: MacAddr = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

/// Segment holding one station that may answer probes
struct FakeSegment<P> {
    responder: Option<MacAddr>,
    fail_send: bool,
    fail_recv: bool,
    sent: AtomicUsize,
    tx: mpsc::UnboundedSender<P>,
    rx: Mutex<mpsc::UnboundedReceiver<P>>,
}

impl<P> FakeSegment<P> {
    fn new(responder: Option<MacAddr>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            responder,
            fail_send: false,
            fail_recv: false,
            sent: AtomicUsize::new(0),
            tx,
            rx: Mutex::new(rx),
        }
    }

    fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    async fn next(&self) -> io::Result<P> {
        if self.fail_recv {
            return Err(io::Error::from(io::ErrorKind::ConnectionReset));
        }
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))
    }
}

#[async_trait]
impl ArpLink for FakeSegment<ArpPacket> {
    fn name(&self) -> &str {
        "net1"
    }

    fn hardware_addr(&self) -> MacAddr {
        OURS
    }

    async fn send(&self, packet: &ArpPacket) -> io::Result<()> {
        if self.fail_send {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        // The probe is looped back like on a real segment
        let _ = self.tx.send(packet.clone());
        if let Some(mac) = self.responder {
            let _ = self.tx.send(ArpPacket::reply(mac, packet.target_ip, packet.sender_mac, Ipv4Addr::UNSPECIFIED));
        }
        Ok(())
    }

    async fn recv(&self) -> io::Result<ArpPacket> {
        self.next().await
    }
}

#[async_trait]
impl NdpLink for FakeSegment<NdpMessage> {
    fn name(&self) -> &str {
        "net1"
    }

    fn hardware_addr(&self) -> MacAddr {
        OURS
    }

    async fn send_to(&self, message: &NdpMessage, _dst: Ipv6Addr) -> io::Result<()> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send(message.clone());
        if let (Some(mac), NdpMessage::NeighborSolicitation { target, .. }) = (self.responder, message) {
            let _ = self.tx.send(NdpMessage::NeighborAdvertisement {
                router: false,
                solicited: true,
                override_flag: true,
                target: *target,
                options: vec![NdpOption::TargetLinkLayer(mac)],
            });
        }
        Ok(())
    }

    async fn recv(&self) -> io::Result<NdpMessage> {
        self.next().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_arp_no_reply_is_no_conflict() {
    let link = Arc::new(FakeSegment::<ArpPacket>::new(None));
    let started = Instant::now();

    arp::probe(Arc::clone(&link), Ipv4Addr::new(10, 7, 0, 5), 3, Duration::from_millis(200))
        .await
        .unwrap();

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(600), "finished after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(800), "finished after {elapsed:?}");
    assert_eq!(link.sent(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_arp_reply_is_a_conflict() {
    let link = Arc::new(FakeSegment::<ArpPacket>::new(Some(THEIRS)));

    let err = arp::probe(Arc::clone(&link), Ipv4Addr::new(10, 7, 0, 5), 3, Duration::from_millis(200))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::IpConflict { mac, .. } if mac == THEIRS));
    assert!(err.to_string().contains("aa:bb:cc:dd:ee:ff"), "{err}");
    assert_eq!(link.sent(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_arp_send_failure_is_fatal() {
    let mut segment = FakeSegment::<ArpPacket>::new(None);
    segment.fail_send = true;

    let err = arp::probe(Arc::new(segment), Ipv4Addr::new(10, 7, 0, 5), 3, Duration::from_millis(200))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Transport { .. }));
    assert!(!err.is_exists());
}

#[tokio::test(start_paused = true)]
async fn test_arp_listener_read_failure_is_fatal() {
    let mut segment = FakeSegment::<ArpPacket>::new(Some(THEIRS));
    segment.fail_recv = true;
    let link = Arc::new(segment);

    let err = arp::probe(Arc::clone(&link), Ipv4Addr::new(10, 7, 0, 5), 3, Duration::from_millis(200))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Transport { op: "read ARP reply", .. }), "{err}");
    // The prober stops as soon as the listener gives up
    assert!(link.sent() < 3);
}

#[tokio::test(start_paused = true)]
async fn test_arp_zero_interval_is_rejected() {
    let link = Arc::new(FakeSegment::<ArpPacket>::new(None));

    let err = arp::probe(Arc::clone(&link), Ipv4Addr::new(10, 7, 0, 5), 3, Duration::ZERO)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Config(_)), "{err}");
    assert_eq!(link.sent(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_ndp_own_advertisement_is_not_a_conflict() {
    let link = FakeSegment::<NdpMessage>::new(Some(OURS));
    ndp::probe(&link, "fd00:7::5".parse().unwrap(), 3, Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(link.sent(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ndp_foreign_advertisement_is_a_conflict() {
    let link = FakeSegment::<NdpMessage>::new(Some(THEIRS));
    let err = ndp::probe(&link, "fd00:7::5".parse().unwrap(), 3, Duration::from_millis(200))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::IpConflict { mac, .. } if mac == THEIRS));
    assert!(err.to_string().contains("aa:bb:cc:dd:ee:ff"));
}

#[tokio::test(start_paused = true)]
async fn test_ndp_silence_exhausts_retries() {
    let link = FakeSegment::<NdpMessage>::new(None);
    let started = Instant::now();

    let err = ndp::probe(&link, "fd00:7::5".parse().unwrap(), 3, Duration::from_millis(200))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RetryExhausted { retries: 3, .. }));
    assert_eq!(link.sent(), 3);
    assert!(started.elapsed() >= Duration::from_millis(600));
}

#[tokio::test(start_paused = true)]
async fn test_ndp_advertisement_with_two_link_layer_options_is_ignored() {
    struct Noisy(FakeSegment<NdpMessage>);

    #[async_trait]
    impl NdpLink for Noisy {
        fn name(&self) -> &str {
            "net1"
        }

        fn hardware_addr(&self) -> MacAddr {
            OURS
        }

        async fn send_to(&self, _message: &NdpMessage, _dst: Ipv6Addr) -> io::Result<()> {
            self.0.sent.fetch_add(1, Ordering::SeqCst);
            let _ = self.0.tx.send(NdpMessage::NeighborAdvertisement {
                router: false,
                solicited: true,
                override_flag: false,
                target: "fd00:7::5".parse().unwrap(),
                options: vec![NdpOption::TargetLinkLayer(THEIRS), NdpOption::SourceLinkLayer(THEIRS)],
            });
            Ok(())
        }

        async fn recv(&self) -> io::Result<NdpMessage> {
            self.0.next().await
        }
    }

    let link = Noisy(FakeSegment::new(None));
    let err = ndp::probe(&link, "fd00:7::5".parse().unwrap(), 2, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RetryExhausted { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_ndp_read_failure_aborts_without_retrying() {
    let mut link = FakeSegment::<NdpMessage>::new(None);
    link.fail_recv = true;
    let started = Instant::now();

    let err = ndp::probe(&link, "fd00:7::5".parse().unwrap(), 3, Duration::from_millis(200))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Transport { op: "read neighbor advertisement", .. }), "{err}");
    assert_eq!(link.sent(), 1);
    assert!(started.elapsed() < Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn test_ndp_zero_interval_is_rejected() {
    let link = FakeSegment::<NdpMessage>::new(None);

    let err = ndp::probe(&link, "fd00:7::5".parse().unwrap(), 3, Duration::ZERO)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Config(_)), "{err}");
    assert_eq!(link.sent(), 0);
}
