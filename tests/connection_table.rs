//! Connection-table tests: flow-pinned dispatch, bounded egress queues,
//! duplicate suppression, learned routes, and path supersession.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use braid::dataplane::flow_hash_packet;
use braid::error::{Error, Result};
use braid::server::ConnectionTable;
use braid::transport::DatagramConn;

type SendLog = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

/// Records everything sent through it.
struct RecordingConn {
    name: String,
    log: SendLog,
    closed: Arc<AtomicBool>,
}

impl RecordingConn {
    fn new(name: &str, log: &SendLog) -> (Arc<Self>, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        (
            Arc::new(Self {
                name: name.into(),
                log: Arc::clone(log),
                closed: Arc::clone(&closed),
            }),
            closed,
        )
    }
}

#[async_trait]
impl DatagramConn for RecordingConn {
    async fn send_datagram(&self, pkt: &[u8]) -> Result<()> {
        self.log.lock().push((self.name.clone(), pkt.to_vec()));
        Ok(())
    }

    async fn recv_datagram(&self, cancel: &CancellationToken) -> Result<Bytes> {
        cancel.cancelled().await;
        Err(Error::Cancelled)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A transport whose sends never complete: its drain task wedges on the
/// first packet, so the egress queue behind it fills up.
struct StuckConn;

#[async_trait]
impl DatagramConn for StuckConn {
    async fn send_datagram(&self, _pkt: &[u8]) -> Result<()> {
        std::future::pending::<()>().await;
        unreachable!()
    }

    async fn recv_datagram(&self, cancel: &CancellationToken) -> Result<Bytes> {
        cancel.cancelled().await;
        Err(Error::Cancelled)
    }

    fn close(&self) {}
}

const PEER: Ipv4Addr = Ipv4Addr::new(10, 200, 17, 2);

fn udp_packet(dst: Ipv4Addr, src_port: u16, dst_port: u16) -> Vec<u8> {
    let mut pkt = vec![0u8; 28];
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&28u16.to_be_bytes());
    pkt[8] = 64;
    pkt[9] = 17;
    pkt[12..16].copy_from_slice(&[198, 18, 0, 9]);
    pkt[16..20].copy_from_slice(&dst.octets());
    pkt[20..22].copy_from_slice(&src_port.to_be_bytes());
    pkt[22..24].copy_from_slice(&dst_port.to_be_bytes());
    pkt
}

async fn drain_settles(log: &SendLog, expected: usize) {
    for _ in 0..100 {
        if log.lock().len() >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {expected} sends, got {}", log.lock().len());
}

#[tokio::test]
async fn flows_pin_to_one_path() {
    let table = ConnectionTable::new();
    let log: SendLog = Arc::new(Mutex::new(Vec::new()));
    let cancel = CancellationToken::new();

    for i in 0..4 {
        let (conn, _) = RecordingConn::new(&format!("path{i}"), &log);
        table.register(PEER, format!("path{i}"), conn, cancel.child_token());
    }

    // 100 flows, 10 packets each.
    for flow in 0..100u16 {
        for _ in 0..10 {
            let pkt = udp_packet(PEER, 40000 + flow, 443);
            assert!(table.dispatch(IpAddr::V4(PEER), &pkt));
        }
    }
    drain_settles(&log, 1000).await;

    // Every packet of a flow must have left via the same path.
    let mut flow_paths: std::collections::HashMap<u32, std::collections::HashSet<String>> =
        std::collections::HashMap::new();
    for (path, pkt) in log.lock().iter() {
        let hash = flow_hash_packet(pkt).expect("udp packets hash");
        flow_paths.entry(hash).or_default().insert(path.clone());
    }
    assert_eq!(flow_paths.len(), 100, "one hash per flow");
    for (hash, paths) in flow_paths {
        assert_eq!(paths.len(), 1, "flow {hash:08x} crossed paths: {paths:?}");
    }
    cancel.cancel();
}

#[tokio::test]
async fn stuck_path_does_not_block_siblings() {
    let table = ConnectionTable::new();
    let log: SendLog = Arc::new(Mutex::new(Vec::new()));
    let cancel = CancellationToken::new();

    table.register(PEER, "stuck".into(), Arc::new(StuckConn), cancel.child_token());
    let (healthy, _) = RecordingConn::new("healthy", &log);
    table.register(PEER, "healthy".into(), healthy, cancel.child_token());

    // Find one flow that hashes to each path index (active set order is
    // registration order: stuck = 0, healthy = 1).
    let flow_for = |index: usize| -> Vec<u8> {
        (1u16..)
            .map(|port| udp_packet(PEER, port, 443))
            .find(|pkt| flow_hash_packet(pkt).unwrap() as usize % 2 == index)
            .unwrap()
    };
    let stuck_flow = flow_for(0);
    let healthy_flow = flow_for(1);

    // Saturate the stuck path's queue: 256 slots + 1 wedged in the drain
    // task; everything beyond that is dropped, not blocked on.
    let mut dropped = 0u64;
    for _ in 0..400 {
        if !table.dispatch(IpAddr::V4(PEER), &stuck_flow) {
            dropped += 1;
        }
    }
    assert!(dropped > 0, "overflow drops instead of blocking");
    assert!(table.dispatch_drops() >= dropped);

    // The sibling path still delivers promptly.
    assert!(table.dispatch(IpAddr::V4(PEER), &healthy_flow));
    drain_settles(&log, 1).await;
    assert_eq!(log.lock()[0].0, "healthy");
    cancel.cancel();
}

#[tokio::test]
async fn duplicate_packets_suppressed_once() {
    let table = ConnectionTable::new();
    let pkt = udp_packet(PEER, 40000, 443);

    assert!(!table.is_duplicate(&pkt), "first sighting is fresh");
    assert!(table.is_duplicate(&pkt), "second sighting is a duplicate");
    assert_eq!(table.dedup_hits(), 1);

    let other = udp_packet(PEER, 40001, 443);
    assert!(!table.is_duplicate(&other));
}

#[tokio::test]
async fn learned_routes_resolve_and_purge() {
    let table = ConnectionTable::new();
    let log: SendLog = Arc::new(Mutex::new(Vec::new()));
    let cancel = CancellationToken::new();

    let (conn, _) = RecordingConn::new("p0", &log);
    table.register(PEER, "p0".into(), conn, cancel.child_token());

    // A LAN host behind the peer.
    let lan: IpAddr = "192.168.40.7".parse().unwrap();
    table.learn_route(lan, PEER);
    assert_eq!(table.learned_route_count(), 1);

    let pkt = udp_packet(Ipv4Addr::new(192, 168, 40, 7), 40000, 443);
    assert!(table.dispatch(lan, &pkt), "routes via the learned peer");
    drain_settles(&log, 1).await;

    // Removing the peer's last path purges its learned routes.
    table.unregister_conn(PEER, "p0");
    assert_eq!(table.peer_count(), 0);
    assert_eq!(table.learned_route_count(), 0);
    assert!(!table.dispatch(lan, &pkt));
    cancel.cancel();
}

#[tokio::test]
async fn same_remote_key_supersedes_in_place() {
    let table = ConnectionTable::new();
    let log: SendLog = Arc::new(Mutex::new(Vec::new()));
    let cancel = CancellationToken::new();

    let (old, old_closed) = RecordingConn::new("old", &log);
    table.register(PEER, "198.51.100.7:9000".into(), old, cancel.child_token());
    assert_eq!(table.path_count(PEER), 1);

    let (new, new_closed) = RecordingConn::new("new", &log);
    table.register(PEER, "198.51.100.7:9000".into(), new, cancel.child_token());

    assert_eq!(table.path_count(PEER), 1, "superseded, not appended");
    assert!(old_closed.load(Ordering::SeqCst), "old transport closed");
    assert!(!new_closed.load(Ordering::SeqCst));

    // New transport carries the traffic now.
    let pkt = udp_packet(PEER, 40000, 443);
    assert!(table.dispatch(IpAddr::V4(PEER), &pkt));
    drain_settles(&log, 1).await;
    assert_eq!(log.lock()[0].0, "new");
    cancel.cancel();
}

#[tokio::test]
async fn distinct_remote_keys_make_multipath() {
    let table = ConnectionTable::new();
    let log: SendLog = Arc::new(Mutex::new(Vec::new()));
    let cancel = CancellationToken::new();

    let (a, _) = RecordingConn::new("a", &log);
    let (b, _) = RecordingConn::new("b", &log);
    table.register(PEER, "198.51.100.7:9000".into(), a, cancel.child_token());
    table.register(PEER, "198.51.100.8:9000".into(), b, cancel.child_token());
    assert_eq!(table.path_count(PEER), 2);

    // Unregistering one path keeps the peer.
    table.unregister_conn(PEER, "198.51.100.7:9000");
    assert_eq!(table.path_count(PEER), 1);
    assert_eq!(table.peer_count(), 1);
    cancel.cancel();
}

#[tokio::test]
async fn unparseable_packets_round_robin() {
    let table = ConnectionTable::new();
    let log: SendLog = Arc::new(Mutex::new(Vec::new()));
    let cancel = CancellationToken::new();

    for name in ["a", "b"] {
        let (conn, _) = RecordingConn::new(name, &log);
        table.register(PEER, name.into(), conn, cancel.child_token());
    }

    // ICMP has no ports, so no flow hash: dispatch falls back to
    // round-robin across the active paths.
    let mut pkt = udp_packet(PEER, 0, 0);
    pkt[9] = 1; // ICMP
    for _ in 0..10 {
        assert!(table.dispatch(IpAddr::V4(PEER), &pkt));
    }
    drain_settles(&log, 10).await;
    let a_count = log.lock().iter().filter(|(n, _)| n == "a").count();
    assert_eq!(a_count, 5, "round-robin split");
    cancel.cancel();
}
