//! Scheduler behavior tests: policy-driven selection, exclusion and
//! preference filters, duplication, failover, and cooldown.
//!
//! Paths are backed by in-memory transport doubles so every test runs
//! without sockets or privileges.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use braid::dataplane::{ClassConfig, Classifier, DataplaneConfig, RuleConfig};
use braid::error::{Error, Result, TransportError};
use braid::multipath::{MultipathConn, PathConfig, PathDialer};
use braid::transport::DatagramConn;
use braid::types::{SchedulerPolicy, TransportKind};

/// Shared log of (path name, packet) pairs in send order.
type SendLog = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

/// Transport double: records sends, never produces receives.
struct TestTransport {
    name: String,
    log: SendLog,
    failing: Arc<Mutex<HashSet<String>>>,
}

#[async_trait]
impl DatagramConn for TestTransport {
    async fn send_datagram(&self, pkt: &[u8]) -> Result<()> {
        if self.failing.lock().contains(&self.name) {
            return Err(TransportError::SendFailed("induced failure".into()).into());
        }
        self.log.lock().push((self.name.clone(), pkt.to_vec()));
        Ok(())
    }

    async fn recv_datagram(&self, cancel: &CancellationToken) -> Result<Bytes> {
        cancel.cancelled().await;
        Err(Error::Cancelled)
    }

    fn close(&self) {}
}

/// Dialer double: dials succeed unless the path is in the refusing set.
struct TestDialer {
    log: SendLog,
    failing: Arc<Mutex<HashSet<String>>>,
    refusing: Arc<Mutex<HashSet<String>>>,
}

#[async_trait]
impl PathDialer for TestDialer {
    async fn dial(
        &self,
        cfg: &PathConfig,
        _cancel: &CancellationToken,
    ) -> Result<Arc<dyn DatagramConn>> {
        if self.refusing.lock().contains(&cfg.name) {
            return Err(Error::ConnectionTimeout);
        }
        Ok(Arc::new(TestTransport {
            name: cfg.name.clone(),
            log: Arc::clone(&self.log),
            failing: Arc::clone(&self.failing),
        }))
    }
}

struct Harness {
    conn: Arc<MultipathConn>,
    log: SendLog,
    failing: Arc<Mutex<HashSet<String>>>,
    cancel: CancellationToken,
}

fn path(name: &str, priority: u32, weight: u32) -> PathConfig {
    PathConfig {
        name: name.into(),
        base_name: name.into(),
        bind: "127.0.0.1".into(),
        remote_addr: "127.0.0.1".into(),
        remote_port: 4433,
        priority,
        weight,
        pipes: 1,
        transport: TransportKind::Quic,
    }
}

async fn start(
    paths: Vec<PathConfig>,
    classifier: Classifier,
    refusing: &[&str],
) -> Harness {
    let log: SendLog = Arc::new(Mutex::new(Vec::new()));
    let failing = Arc::new(Mutex::new(HashSet::new()));
    let refusing = Arc::new(Mutex::new(
        refusing.iter().map(|s| (*s).to_string()).collect::<HashSet<_>>(),
    ));
    let cancel = CancellationToken::new();
    let dialer = Arc::new(TestDialer {
        log: Arc::clone(&log),
        failing: Arc::clone(&failing),
        refusing,
    });
    let conn = MultipathConn::new(paths, Arc::new(classifier), dialer, cancel.clone());
    conn.start().await.expect("at least one path up");
    Harness {
        conn,
        log,
        failing,
        cancel,
    }
}

fn default_classifier() -> Classifier {
    Classifier::single_default()
}

fn classifier_with_default(class: ClassConfig) -> Classifier {
    let cfg = DataplaneConfig {
        default_class: "default".into(),
        classes: HashMap::from([("default".into(), class)]),
        classifiers: Vec::new(),
    };
    Classifier::compile(&cfg).unwrap()
}

fn sent_paths(log: &SendLog) -> Vec<String> {
    log.lock().iter().map(|(name, _)| name.clone()).collect()
}

#[tokio::test]
async fn failover_uses_strict_priority_order() {
    let classifier = classifier_with_default(ClassConfig {
        policy: SchedulerPolicy::Failover,
        ..Default::default()
    });
    // p2 has a huge weight, which failover must ignore.
    let h = start(vec![path("p1", 1, 1), path("p2", 2, 100)], classifier, &[]).await;

    for _ in 0..20 {
        h.conn.send_datagram(b"payload").await.unwrap();
    }
    let sent = sent_paths(&h.log);
    assert!(sent.iter().all(|p| p == "p1"), "failover always picks p1: {sent:?}");
    h.cancel.cancel();
}

#[tokio::test]
async fn balanced_weight_bonus_beats_priority_within_reach() {
    // score(p1) = 1000, score(p2) = 2000 - 9*120 = 920: balanced prefers
    // the heavy path despite its worse priority.
    let classifier = classifier_with_default(ClassConfig {
        policy: SchedulerPolicy::Balanced,
        ..Default::default()
    });
    let h = start(vec![path("p1", 1, 1), path("p2", 2, 10)], classifier, &[]).await;

    for _ in 0..10 {
        h.conn.send_datagram(b"payload").await.unwrap();
    }
    let sent = sent_paths(&h.log);
    assert!(sent.iter().all(|p| p == "p2"), "balanced prefers weight: {sent:?}");
    h.cancel.cancel();
}

#[tokio::test]
async fn equal_scores_round_robin() {
    let classifier = default_classifier();
    let h = start(vec![path("p1", 1, 1), path("p2", 1, 1)], classifier, &[]).await;

    for _ in 0..10 {
        h.conn.send_datagram(b"payload").await.unwrap();
    }
    let sent = sent_paths(&h.log);
    let p1_count = sent.iter().filter(|p| *p == "p1").count();
    let p2_count = sent.iter().filter(|p| *p == "p2").count();
    assert_eq!(p1_count, 5, "ties alternate: {sent:?}");
    assert_eq!(p2_count, 5);
    h.cancel.cancel();
}

#[tokio::test]
async fn excluded_path_never_selected() {
    let classifier = classifier_with_default(ClassConfig {
        excluded_paths: vec!["p1".into()],
        ..Default::default()
    });
    let h = start(vec![path("p1", 1, 1), path("p2", 2, 1)], classifier, &[]).await;

    for _ in 0..10 {
        h.conn.send_datagram(b"payload").await.unwrap();
    }
    let sent = sent_paths(&h.log);
    assert!(sent.iter().all(|p| p == "p2"), "p1 is excluded: {sent:?}");
    h.cancel.cancel();
}

#[tokio::test]
async fn exclusion_of_every_path_times_out_the_send() {
    // The excluded filter has no relaxation pass: with every path
    // excluded the send runs into its deadline even though paths are
    // alive.
    let classifier = classifier_with_default(ClassConfig {
        excluded_paths: vec!["p1".into(), "p2".into()],
        ..Default::default()
    });
    let h = start(vec![path("p1", 1, 1), path("p2", 2, 1)], classifier, &[]).await;

    let started = std::time::Instant::now();
    let result = h.conn.send_datagram(b"payload").await;
    assert!(matches!(result, Err(Error::SendDeadline)), "{result:?}");
    assert!(started.elapsed() >= Duration::from_millis(1100));
    assert!(sent_paths(&h.log).is_empty());
    h.cancel.cancel();
}

#[tokio::test]
async fn excluded_matches_base_name_of_expanded_paths() {
    let classifier = classifier_with_default(ClassConfig {
        excluded_paths: vec!["wan5".into()],
        ..Default::default()
    });
    let mut expanded = path("wan5.0", 1, 1);
    expanded.base_name = "wan5".into();
    let h = start(vec![expanded, path("wan6", 2, 1)], classifier, &[]).await;

    h.conn.send_datagram(b"payload").await.unwrap();
    assert_eq!(sent_paths(&h.log), vec!["wan6".to_string()]);
    h.cancel.cancel();
}

#[tokio::test]
async fn preferred_falls_back_when_unavailable() {
    let classifier = classifier_with_default(ClassConfig {
        preferred_paths: vec!["p1".into()],
        ..Default::default()
    });
    // p1 refuses to dial: it sits in reconnecting state from the start.
    let h = start(vec![path("p1", 1, 1), path("p2", 2, 1)], classifier, &["p1"]).await;

    h.conn.send_datagram(b"payload").await.unwrap();
    assert_eq!(sent_paths(&h.log), vec!["p2".to_string()], "fallback to non-preferred");
    h.cancel.cancel();
}

#[tokio::test]
async fn preferred_wins_over_better_score() {
    let classifier = classifier_with_default(ClassConfig {
        preferred_paths: vec!["p2".into()],
        ..Default::default()
    });
    // p1 scores better (priority 1), but the class prefers p2.
    let h = start(vec![path("p1", 1, 1), path("p2", 2, 1)], classifier, &[]).await;

    for _ in 0..5 {
        h.conn.send_datagram(b"payload").await.unwrap();
    }
    let sent = sent_paths(&h.log);
    assert!(sent.iter().all(|p| p == "p2"), "{sent:?}");
    h.cancel.cancel();
}

#[tokio::test]
async fn duplicate_sends_on_distinct_paths() {
    let classifier = classifier_with_default(ClassConfig {
        duplicate: true,
        duplicate_copies: 2,
        ..Default::default()
    });
    let h = start(vec![path("p1", 1, 1), path("p2", 2, 1)], classifier, &[]).await;

    h.conn.send_datagram(b"payload").await.unwrap();

    let sent = sent_paths(&h.log);
    assert_eq!(sent.len(), 2);
    let distinct: HashSet<_> = sent.iter().collect();
    assert_eq!(distinct.len(), 2, "copies on distinct paths: {sent:?}");

    let counters = h.conn.class_counters();
    let (_, stats) = counters
        .iter()
        .find(|(name, _)| name == "default")
        .expect("class counted");
    assert_eq!(stats.tx_packets, 1);
    assert_eq!(stats.tx_duplicates, 1);
    h.cancel.cancel();
}

#[tokio::test]
async fn duplicate_with_one_path_partially_succeeds() {
    let classifier = classifier_with_default(ClassConfig {
        duplicate: true,
        duplicate_copies: 2,
        ..Default::default()
    });
    let h = start(vec![path("p1", 1, 1)], classifier, &[]).await;

    // One alive path: the duplicate send succeeds with a single copy.
    h.conn.send_datagram(b"payload").await.unwrap();
    assert_eq!(sent_paths(&h.log).len(), 1);
    h.cancel.cancel();
}

#[tokio::test]
async fn send_error_fails_over_within_deadline() {
    let classifier = default_classifier();
    let h = start(vec![path("p1", 1, 1), path("p2", 2, 1)], classifier, &[]).await;

    for _ in 0..5 {
        h.conn.send_datagram(b"payload").await.unwrap();
    }
    assert!(sent_paths(&h.log).iter().all(|p| p == "p1"));

    // Kill p1: the next send must land on p2 without an error surfacing.
    h.failing.lock().insert("p1".into());
    let started = std::time::Instant::now();
    h.conn.send_datagram(b"payload").await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(1200));
    assert_eq!(sent_paths(&h.log).last().unwrap(), "p2");

    // While p1 cools down every send goes to p2, even after its
    // reconnect task restores the handle.
    for _ in 0..5 {
        h.conn.send_datagram(b"payload").await.unwrap();
        assert_eq!(sent_paths(&h.log).last().unwrap(), "p2");
    }

    // The reconnector may already have restored p1's handle; its error
    // counter and failure timestamp persist either way.
    let snapshot = h
        .conn
        .path_snapshots()
        .into_iter()
        .find(|p| p.name == "p1")
        .unwrap();
    assert!(snapshot.stats.tx_errors >= 1);
    assert!(snapshot.last_down.is_some());
    h.cancel.cancel();
}

#[tokio::test]
async fn cooldown_expires_and_path_returns() {
    let classifier = default_classifier();
    let h = start(vec![path("p1", 1, 1), path("p2", 2, 1)], classifier, &[]).await;

    h.conn.send_datagram(b"payload").await.unwrap();
    h.failing.lock().insert("p1".into());
    h.conn.send_datagram(b"payload").await.unwrap(); // fails over to p2

    // Heal p1 and wait out the 1 s cooldown plus reconnect time.
    h.failing.lock().clear();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let mut landed_on_p1 = false;
    for _ in 0..10 {
        h.conn.send_datagram(b"payload").await.unwrap();
        if sent_paths(&h.log).last().unwrap() == "p1" {
            landed_on_p1 = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    assert!(landed_on_p1, "p1 selectable again after cooldown + reconnect");
    h.cancel.cancel();
}

#[tokio::test]
async fn classified_rule_routes_to_preferred_path() {
    // An ssh class preferring p1 overrides p2's better default score.
    let cfg = DataplaneConfig {
        default_class: "bulk".into(),
        classes: HashMap::from([
            ("bulk".into(), ClassConfig::default()),
            (
                "ssh".into(),
                ClassConfig {
                    preferred_paths: vec!["p1".into()],
                    ..Default::default()
                },
            ),
        ]),
        classifiers: vec![RuleConfig {
            protocol: Some("tcp".into()),
            dst_ports: vec!["22".into()],
            class: "ssh".into(),
            ..Default::default()
        }],
    };
    let classifier = Classifier::compile(&cfg).unwrap();
    let h = start(vec![path("p1", 2, 1), path("p2", 1, 1)], classifier, &[]).await;

    let ssh_syn = ipv4_tcp_packet([10, 200, 17, 2], [192, 0, 2, 7], 50000, 22);
    h.conn.send_datagram(&ssh_syn).await.unwrap();
    assert_eq!(sent_paths(&h.log).last().unwrap(), "p1");

    let https = ipv4_tcp_packet([10, 200, 17, 2], [192, 0, 2, 7], 50000, 443);
    h.conn.send_datagram(&https).await.unwrap();
    assert_eq!(sent_paths(&h.log).last().unwrap(), "p2");
    h.cancel.cancel();
}

fn ipv4_tcp_packet(src: [u8; 4], dst: [u8; 4], src_port: u16, dst_port: u16) -> Vec<u8> {
    let mut pkt = vec![0u8; 40];
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&40u16.to_be_bytes());
    pkt[8] = 64;
    pkt[9] = 6;
    pkt[12..16].copy_from_slice(&src);
    pkt[16..20].copy_from_slice(&dst);
    pkt[20..22].copy_from_slice(&src_port.to_be_bytes());
    pkt[22..24].copy_from_slice(&dst_port.to_be_bytes());
    pkt[32] = 0x50;
    pkt[33] = 0x02; // SYN
    pkt
}
