//! The multipath packet scheduler.
//!
//! One [`MultipathConn`] owns the whole path array plus the shared receive
//! channel. Sends classify the packet, pick the best path under the class
//! policy, and retry across paths until the 1200 ms deadline. Receives are
//! fed by one task per path into a bounded shared channel.
//!
//! Locking: the path array sits behind a single `parking_lot::RwLock` —
//! selection is a short read-locked scan over at most tens of paths, state
//! updates take the write lock briefly. The lock is never held across
//! I/O, and transports are always closed *after* dropping it, because a
//! close wakes receive tasks whose error paths re-enter the lock.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dataplane::{ClassPolicy, Classifier};
use crate::error::{Error, Result};
use crate::transport::DatagramConn;
use crate::types::ClassStats;
use crate::RECV_CHANNEL_CAP;

use super::path::{PathSnapshot, PathState};
use super::reconnect::{spawn_reconnect, PathDialer};
use super::{PathConfig, RX_IDLE_DELAY, SELECT_RETRY_DELAY, SEND_DEADLINE};

/// Multipath connection: the client's (and, per peer, the server's) view of
/// a bonded set of paths.
pub struct MultipathConn {
    state: RwLock<Vec<PathState>>,
    rr_cursor: AtomicUsize,

    classifier: RwLock<Arc<Classifier>>,
    class_stats: DashMap<String, ClassStats>,

    dialer: Arc<dyn PathDialer>,

    rx_tx: mpsc::Sender<Bytes>,
    rx_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,

    err_tx: mpsc::Sender<Error>,
    err_rx: tokio::sync::Mutex<mpsc::Receiver<Error>>,

    cancel: CancellationToken,

    /// Non-owning back-reference for tasks spawned from `&self` contexts;
    /// avoids reference cycles between paths and the scheduler.
    weak_self: Weak<Self>,
}

impl MultipathConn {
    pub fn new(
        paths: Vec<PathConfig>,
        classifier: Arc<Classifier>,
        dialer: Arc<dyn PathDialer>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (rx_tx, rx_rx) = mpsc::channel(RECV_CHANNEL_CAP);
        let (err_tx, err_rx) = mpsc::channel(1);
        Arc::new_cyclic(|weak_self| Self {
            state: RwLock::new(paths.into_iter().map(PathState::new).collect()),
            rr_cursor: AtomicUsize::new(0),
            classifier: RwLock::new(classifier),
            class_stats: DashMap::new(),
            dialer,
            rx_tx,
            rx_rx: tokio::sync::Mutex::new(rx_rx),
            err_tx,
            err_rx: tokio::sync::Mutex::new(err_rx),
            cancel,
            weak_self: weak_self.clone(),
        })
    }

    /// Dial every path once and start the per-path receive tasks.
    ///
    /// Paths that fail their initial dial are created in reconnecting state
    /// with the reconnector already running. If *no* path came up the whole
    /// start fails so the caller can back off and retry.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let count = self.state.read().len();
        let mut up = 0usize;

        for index in 0..count {
            let cfg = self.state.read()[index].cfg.clone();
            match self.dialer.dial(&cfg, &self.cancel).await {
                Ok(dc) => {
                    self.state.write()[index].install(dc);
                    info!(path = %cfg.name, "path up");
                    up += 1;
                }
                Err(e) => {
                    warn!(path = %cfg.name, error = %e, "initial dial failed, reconnecting");
                    let mut state = self.state.write();
                    state[index].reconnecting = true;
                    drop(state);
                    spawn_reconnect(Arc::clone(self), index);
                }
            }
        }

        if up == 0 {
            return Err(Error::AllPathsFailed);
        }

        for index in 0..count {
            self.spawn_rx_task(index);
        }
        Ok(())
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(super) fn dialer(&self) -> Arc<dyn PathDialer> {
        Arc::clone(&self.dialer)
    }

    pub(super) fn state(&self) -> &RwLock<Vec<PathState>> {
        &self.state
    }

    /// Swap in a new classifier (control API hot reload).
    pub fn set_classifier(&self, classifier: Arc<Classifier>) {
        *self.classifier.write() = classifier;
    }

    pub fn classifier(&self) -> Arc<Classifier> {
        Arc::clone(&self.classifier.read())
    }

    /// Send one packet, classifying it and honoring the class policy.
    pub async fn send_datagram(&self, pkt: &[u8]) -> Result<()> {
        let class = self.classifier().classify_packet(pkt);
        if class.duplicate {
            return self.send_duplicate(pkt, &class).await;
        }

        let deadline = Instant::now() + SEND_DEADLINE;
        let mut skip: HashSet<usize> = HashSet::new();

        loop {
            if Instant::now() >= deadline {
                self.bump_class(&class.name, |s| s.tx_errors += 1);
                return Err(Error::SendDeadline);
            }

            let Some((index, dc)) = self.select_with_handle(&class, &skip) else {
                tokio::select! {
                    () = self.cancel.cancelled() => return Err(Error::Cancelled),
                    () = tokio::time::sleep(SELECT_RETRY_DELAY) => continue,
                }
            };

            match dc.send_datagram(pkt).await {
                Ok(()) => {
                    self.mark_tx_success(index);
                    self.bump_class(&class.name, |s| s.tx_packets += 1);
                    return Ok(());
                }
                Err(e) => {
                    self.on_path_error(index, &e, Direction::Tx);
                    skip.insert(index);
                }
            }
        }
    }

    /// Send the packet on multiple distinct paths.
    async fn send_duplicate(&self, pkt: &[u8], class: &ClassPolicy) -> Result<()> {
        let copies = usize::from(class.duplicate_copies.clamp(2, 3));
        let deadline = Instant::now() + SEND_DEADLINE;
        let mut tried: HashSet<usize> = HashSet::new();
        let mut successes = 0usize;

        while successes < copies && Instant::now() < deadline {
            let Some((index, dc)) = self.select_with_handle(class, &tried) else {
                break; // no paths remaining
            };
            tried.insert(index);

            match dc.send_datagram(pkt).await {
                Ok(()) => {
                    self.mark_tx_success(index);
                    successes += 1;
                }
                Err(e) => {
                    self.on_path_error(index, &e, Direction::Tx);
                }
            }
        }

        if successes == 0 {
            self.bump_class(&class.name, |s| s.tx_errors += 1);
            return Err(Error::AllPathsFailed);
        }
        if successes < copies {
            debug!(
                class = %class.name,
                wanted = copies,
                sent = successes,
                "partial duplicate send"
            );
        }
        self.bump_class(&class.name, |s| {
            s.tx_packets += 1;
            s.tx_duplicates += (successes - 1) as u64;
        });
        Ok(())
    }

    /// Receive the next tunnel packet from any path.
    pub async fn recv_datagram(&self) -> Result<Bytes> {
        let mut rx = self.rx_rx.lock().await;
        tokio::select! {
            () = self.cancel.cancelled() => Err(Error::Cancelled),
            pkt = rx.recv() => pkt.ok_or(Error::ConnectionClosed),
        }
    }

    /// Next fatal condition surfaced by background tasks, if any.
    pub async fn fatal_error(&self) -> Error {
        let mut rx = self.err_rx.lock().await;
        match rx.recv().await {
            Some(e) => e,
            None => Error::ConnectionClosed,
        }
    }

    /// Select the best path for `class`, skipping `skip`, and clone its
    /// transport handle out under the read lock.
    fn select_with_handle(
        &self,
        class: &ClassPolicy,
        skip: &HashSet<usize>,
    ) -> Option<(usize, Arc<dyn DatagramConn>)> {
        let state = self.state.read();
        let index = self.select_best_path(&state, class, skip)?;
        let dc = state[index].dc.clone()?;
        Some((index, dc))
    }

    /// Best-path selection; smaller score wins, the round-robin cursor
    /// breaks ties and spreads load among equal candidates.
    ///
    /// The preferred-paths restriction is applied on a first pass and
    /// relaxed on a second. The excluded-paths restriction is never
    /// relaxed: an excluded path is not used even when nothing else is
    /// alive.
    fn select_best_path(
        &self,
        state: &[PathState],
        class: &ClassPolicy,
        skip: &HashSet<usize>,
    ) -> Option<usize> {
        let now = Instant::now();
        let restrict_preferred = !class.preferred_paths.is_empty();

        for pass in 0..2 {
            let require_preferred = pass == 0 && restrict_preferred;

            let mut best_score = i64::MAX;
            let mut candidates: Vec<usize> = Vec::new();
            for (index, path) in state.iter().enumerate() {
                if skip.contains(&index) || !path.selectable(now) {
                    continue;
                }
                if path.cfg.matches_name(&class.excluded_paths) {
                    continue;
                }
                if require_preferred && !path.cfg.matches_name(&class.preferred_paths) {
                    continue;
                }
                let score = path.score(class.policy);
                if score < best_score {
                    best_score = score;
                    candidates.clear();
                }
                if score == best_score {
                    candidates.push(index);
                }
            }

            if !candidates.is_empty() {
                let cursor = self.rr_cursor.load(Ordering::Relaxed) % state.len().max(1);
                // First candidate at or after the cursor.
                let chosen = candidates
                    .iter()
                    .copied()
                    .min_by_key(|&i| (i + state.len() - cursor) % state.len())
                    .expect("candidates not empty");
                self.rr_cursor.store(chosen + 1, Ordering::Relaxed);
                return Some(chosen);
            }

            if !require_preferred {
                break;
            }
        }
        None
    }

    fn mark_tx_success(&self, index: usize) {
        let mut state = self.state.write();
        state[index].tx_packets += 1;
    }

    fn bump_class(&self, name: &str, f: impl FnOnce(&mut ClassStats)) {
        let mut entry = self.class_stats.entry(name.to_string()).or_default();
        f(entry.value_mut());
    }

    /// Handle a path-level send/receive error: mark the path down, close
    /// its transport outside the lock, and queue a reconnect.
    pub(super) fn on_path_error(&self, index: usize, err: &Error, direction: Direction) {
        let (dc, need_reconnect, name) = {
            let mut state = self.state.write();
            let path = &mut state[index];
            match direction {
                Direction::Tx => path.tx_errors += 1,
                Direction::Rx => path.rx_errors += 1,
            }
            let dc = path.mark_down();
            let need_reconnect = !path.reconnecting;
            if need_reconnect {
                path.reconnecting = true;
            }
            (dc, need_reconnect, path.cfg.name.clone())
        };

        // Close outside the lock: closing wakes the receive task, whose
        // error path takes the same lock.
        if let Some(dc) = dc {
            dc.close();
        }

        error!(path = %name, error = %err, direction = ?direction, "path error");
        if need_reconnect {
            if let Some(conn) = self.weak_self.upgrade() {
                spawn_reconnect(conn, index);
            }
        }
    }

    /// One receive task per path: picks up the current transport handle on
    /// every iteration so reconnects are transparent.
    fn spawn_rx_task(self: &Arc<Self>, index: usize) {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if conn.cancel.is_cancelled() {
                    return;
                }

                let dc = conn.state.read()[index].dc.clone();
                let Some(dc) = dc else {
                    tokio::select! {
                        () = conn.cancel.cancelled() => return,
                        () = tokio::time::sleep(RX_IDLE_DELAY) => continue,
                    }
                };

                match dc.recv_datagram(&conn.cancel).await {
                    Ok(pkt) => {
                        conn.state.write()[index].mark_rx_success();
                        tokio::select! {
                            () = conn.cancel.cancelled() => return,
                            sent = conn.rx_tx.send(pkt) => {
                                if sent.is_err() {
                                    // Receiver side is gone; the tunnel is
                                    // shutting down.
                                    let _ = conn.err_tx.try_send(Error::ConnectionClosed);
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) if e.is_cancelled() => return,
                    Err(e) => conn.on_path_error(index, &e, Direction::Rx),
                }
            }
        });
    }

    /// Close every path. Handles are collected under the lock, nulled out,
    /// and closed after the lock is released.
    pub fn close_all(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = {
            let mut state = self.state.write();
            state
                .iter_mut()
                .filter_map(|p| {
                    p.alive = false;
                    p.dc.take()
                })
                .collect()
        };
        for dc in handles {
            dc.close();
        }
    }

    /// Snapshots of every path for telemetry and the control API.
    pub fn path_snapshots(&self) -> Vec<PathSnapshot> {
        self.state.read().iter().map(PathState::snapshot).collect()
    }

    /// Per-class counters for telemetry.
    pub fn class_counters(&self) -> Vec<(String, ClassStats)> {
        let mut counters: Vec<_> = self
            .class_stats
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        counters.sort_by(|a, b| a.0.cmp(&b.0));
        counters
    }

    /// Number of currently alive paths.
    pub fn alive_count(&self) -> usize {
        self.state.read().iter().filter(|p| p.alive).count()
    }
}

/// Which direction an error came from; only affects the counter it bumps.
#[derive(Debug, Clone, Copy)]
pub(super) enum Direction {
    Tx,
    Rx,
}
