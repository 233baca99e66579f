//! The server connection table.
//!
//! Maps each peer (a client's TUN address) to the set of paths the client
//! established, plus learned routes for LAN sources behind peers. Return
//! traffic is dispatched flow-hashed across a peer's recently-active paths
//! through bounded per-path egress queues, so one congested path can never
//! stall the TUN reader or starve its siblings.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dataplane::{flow_hash_packet, fnv1a_32};
use crate::transport::DatagramConn;
use crate::EGRESS_QUEUE_CAP;

/// Size of the duplicate-suppression ring.
pub const DEDUP_RING_SIZE: usize = 4096;

/// A path is "active" if it received anything within this window of the
/// peer's most recently active path.
pub const ACTIVE_WINDOW: Duration = Duration::from_secs(3);

/// `touch_path` skips the timestamp update if it was refreshed this
/// recently, to keep the hot receive path off the lock.
pub const TOUCH_GRANULARITY: Duration = Duration::from_millis(500);

/// One path of a peer: the transport plus its bounded egress queue and
/// drain task. Queue, drain task, and transport are created together and
/// torn down together.
pub struct PathConn {
    dc: Arc<dyn DatagramConn>,
    queue: mpsc::Sender<Bytes>,
    drain: Mutex<Option<tokio::task::JoinHandle<()>>>,
    remote_key: String,
    last_recv: Mutex<Instant>,
    cancel: CancellationToken,
}

impl PathConn {
    fn new(dc: Arc<dyn DatagramConn>, remote_key: String, cancel: CancellationToken) -> Arc<Self> {
        let (queue, mut rx) = mpsc::channel::<Bytes>(EGRESS_QUEUE_CAP);
        let conn = Arc::new(Self {
            dc: Arc::clone(&dc),
            queue,
            drain: Mutex::new(None),
            remote_key,
            last_recv: Mutex::new(Instant::now()),
            cancel: cancel.clone(),
        });

        // Drain task: serializes sends onto the transport; exits when the
        // queue closes or the path is stopped.
        let handle = tokio::spawn(async move {
            loop {
                let pkt = tokio::select! {
                    () = cancel.cancelled() => return,
                    pkt = rx.recv() => pkt,
                };
                let Some(pkt) = pkt else { return };
                if let Err(e) = dc.send_datagram(&pkt).await {
                    debug!(error = %e, "egress send failed");
                }
            }
        });
        *conn.drain.lock() = Some(handle);
        conn
    }

    pub fn remote_key(&self) -> &str {
        &self.remote_key
    }

    /// Non-blocking enqueue; false means the queue was full and the packet
    /// is dropped.
    pub fn try_send(&self, pkt: Bytes) -> bool {
        self.queue.try_send(pkt).is_ok()
    }

    fn last_recv(&self) -> Instant {
        *self.last_recv.lock()
    }

    fn touch(&self) {
        let mut last = self.last_recv.lock();
        if last.elapsed() >= TOUCH_GRANULARITY {
            *last = Instant::now();
        }
    }

    /// Stop the drain task and close the transport.
    fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.drain.lock().take() {
            handle.abort();
        }
        self.dc.close();
    }
}

struct ConnGroup {
    paths: Vec<Arc<PathConn>>,
    rr_cursor: usize,
}

impl ConnGroup {
    /// Paths that received something within [`ACTIVE_WINDOW`] of the
    /// newest; if none qualify, every path is eligible.
    fn active_paths(&self) -> Vec<Arc<PathConn>> {
        if self.paths.len() <= 1 {
            return self.paths.clone();
        }
        let newest = self
            .paths
            .iter()
            .map(|p| p.last_recv())
            .max()
            .expect("non-empty group");
        let cutoff = newest.checked_sub(ACTIVE_WINDOW);
        let active: Vec<_> = self
            .paths
            .iter()
            .filter(|p| cutoff.map_or(true, |c| p.last_recv() > c))
            .cloned()
            .collect();
        if active.is_empty() {
            self.paths.clone()
        } else {
            active
        }
    }
}

/// Fixed-size ring of packet hashes for duplicate suppression. A linear
/// scan over 4 KB of u32s; runs only for multi-path peers.
struct DedupRing {
    slots: Vec<u32>,
    filled: usize,
    next: usize,
}

impl DedupRing {
    fn new(size: usize) -> Self {
        Self {
            slots: vec![0; size],
            filled: 0,
            next: 0,
        }
    }

    /// True if `hash` was seen recently; registers it otherwise.
    fn check_and_insert(&mut self, hash: u32) -> bool {
        if self.slots[..self.filled].contains(&hash) {
            return true;
        }
        self.slots[self.next] = hash;
        self.next = (self.next + 1) % self.slots.len();
        self.filled = (self.filled + 1).min(self.slots.len());
        false
    }
}

struct TableState {
    by_peer: HashMap<Ipv4Addr, ConnGroup>,
    learned_routes: HashMap<IpAddr, Ipv4Addr>,
}

/// The table itself. Register/unregister/dispatch take the write lock
/// (dispatch advances the round-robin cursor); route learning uses a
/// read-locked fast path.
pub struct ConnectionTable {
    state: RwLock<TableState>,
    dedup: Mutex<DedupRing>,
    dispatch_drops: AtomicU64,
    dedup_hits: AtomicU64,
}

impl ConnectionTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(TableState {
                by_peer: HashMap::new(),
                learned_routes: HashMap::new(),
            }),
            dedup: Mutex::new(DedupRing::new(DEDUP_RING_SIZE)),
            dispatch_drops: AtomicU64::new(0),
            dedup_hits: AtomicU64::new(0),
        })
    }

    /// Register a path for `peer`. A path with the same remote key is
    /// superseded in place (its drain stopped and transport closed);
    /// otherwise the path is appended, making the peer multi-path.
    pub fn register(
        &self,
        peer: Ipv4Addr,
        remote_key: String,
        dc: Arc<dyn DatagramConn>,
        cancel: CancellationToken,
    ) {
        let path = PathConn::new(dc, remote_key.clone(), cancel);
        let superseded = {
            let mut state = self.state.write();
            let group = state.by_peer.entry(peer).or_insert_with(|| ConnGroup {
                paths: Vec::new(),
                rr_cursor: 0,
            });
            match group
                .paths
                .iter_mut()
                .find(|p| p.remote_key == remote_key)
            {
                Some(slot) => Some(std::mem::replace(slot, path)),
                None => {
                    group.paths.push(path);
                    None
                }
            }
        };

        match superseded {
            Some(old) => {
                // Closed outside the lock: transports may wake tasks that
                // re-enter the table.
                old.stop();
                info!(peer = %peer, key = %remote_key, "path superseded");
            }
            None => info!(peer = %peer, key = %remote_key, "path registered"),
        }
    }

    /// Register a stripe session's return path. Identical semantics to
    /// [`register`](Self::register) with a stripe-flavored remote key.
    pub fn register_stripe(
        &self,
        peer: Ipv4Addr,
        remote_key: String,
        dc: Arc<dyn DatagramConn>,
        cancel: CancellationToken,
    ) {
        self.register(peer, remote_key, dc, cancel);
    }

    /// Remove one path. When the peer's last path goes, the peer and every
    /// learned route pointing at it go too.
    pub fn unregister_conn(&self, peer: Ipv4Addr, remote_key: &str) {
        let removed = {
            let mut state = self.state.write();
            let Some(group) = state.by_peer.get_mut(&peer) else {
                return;
            };
            let Some(pos) = group.paths.iter().position(|p| p.remote_key == remote_key)
            else {
                return;
            };
            let removed = group.paths.remove(pos);
            if group.paths.is_empty() {
                state.by_peer.remove(&peer);
                state.learned_routes.retain(|_, &mut p| p != peer);
            }
            removed
        };
        removed.stop();
        info!(peer = %peer, key = %remote_key, "path unregistered");
    }

    /// Remove a peer entirely.
    pub fn unregister(&self, peer: Ipv4Addr) {
        let removed = {
            let mut state = self.state.write();
            let group = state.by_peer.remove(&peer);
            state.learned_routes.retain(|_, &mut p| p != peer);
            group
        };
        if let Some(group) = removed {
            for path in group.paths {
                path.stop();
            }
            info!(peer = %peer, "peer unregistered");
        }
    }

    /// Record that `src` is reachable via `peer`. Fast path under the read
    /// lock; upgrades to write only when new or changed.
    pub fn learn_route(&self, src: IpAddr, peer: Ipv4Addr) {
        {
            let state = self.state.read();
            if state.learned_routes.get(&src) == Some(&peer) {
                return;
            }
        }
        let mut state = self.state.write();
        let previous = state.learned_routes.insert(src, peer);
        if previous != Some(peer) {
            debug!(src = %src, peer = %peer, "learned route");
        }
    }

    /// Refresh a path's receive timestamp (rate-limited internally).
    pub fn touch_path(&self, peer: Ipv4Addr, remote_key: &str) {
        let state = self.state.read();
        if let Some(group) = state.by_peer.get(&peer) {
            if let Some(path) = group.paths.iter().find(|p| p.remote_key == remote_key) {
                path.touch();
            }
        }
    }

    fn resolve_peer(state: &TableState, dst: IpAddr) -> Option<Ipv4Addr> {
        if let IpAddr::V4(v4) = dst {
            if state.by_peer.contains_key(&v4) {
                return Some(v4);
            }
        }
        state.learned_routes.get(&dst).copied()
    }

    /// Resolve the path for `dst` round-robin (ignores the packet).
    pub fn lookup(&self, dst: IpAddr) -> Option<Arc<PathConn>> {
        let mut state = self.state.write();
        let peer = Self::resolve_peer(&state, dst)?;
        let group = state.by_peer.get_mut(&peer)?;
        let active = group.active_paths();
        if active.is_empty() {
            return None;
        }
        let chosen = active[group.rr_cursor % active.len()].clone();
        group.rr_cursor = group.rr_cursor.wrapping_add(1);
        Some(chosen)
    }

    /// Dispatch a TUN packet toward its peer: flow-hash-pinned across the
    /// active paths when the packet hashes, round-robin otherwise.
    /// Enqueue is non-blocking; a full queue drops the packet and counts
    /// it. Returns false when the packet went nowhere.
    pub fn dispatch(&self, dst: IpAddr, pkt: &[u8]) -> bool {
        let chosen = {
            let mut state = self.state.write();
            let Some(peer) = Self::resolve_peer(&state, dst) else {
                return false;
            };
            let Some(group) = state.by_peer.get_mut(&peer) else {
                return false;
            };
            let active = group.active_paths();
            if active.is_empty() {
                return false;
            }
            let index = match flow_hash_packet(pkt) {
                Some(hash) => hash as usize % active.len(),
                None => {
                    let i = group.rr_cursor % active.len();
                    group.rr_cursor = group.rr_cursor.wrapping_add(1);
                    i
                }
            };
            active[index].clone()
        };

        if chosen.try_send(Bytes::copy_from_slice(pkt)) {
            true
        } else {
            self.dispatch_drops.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Duplicate suppression for multi-path peers: true if this packet was
    /// already seen recently.
    pub fn is_duplicate(&self, pkt: &[u8]) -> bool {
        let hash = fnv1a_32(pkt);
        let duplicate = self.dedup.lock().check_and_insert(hash);
        if duplicate {
            self.dedup_hits.fetch_add(1, Ordering::Relaxed);
        }
        duplicate
    }

    /// Number of paths currently registered for `peer`.
    pub fn path_count(&self, peer: Ipv4Addr) -> usize {
        self.state
            .read()
            .by_peer
            .get(&peer)
            .map_or(0, |g| g.paths.len())
    }

    pub fn peer_count(&self) -> usize {
        self.state.read().by_peer.len()
    }

    pub fn learned_route_count(&self) -> usize {
        self.state.read().learned_routes.len()
    }

    pub fn dispatch_drops(&self) -> u64 {
        self.dispatch_drops.load(Ordering::Relaxed)
    }

    pub fn dedup_hits(&self) -> u64 {
        self.dedup_hits.load(Ordering::Relaxed)
    }

    /// Stop every path; used at shutdown.
    pub fn close_all(&self) {
        let groups: Vec<ConnGroup> = {
            let mut state = self.state.write();
            state.learned_routes.clear();
            state.by_peer.drain().map(|(_, g)| g).collect()
        };
        for group in groups {
            for path in group.paths {
                path.stop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_ring_detects_repeats() {
        let mut ring = DedupRing::new(8);
        assert!(!ring.check_and_insert(1));
        assert!(!ring.check_and_insert(2));
        assert!(ring.check_and_insert(1));
        assert!(ring.check_and_insert(2));
    }

    #[test]
    fn dedup_ring_evicts_oldest() {
        let mut ring = DedupRing::new(4);
        for h in 1..=4 {
            assert!(!ring.check_and_insert(h));
        }
        // Inserting a fifth value overwrites slot 0 (hash 1).
        assert!(!ring.check_and_insert(5));
        assert!(!ring.check_and_insert(1), "evicted value is fresh again");
    }

    #[test]
    fn dedup_ring_ignores_unfilled_slots() {
        let mut ring = DedupRing::new(8);
        // Hash 0 equals the unfilled slot sentinel; must still be counted
        // via `filled`, not matched against empty slots.
        assert!(!ring.check_and_insert(0));
        assert!(ring.check_and_insert(0));
    }
}
