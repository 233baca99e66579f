//! Client side of the striped transport.
//!
//! One `StripeClientConn` serves one multipath path. It opens N UDP
//! sockets on the path's bind address, registers each with the server (the
//! registration doubles as NAT hole punching), and from then on stripes
//! FEC groups across the pipes round-robin. Receive runs one task per pipe
//! feeding a bounded delivery channel; a GC task sweeps incomplete groups.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result, TransportError};
use crate::fec::{frame_shard, FecEncoder, FecGroup, GROUP_TTL};
use crate::transport::DatagramConn;
use crate::{MAX_PACKET, RECV_CHANNEL_CAP};

use super::auth::{ReplayWindow, StripeAuth};
use super::{
    register_payload, session_id, PacketType, StripeHeader, FLUSH_INTERVAL, GC_INTERVAL,
    KEEPALIVE_INTERVAL, REGISTER_DELAY, REGISTER_RETRIES,
};

/// Everything needed to bring up one stripe path.
pub struct StripeClientParams {
    pub path_name: String,
    pub bind_ip: IpAddr,
    pub server_addr: SocketAddr,
    pub tun_ip: std::net::Ipv4Addr,
    pub pipes: usize,
    pub data_shards: usize,
    pub parity_shards: usize,
    pub auth: Option<StripeAuth>,
}

struct TxState {
    group: Vec<Vec<u8>>,
    group_seq: u32,
    next_seq: u32,
    last_enqueue: Instant,
}

/// Striped UDP transport for one path; implements [`DatagramConn`].
pub struct StripeClientConn {
    pipes: Vec<Arc<UdpSocket>>,
    server_addr: SocketAddr,
    session: u32,

    encoder: FecEncoder,
    auth: Option<StripeAuth>,
    auth_seq: AtomicU64,
    replay: Mutex<ReplayWindow>,

    tx: tokio::sync::Mutex<TxState>,
    tx_pipe: AtomicU32,

    rx_groups: Mutex<HashMap<u32, FecGroup>>,
    rx_tx: mpsc::Sender<Bytes>,
    rx_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,

    fec_recovered: AtomicU64,
    cancel: CancellationToken,
}

impl StripeClientConn {
    /// Open the pipes, register them with the server, and start the
    /// receive, keepalive, flush, and GC tasks.
    pub async fn connect(
        params: StripeClientParams,
        parent_cancel: &CancellationToken,
    ) -> Result<Arc<Self>> {
        let pipes_wanted = params.pipes.max(1);
        let session = session_id(params.tun_ip, &params.path_name);
        let encoder = FecEncoder::new(params.data_shards, params.parity_shards)?;

        let mut pipes = Vec::with_capacity(pipes_wanted);
        for i in 0..pipes_wanted {
            let bind: SocketAddr = (params.bind_ip, 0).into();
            let socket = UdpSocket::bind(bind).await.map_err(|e| {
                Error::Transport(TransportError::BindFailed {
                    addr: bind,
                    reason: e.to_string(),
                })
            })?;
            info!(
                pipe = i,
                local = %socket.local_addr()?,
                remote = %params.server_addr,
                "stripe pipe open"
            );
            pipes.push(Arc::new(socket));
        }

        let (rx_tx, rx_rx) = mpsc::channel(RECV_CHANNEL_CAP);
        let conn = Arc::new(Self {
            pipes,
            server_addr: params.server_addr,
            session,
            encoder,
            auth: params.auth,
            auth_seq: AtomicU64::new(0),
            replay: Mutex::new(ReplayWindow::default()),
            tx: tokio::sync::Mutex::new(TxState {
                group: Vec::with_capacity(params.data_shards),
                group_seq: 0,
                next_seq: 0,
                last_enqueue: Instant::now(),
            }),
            tx_pipe: AtomicU32::new(0),
            rx_groups: Mutex::new(HashMap::new()),
            rx_tx,
            rx_rx: tokio::sync::Mutex::new(rx_rx),
            fec_recovered: AtomicU64::new(0),
            cancel: parent_cancel.child_token(),
        });

        conn.register_pipes().await?;

        for (i, pipe) in conn.pipes.iter().enumerate() {
            Self::spawn_rx_pipe(Arc::clone(&conn), i, Arc::clone(pipe));
        }
        Self::spawn_keepalive(Arc::clone(&conn));
        Self::spawn_flush(Arc::clone(&conn));
        Self::spawn_gc(Arc::clone(&conn));

        info!(
            session = format_args!("{session:08x}"),
            pipes = conn.pipes.len(),
            fec = format_args!("{}+{}", conn.encoder.data_shards(), conn.encoder.parity_shards()),
            server = %conn.server_addr,
            "stripe client ready"
        );
        Ok(conn)
    }

    /// Send 3 REGISTER rounds per pipe, 500 ms apart: informs the server of
    /// each pipe's origin address and punches any NAT along the way.
    async fn register_pipes(&self) -> Result<()> {
        let total = self.pipes.len() as u8;
        for round in 0..REGISTER_RETRIES {
            for (i, pipe) in self.pipes.iter().enumerate() {
                let payload = register_payload(self.session, i as u8, total);
                let pkt = StripeHeader {
                    packet_type: PacketType::Register,
                    session_id: self.session,
                    group_seq: 0,
                    shard_idx: 0,
                    group_data_n: 0,
                    data_len: payload.len() as u16,
                }
                .to_packet(&payload);
                let pkt = self.seal(pkt);
                if let Err(e) = pipe.send_to(&pkt, self.server_addr).await {
                    debug!(pipe = i, round, error = %e, "register send failed");
                }
            }
            if round + 1 < REGISTER_RETRIES {
                tokio::select! {
                    () = self.cancel.cancelled() => return Err(Error::Cancelled),
                    () = tokio::time::sleep(REGISTER_DELAY) => {}
                }
            }
        }
        Ok(())
    }

    pub fn session_id(&self) -> u32 {
        self.session
    }

    pub fn fec_recovered(&self) -> u64 {
        self.fec_recovered.load(Ordering::Relaxed)
    }

    fn seal(&self, mut pkt: Vec<u8>) -> Vec<u8> {
        if let Some(auth) = &self.auth {
            let seq = self.auth_seq.fetch_add(1, Ordering::Relaxed);
            auth.seal(self.session, seq, &mut pkt);
        }
        pkt
    }

    /// Verify and strip the auth trailer, enforcing the replay window.
    /// Returns the authenticated body length, or `None` to drop silently.
    fn open_sealed(&self, data: &[u8]) -> Option<usize> {
        let Some(auth) = &self.auth else {
            return Some(data.len());
        };
        let (seq, body_len) = auth.open(self.session, data).ok()?;
        if !self.replay.lock().check_and_register(seq) {
            return None;
        }
        Some(body_len)
    }

    async fn send_to_pipe(&self, pkt: &[u8]) {
        let idx = self.tx_pipe.fetch_add(1, Ordering::Relaxed) as usize % self.pipes.len();
        // Send errors here are not path failures: individual pipes may drop
        // packets and FEC absorbs the loss.
        if let Err(e) = self.pipes[idx].send_to(pkt, self.server_addr).await {
            debug!(pipe = idx, error = %e, "pipe send failed");
        }
    }

    /// Encode and transmit the accumulated group. Caller holds the tx lock.
    async fn send_group_locked(&self, tx: &mut TxState) {
        let group_len = tx.group.len();
        if group_len == 0 {
            return;
        }

        let (data, parity) = match self.encoder.encode_group(&tx.group) {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, "FEC encode failed, dropping group");
                tx.group.clear();
                return;
            }
        };

        let group_data_n = group_len as u8;
        for (i, shard) in data.iter().enumerate() {
            let data_len = u16::from_be_bytes([tx.group[i][0], tx.group[i][1]]);
            let pkt = StripeHeader {
                packet_type: PacketType::Data,
                session_id: self.session,
                group_seq: tx.group_seq,
                shard_idx: i as u8,
                group_data_n,
                data_len,
            }
            .to_packet(shard);
            let pkt = self.seal(pkt);
            self.send_to_pipe(&pkt).await;
        }

        for (i, shard) in parity.iter().enumerate() {
            let pkt = StripeHeader {
                packet_type: PacketType::Parity,
                session_id: self.session,
                group_seq: tx.group_seq,
                shard_idx: (group_len + i) as u8,
                group_data_n,
                data_len: 0,
            }
            .to_packet(shard);
            let pkt = self.seal(pkt);
            self.send_to_pipe(&pkt).await;
        }

        tx.group.clear();
    }

    fn spawn_rx_pipe(conn: Arc<Self>, pipe_idx: usize, socket: Arc<UdpSocket>) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET];
            loop {
                let received = tokio::select! {
                    () = conn.cancel.cancelled() => return,
                    r = socket.recv_from(&mut buf) => r,
                };
                let n = match received {
                    Ok((n, _from)) => n,
                    Err(e) => {
                        if conn.cancel.is_cancelled() {
                            return;
                        }
                        debug!(pipe = pipe_idx, error = %e, "pipe recv error");
                        continue;
                    }
                };

                let Some(body_len) = conn.open_sealed(&buf[..n]) else {
                    continue; // bad auth or replay: drop silently
                };
                let Some(hdr) = StripeHeader::decode(&buf[..body_len]) else {
                    continue;
                };
                let payload = &buf[super::HEADER_LEN..body_len];

                match hdr.packet_type {
                    PacketType::Data => conn.handle_rx_shard(&hdr, payload, false),
                    PacketType::Parity => conn.handle_rx_shard(&hdr, payload, true),
                    // Server keepalive reply: the NAT mapping is alive.
                    PacketType::Keepalive => {}
                    PacketType::Register => {}
                }
            }
        });
    }

    fn handle_rx_shard(&self, hdr: &StripeHeader, payload: &[u8], is_parity: bool) {
        // Partial group: fewer than K data shards were sent, no parity
        // exists, deliver directly.
        if !is_parity && usize::from(hdr.group_data_n) < self.encoder.data_shards() {
            self.deliver_direct(hdr, payload);
            return;
        }
        if !self.encoder.has_parity() {
            if !is_parity {
                self.deliver_direct(hdr, payload);
            }
            return;
        }

        let ready = {
            let mut groups = self.rx_groups.lock();
            let group = groups.entry(hdr.group_seq).or_insert_with(|| {
                FecGroup::new(self.encoder.data_shards(), self.encoder.parity_shards())
            });
            let decodable = group.add_shard(usize::from(hdr.shard_idx), payload);
            if decodable && group.mark_delivered() {
                groups.remove(&hdr.group_seq)
            } else {
                None
            }
        };

        if let Some(mut group) = ready {
            match group.decode(&self.encoder) {
                Ok((packets, recovered)) => {
                    if recovered {
                        self.fec_recovered.fetch_add(1, Ordering::Relaxed);
                    }
                    for pkt in packets {
                        self.deliver(pkt);
                    }
                }
                Err(e) => debug!(group = hdr.group_seq, error = %e, "FEC decode failed"),
            }
        }
    }

    fn deliver_direct(&self, hdr: &StripeHeader, payload: &[u8]) {
        if hdr.data_len == 0 || payload.len() < 2 + usize::from(hdr.data_len) {
            return;
        }
        self.deliver(payload[2..2 + usize::from(hdr.data_len)].to_vec());
    }

    fn deliver(&self, pkt: Vec<u8>) {
        // Bounded channel: drop on overflow rather than blocking the pipe
        // receive task.
        let _ = self.rx_tx.try_send(Bytes::from(pkt));
    }

    fn spawn_keepalive(conn: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = conn.cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                for pipe in &conn.pipes {
                    let pkt = StripeHeader::control(PacketType::Keepalive, conn.session)
                        .to_packet(&[]);
                    let pkt = conn.seal(pkt);
                    let _ = pipe.send_to(&pkt, conn.server_addr).await;
                }
            }
        });
    }

    /// Partial groups are flushed once the group has been idle for the
    /// flush interval, so short bursts don't wait for a full K shards.
    fn spawn_flush(conn: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = conn.cancel.cancelled() => return,
                    () = tokio::time::sleep(FLUSH_INTERVAL) => {}
                }
                let mut tx = conn.tx.lock().await;
                if !tx.group.is_empty() && tx.last_enqueue.elapsed() >= FLUSH_INTERVAL {
                    conn.send_group_locked(&mut *tx).await;
                }
            }
        });
    }

    fn spawn_gc(conn: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(GC_INTERVAL);
            loop {
                tokio::select! {
                    () = conn.cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let expired: Vec<FecGroup> = {
                    let mut groups = conn.rx_groups.lock();
                    let old: Vec<u32> = groups
                        .iter()
                        .filter(|(_, g)| g.age() > GROUP_TTL)
                        .map(|(&seq, _)| seq)
                        .collect();
                    old.into_iter().filter_map(|seq| groups.remove(&seq)).collect()
                };
                // Deliver whatever data shards the stale groups already had.
                for group in expired {
                    for pkt in group.extract_packets() {
                        conn.deliver(pkt);
                    }
                }
            }
        });
    }
}

#[async_trait]
impl DatagramConn for StripeClientConn {
    async fn send_datagram(&self, pkt: &[u8]) -> Result<()> {
        let mut tx = self.tx.lock().await;
        let seq = tx.next_seq;
        tx.next_seq = tx.next_seq.wrapping_add(1);
        if tx.group.is_empty() {
            tx.group_seq = seq;
        }
        tx.group.push(frame_shard(pkt));
        tx.last_enqueue = Instant::now();

        if tx.group.len() >= self.encoder.data_shards() {
            self.send_group_locked(&mut *tx).await;
        }
        Ok(())
    }

    async fn recv_datagram(&self, cancel: &CancellationToken) -> Result<Bytes> {
        let mut rx = self.rx_rx.lock().await;
        tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled),
            () = self.cancel.cancelled() => Err(Error::ConnectionClosed),
            pkt = rx.recv() => pkt.ok_or(Error::ConnectionClosed),
        }
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}
