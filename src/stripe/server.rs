//! Server side of the striped transport.
//!
//! One UDP socket on the stripe port serves every striped client. Each
//! client path is a session keyed by its 32-bit session id; REGISTER
//! packets record the origin address of each pipe so the return direction
//! can stripe across them. Decoded packets flow through a per-session
//! channel into a TUN-writer task that also learns source routes for LAN
//! traffic behind the peer.
//!
//! The return direction is a [`StripeServerConn`] registered in the
//! connection table as a regular path, so `dispatch()` routes TUN packets
//! back through the stripe exactly like a QUIC path.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
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

use crate::error::{Error, Result};
use crate::fec::{frame_shard, FecEncoder, FecGroup, GROUP_TTL};
use crate::server::ConnectionTable;
use crate::transport::DatagramConn;
use crate::tun::TunIo;
use crate::{MAX_PACKET, RECV_CHANNEL_CAP};

use super::auth::{ReplayWindow, StripeAuth};
use super::{
    PacketType, StripeHeader, FLUSH_INTERVAL, GC_INTERVAL, HEADER_LEN, REGISTER_PAYLOAD_LEN,
    SESSION_TIMEOUT,
};

struct TxState {
    group: Vec<Vec<u8>>,
    group_seq: u32,
    next_seq: u32,
    last_enqueue: Instant,
}

/// Per-client-path state on the server.
pub struct StripeSession {
    session_id: u32,
    peer_ip: Ipv4Addr,

    pipes: Mutex<Vec<Option<SocketAddr>>>,
    total_pipes: usize,

    encoder: FecEncoder,
    replay: Mutex<ReplayWindow>,

    rx_groups: Mutex<HashMap<u32, FecGroup>>,
    rx_tx: mpsc::Sender<Bytes>,

    tx: tokio::sync::Mutex<TxState>,
    tx_pipe: AtomicU32,
    auth_seq: AtomicU64,

    last_activity: Mutex<Instant>,
    fec_recovered: AtomicU64,
    cancel: CancellationToken,
}

impl StripeSession {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_for(&self) -> std::time::Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn peer_ip(&self) -> Ipv4Addr {
        self.peer_ip
    }

    pub fn fec_recovered(&self) -> u64 {
        self.fec_recovered.load(Ordering::Relaxed)
    }

    fn remote_key(&self) -> String {
        format!("stripe:{:08x}", self.session_id)
    }

    fn active_pipes(&self) -> Vec<SocketAddr> {
        self.pipes.lock().iter().flatten().copied().collect()
    }

    fn deliver(&self, pkt: Vec<u8>) {
        // Bounded: drop on overflow instead of stalling the receive loop.
        let _ = self.rx_tx.try_send(Bytes::from(pkt));
    }
}

/// The UDP listener plus session registry.
pub struct StripeServer {
    socket: Arc<UdpSocket>,
    state: Mutex<ServerState>,

    data_shards: usize,
    parity_shards: usize,
    auth: Option<StripeAuth>,

    table: Arc<ConnectionTable>,
    tun: Arc<dyn TunIo>,
    cancel: CancellationToken,
}

struct ServerState {
    sessions: HashMap<u32, Arc<StripeSession>>,
    addr_to_session: HashMap<SocketAddr, u32>,
}

impl StripeServer {
    pub async fn bind(
        listen: SocketAddr,
        data_shards: usize,
        parity_shards: usize,
        auth: Option<StripeAuth>,
        table: Arc<ConnectionTable>,
        tun: Arc<dyn TunIo>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(listen).await?;
        info!(
            listen = %socket.local_addr()?,
            fec = format_args!("{data_shards}+{parity_shards}"),
            "stripe server listening"
        );
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            state: Mutex::new(ServerState {
                sessions: HashMap::new(),
                addr_to_session: HashMap::new(),
            }),
            data_shards,
            parity_shards,
            auth,
            table,
            tun,
            cancel,
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Main receive loop; run as a task.
    pub async fn run(self: Arc<Self>) {
        Self::spawn_gc(Arc::clone(&self));

        let mut buf = vec![0u8; MAX_PACKET];
        loop {
            let received = tokio::select! {
                () = self.cancel.cancelled() => return,
                r = self.socket.recv_from(&mut buf) => r,
            };
            let (n, from) = match received {
                Ok(pair) => pair,
                Err(e) => {
                    if self.cancel.is_cancelled() {
                        return;
                    }
                    debug!(error = %e, "stripe server recv error");
                    continue;
                }
            };

            // The header is read before authentication only to learn the
            // claimed session id; the tag binds it, so a forged id fails
            // verification.
            let Some(claimed) = StripeHeader::decode(&buf[..n]) else {
                continue;
            };
            let Some(body_len) = self.open_sealed(claimed.session_id, &buf[..n]) else {
                continue; // bad auth or replay: drop, no ack
            };
            let Some(hdr) = StripeHeader::decode(&buf[..body_len]) else {
                continue;
            };
            let payload = &buf[HEADER_LEN..body_len];

            match hdr.packet_type {
                PacketType::Register => self.handle_register(&hdr, payload, from).await,
                PacketType::Data => self.handle_shard(&hdr, payload, from, false),
                PacketType::Parity => self.handle_shard(&hdr, payload, from, true),
                PacketType::Keepalive => self.handle_keepalive(&hdr, from).await,
            }
        }
    }

    fn open_sealed(&self, session_id: u32, data: &[u8]) -> Option<usize> {
        let Some(auth) = &self.auth else {
            return Some(data.len());
        };
        let (seq, body_len) = auth.open(session_id, data).ok()?;
        // Replay state lives with the session; pre-session packets
        // (REGISTER) check against a window created on first contact.
        let session = self.state.lock().sessions.get(&session_id).cloned();
        match session {
            Some(session) => {
                if !session.replay.lock().check_and_register(seq) {
                    return None;
                }
            }
            None => {
                // No session yet: nothing to replay against; the REGISTER
                // handler creates the window with the session.
            }
        }
        Some(body_len)
    }

    async fn handle_register(&self, hdr: &StripeHeader, payload: &[u8], from: SocketAddr) {
        if payload.len() < REGISTER_PAYLOAD_LEN {
            return;
        }
        let peer_ip = Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]);
        let pipe_idx = usize::from(payload[4]);
        let total_pipes = usize::from(payload[5]).max(1);
        let session_id = hdr.session_id;

        let session = {
            let mut state = self.state.lock();
            let session = match state.sessions.get(&session_id) {
                Some(existing) => Arc::clone(existing),
                None => match self.create_session(session_id, peer_ip, total_pipes) {
                    Ok(created) => {
                        state.sessions.insert(session_id, Arc::clone(&created));
                        created
                    }
                    Err(e) => {
                        debug!(session = format_args!("{session_id:08x}"), error = %e,
                            "session create failed");
                        return;
                    }
                },
            };

            if pipe_idx < session.total_pipes {
                session.pipes.lock()[pipe_idx] = Some(from);
                state.addr_to_session.insert(from, session_id);
                info!(
                    session = format_args!("{session_id:08x}"),
                    pipe = pipe_idx,
                    total = session.total_pipes,
                    from = %from,
                    "stripe pipe registered"
                );
            }
            session
        };
        session.touch();

        // Confirm with a keepalive; the reply also punches the NAT.
        self.send_control(PacketType::Keepalive, &session, from).await;
    }

    /// Build a session with its FEC encoder, return-direction conn, flush
    /// timer, and TUN-writer task. Caller holds the registry lock and
    /// inserts the result.
    fn create_session(
        &self,
        session_id: u32,
        peer_ip: Ipv4Addr,
        total_pipes: usize,
    ) -> Result<Arc<StripeSession>> {
        let encoder = FecEncoder::new(self.data_shards, self.parity_shards)?;
        let (rx_tx, rx_rx) = mpsc::channel(RECV_CHANNEL_CAP);
        let cancel = self.cancel.child_token();

        let session = Arc::new(StripeSession {
            session_id,
            peer_ip,
            pipes: Mutex::new(vec![None; total_pipes]),
            total_pipes,
            encoder,
            replay: Mutex::new(ReplayWindow::default()),
            rx_groups: Mutex::new(HashMap::new()),
            rx_tx,
            tx: tokio::sync::Mutex::new(TxState {
                group: Vec::with_capacity(self.data_shards),
                group_seq: 0,
                next_seq: 0,
                last_enqueue: Instant::now(),
            }),
            tx_pipe: AtomicU32::new(0),
            auth_seq: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
            fec_recovered: AtomicU64::new(0),
            cancel: cancel.clone(),
        });

        let conn = Arc::new(StripeServerConn {
            session: Arc::clone(&session),
            socket: Arc::clone(&self.socket),
            auth: self.auth.clone(),
        });

        // Return path: the connection table treats the stripe session like
        // any other path of this peer.
        self.table.register_stripe(
            peer_ip,
            session.remote_key(),
            Arc::clone(&conn) as Arc<dyn DatagramConn>,
            cancel.clone(),
        );

        StripeServerConn::spawn_session_flush(Arc::clone(&conn));
        self.spawn_tun_writer(Arc::clone(&session), rx_rx);

        info!(
            peer = %peer_ip,
            session = format_args!("{session_id:08x}"),
            pipes = total_pipes,
            "stripe session created"
        );
        Ok(session)
    }

    /// Drain decoded packets to TUN, learning source routes on the way.
    fn spawn_tun_writer(&self, session: Arc<StripeSession>, mut rx: mpsc::Receiver<Bytes>) {
        let tun = Arc::clone(&self.tun);
        let table = Arc::clone(&self.table);
        tokio::spawn(async move {
            loop {
                let pkt = tokio::select! {
                    () = session.cancel.cancelled() => return,
                    pkt = rx.recv() => pkt,
                };
                let Some(pkt) = pkt else { return };

                if let Some(src) = crate::packet::source_v4(&pkt) {
                    if src != session.peer_ip {
                        table.learn_route(src.into(), session.peer_ip);
                    }
                }
                if let Err(e) = tun.write_packet(&pkt).await {
                    debug!(error = %e, "stripe TUN write failed");
                }
            }
        });
    }

    fn handle_shard(&self, hdr: &StripeHeader, payload: &[u8], from: SocketAddr, is_parity: bool) {
        let Some(session) = self.lookup_session(hdr.session_id, from) else {
            return;
        };
        session.touch();

        // Partial group or no parity configured: deliver directly.
        if (!is_parity && usize::from(hdr.group_data_n) < session.encoder.data_shards())
            || !session.encoder.has_parity()
        {
            if !is_parity && hdr.data_len > 0 && payload.len() >= 2 + usize::from(hdr.data_len) {
                session.deliver(payload[2..2 + usize::from(hdr.data_len)].to_vec());
            }
            return;
        }

        let ready = {
            let mut groups = session.rx_groups.lock();
            let group = groups.entry(hdr.group_seq).or_insert_with(|| {
                FecGroup::new(
                    session.encoder.data_shards(),
                    session.encoder.parity_shards(),
                )
            });
            let decodable = group.add_shard(usize::from(hdr.shard_idx), payload);
            if decodable && group.mark_delivered() {
                groups.remove(&hdr.group_seq)
            } else {
                None
            }
        };

        if let Some(mut group) = ready {
            match group.decode(&session.encoder) {
                Ok((packets, recovered)) => {
                    if recovered {
                        session.fec_recovered.fetch_add(1, Ordering::Relaxed);
                    }
                    for pkt in packets {
                        session.deliver(pkt);
                    }
                }
                Err(e) => {
                    debug!(group = hdr.group_seq, error = %e, "stripe FEC decode failed");
                }
            }
        }
    }

    async fn handle_keepalive(&self, hdr: &StripeHeader, from: SocketAddr) {
        if let Some(session) = self.lookup_session(hdr.session_id, from) {
            session.touch();
            self.send_control(PacketType::Keepalive, &session, from).await;
        }
    }

    async fn send_control(&self, packet_type: PacketType, session: &StripeSession, to: SocketAddr) {
        let mut pkt = StripeHeader::control(packet_type, session.session_id).to_packet(&[]);
        if let Some(auth) = &self.auth {
            let seq = session.auth_seq.fetch_add(1, Ordering::Relaxed);
            auth.seal(session.session_id, seq, &mut pkt);
        }
        let _ = self.socket.send_to(&pkt, to).await;
    }

    /// Resolve a session: origin-address index first (fast, NAT-proof),
    /// header session id as the fallback.
    fn lookup_session(&self, session_id: u32, from: SocketAddr) -> Option<Arc<StripeSession>> {
        let state = self.state.lock();
        if let Some(&id) = state.addr_to_session.get(&from) {
            if let Some(session) = state.sessions.get(&id) {
                return Some(Arc::clone(session));
            }
        }
        state.sessions.get(&session_id).cloned()
    }

    fn spawn_gc(server: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(GC_INTERVAL);
            loop {
                tokio::select! {
                    () = server.cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                server.run_gc();
            }
        });
    }

    fn run_gc(&self) {
        let mut expired: Vec<Arc<StripeSession>> = Vec::new();
        {
            let mut state = self.state.lock();
            let dead: Vec<u32> = state
                .sessions
                .iter()
                .filter(|(_, s)| s.idle_for() > SESSION_TIMEOUT)
                .map(|(&id, _)| id)
                .collect();
            for id in dead {
                if let Some(session) = state.sessions.remove(&id) {
                    state.addr_to_session.retain(|_, &mut sid| sid != id);
                    expired.push(session);
                }
            }
        }

        for session in expired {
            info!(
                session = format_args!("{:08x}", session.session_id),
                peer = %session.peer_ip,
                idle = ?session.idle_for(),
                "stripe session expired"
            );
            // Stops the flush timer and the TUN writer; dropping the last
            // sender closes the rx channel.
            session.cancel.cancel();
            self.table
                .unregister_conn(session.peer_ip, &session.remote_key());
        }

        // Sweep stale FEC groups inside live sessions, delivering whatever
        // data they hold.
        let sessions: Vec<Arc<StripeSession>> = {
            let state = self.state.lock();
            state.sessions.values().cloned().collect()
        };
        for session in sessions {
            let stale: Vec<FecGroup> = {
                let mut groups = session.rx_groups.lock();
                let old: Vec<u32> = groups
                    .iter()
                    .filter(|(_, g)| g.age() > GROUP_TTL)
                    .map(|(&seq, _)| seq)
                    .collect();
                old.into_iter().filter_map(|seq| groups.remove(&seq)).collect()
            };
            for group in stale {
                for pkt in group.extract_packets() {
                    session.deliver(pkt);
                }
            }
        }
    }

    /// Number of live sessions; exported to telemetry.
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }
}

/// Return-direction datagram connection for one stripe session: encodes
/// and stripes TUN packets across the client's registered pipe addresses.
pub struct StripeServerConn {
    session: Arc<StripeSession>,
    socket: Arc<UdpSocket>,
    auth: Option<StripeAuth>,
}

impl StripeServerConn {
    fn seal(&self, mut pkt: Vec<u8>) -> Vec<u8> {
        if let Some(auth) = &self.auth {
            let seq = self.session.auth_seq.fetch_add(1, Ordering::Relaxed);
            auth.seal(self.session.session_id, seq, &mut pkt);
        }
        pkt
    }

    /// Encode and transmit the accumulated group across the registered
    /// pipes. Caller holds the session tx lock.
    async fn send_group_locked(&self, tx: &mut TxState) {
        let group_len = tx.group.len();
        if group_len == 0 {
            return;
        }
        let pipes = self.session.active_pipes();
        if pipes.is_empty() {
            // No pipe has registered yet; nothing to stripe across.
            tx.group.clear();
            return;
        }

        let (data, parity) = match self.session.encoder.encode_group(&tx.group) {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, "stripe server FEC encode failed");
                tx.group.clear();
                return;
            }
        };

        let group_data_n = group_len as u8;
        let session_id = self.session.session_id;
        for (i, shard) in data.iter().enumerate() {
            let data_len = u16::from_be_bytes([tx.group[i][0], tx.group[i][1]]);
            let pkt = StripeHeader {
                packet_type: PacketType::Data,
                session_id,
                group_seq: tx.group_seq,
                shard_idx: i as u8,
                group_data_n,
                data_len,
            }
            .to_packet(shard);
            let pkt = self.seal(pkt);
            self.send_to_pipe(&pipes, &pkt).await;
        }
        for (i, shard) in parity.iter().enumerate() {
            let pkt = StripeHeader {
                packet_type: PacketType::Parity,
                session_id,
                group_seq: tx.group_seq,
                shard_idx: (group_len + i) as u8,
                group_data_n,
                data_len: 0,
            }
            .to_packet(shard);
            let pkt = self.seal(pkt);
            self.send_to_pipe(&pipes, &pkt).await;
        }

        tx.group.clear();
    }

    async fn send_to_pipe(&self, pipes: &[SocketAddr], pkt: &[u8]) {
        let idx = self.session.tx_pipe.fetch_add(1, Ordering::Relaxed) as usize % pipes.len();
        if let Err(e) = self.socket.send_to(pkt, pipes[idx]).await {
            debug!(pipe = idx, error = %e, "stripe server pipe send failed");
        }
    }

    fn spawn_session_flush(conn: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = conn.session.cancel.cancelled() => return,
                    () = tokio::time::sleep(FLUSH_INTERVAL) => {}
                }
                let mut tx = conn.session.tx.lock().await;
                if !tx.group.is_empty() && tx.last_enqueue.elapsed() >= FLUSH_INTERVAL {
                    conn.send_group_locked(&mut *tx).await;
                }
            }
        });
    }
}

#[async_trait]
impl DatagramConn for StripeServerConn {
    async fn send_datagram(&self, pkt: &[u8]) -> Result<()> {
        let mut tx = self.session.tx.lock().await;
        let seq = tx.next_seq;
        tx.next_seq = tx.next_seq.wrapping_add(1);
        if tx.group.is_empty() {
            tx.group_seq = seq;
        }
        tx.group.push(frame_shard(pkt));
        tx.last_enqueue = Instant::now();

        if tx.group.len() >= self.session.encoder.data_shards() {
            self.send_group_locked(&mut *tx).await;
        }
        Ok(())
    }

    /// The receive direction of a stripe session is drained by the
    /// session's TUN-writer task, not through the connection table; this
    /// only resolves on shutdown.
    async fn recv_datagram(&self, cancel: &CancellationToken) -> Result<Bytes> {
        tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled),
            () = self.session.cancel.cancelled() => Err(Error::ConnectionClosed),
        }
    }

    fn close(&self) {
        self.session.cancel.cancel();
    }
}
