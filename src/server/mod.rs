//! Server runtime: QUIC accept loop, per-connection tunnel tasks, and the
//! TUN reader that dispatches return traffic through the connection table.

pub mod table;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::stripe::StripeServer;
use crate::transport::{listen_quic, DatagramConn, QuicDatagramConn, StreamConn};
use crate::tun::TunIo;
use crate::types::TransportMode;
use crate::util::resolve_bind_ip;

pub use table::{ConnectionTable, PathConn};

/// The tunnel server: one QUIC listener, an optional stripe listener, one
/// TUN device, many peers.
pub struct TunnelServer {
    config: Config,
    table: Arc<ConnectionTable>,
    tun: Arc<dyn TunIo>,
    stripe: Option<Arc<StripeServer>>,
    cancel: CancellationToken,
}

impl TunnelServer {
    pub async fn new(
        config: Config,
        tun: Arc<dyn TunIo>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let table = ConnectionTable::new();

        let stripe = if config.stripe_enabled {
            let bind = resolve_bind_ip(&config.bind_ip)?;
            let listen: SocketAddr = (bind, config.stripe_port()).into();
            let server = StripeServer::bind(
                listen,
                config.stripe_data_shards,
                config.stripe_parity_shards,
                config.stripe_auth()?,
                Arc::clone(&table),
                Arc::clone(&tun),
                cancel.child_token(),
            )
            .await?;
            Some(server)
        } else {
            None
        };

        Ok(Self {
            config,
            table,
            tun,
            stripe,
            cancel,
        })
    }

    pub fn table(&self) -> Arc<ConnectionTable> {
        Arc::clone(&self.table)
    }

    pub fn stripe(&self) -> Option<Arc<StripeServer>> {
        self.stripe.clone()
    }

    /// Run until cancelled.
    pub async fn run(&self) -> Result<()> {
        let bind = resolve_bind_ip(&self.config.bind_ip)?;
        let listen: SocketAddr = (bind, self.config.remote_port).into();
        let endpoint = listen_quic(listen, &self.config.tls, self.config.congestion_algorithm)?;
        info!(listen = %listen, tun = %self.config.tun_name, "server listening");

        if let Some(stripe) = &self.stripe {
            tokio::spawn(Arc::clone(stripe).run());
        }

        self.spawn_tun_reader();

        loop {
            let incoming = tokio::select! {
                () = self.cancel.cancelled() => {
                    endpoint.close(0u32.into(), b"shutdown");
                    self.table.close_all();
                    return Ok(());
                }
                incoming = endpoint.accept() => incoming,
            };
            let Some(incoming) = incoming else {
                return Ok(()); // endpoint closed
            };

            let table = Arc::clone(&self.table);
            let tun = Arc::clone(&self.tun);
            let mode = self.config.transport_mode;
            let cancel = self.cancel.child_token();
            tokio::spawn(async move {
                let connection = match incoming.await {
                    Ok(connection) => connection,
                    Err(e) => {
                        debug!(error = %e, "handshake failed");
                        return;
                    }
                };
                let remote = connection.remote_address();
                info!(remote = %remote, "accepted connection");
                if let Err(e) = handle_connection(connection, mode, table, tun, cancel).await {
                    if !e.is_cancelled() {
                        warn!(remote = %remote, error = %e, "tunnel closed");
                    }
                }
            });
        }
    }

    /// Single TUN reader: extract the destination, dispatch through the
    /// table. No buffering here beyond the per-path egress queues; a
    /// failed dispatch is a dropped packet.
    fn spawn_tun_reader(&self) {
        let tun = Arc::clone(&self.tun);
        let table = Arc::clone(&self.table);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let pkt = tokio::select! {
                    () = cancel.cancelled() => return,
                    pkt = tun.read_packet() => pkt,
                };
                let pkt = match pkt {
                    Ok(pkt) => pkt,
                    Err(e) => {
                        if !cancel.is_cancelled() {
                            error!(error = %e, "TUN read failed");
                        }
                        return;
                    }
                };
                let Some(dst) = crate::packet::destination(&pkt) else {
                    continue;
                };
                if !table.dispatch(dst, &pkt) {
                    debug!(dst = %dst, "no route for packet, dropped");
                }
            }
        });
    }
}

/// Serve one client connection: learn the peer identity from the first
/// datagram, register the path, then pump packets to TUN.
async fn handle_connection(
    connection: quinn::Connection,
    mode: TransportMode,
    table: Arc<ConnectionTable>,
    tun: Arc<dyn TunIo>,
    cancel: CancellationToken,
) -> Result<()> {
    let remote_key = connection.remote_address().to_string();
    let dc: Arc<dyn DatagramConn> = match mode {
        TransportMode::Datagram => Arc::new(QuicDatagramConn::new(connection)),
        TransportMode::Reliable => Arc::new(StreamConn::accept(connection).await?),
    };

    // Peer identity: a bare 4-byte registration, or the source address of
    // the first tunneled packet.
    let first = dc.recv_datagram(&cancel).await?;
    let (peer, first_payload) = if first.len() == 4 {
        (
            std::net::Ipv4Addr::new(first[0], first[1], first[2], first[3]),
            None,
        )
    } else {
        let Some(src) = crate::packet::source_v4(&first) else {
            return Err(Error::Protocol(
                crate::error::ProtocolError::MalformedPacket(
                    "first datagram is neither a registration nor IPv4".into(),
                ),
            ));
        };
        (src, Some(first))
    };

    table.register(peer, remote_key.clone(), Arc::clone(&dc), cancel.clone());
    info!(peer = %peer, key = %remote_key, "peer registered");

    let result = async {
        if let Some(pkt) = first_payload {
            deliver_packet(&table, &tun, peer, &remote_key, &pkt).await;
        }
        loop {
            let pkt = dc.recv_datagram(&cancel).await?;
            deliver_packet(&table, &tun, peer, &remote_key, &pkt).await;
        }
    }
    .await;

    table.unregister_conn(peer, &remote_key);
    result
}

/// Per-packet receive path: refresh liveness, suppress duplicates for
/// multi-path peers, learn LAN source routes, write to TUN.
async fn deliver_packet(
    table: &ConnectionTable,
    tun: &Arc<dyn TunIo>,
    peer: std::net::Ipv4Addr,
    remote_key: &str,
    pkt: &Bytes,
) {
    table.touch_path(peer, remote_key);

    if table.path_count(peer) > 1 && table.is_duplicate(pkt) {
        debug!(peer = %peer, "duplicate suppressed");
        return;
    }

    if let Some(src) = crate::packet::source_v4(pkt) {
        if src != peer {
            table.learn_route(src.into(), peer);
        }
    }

    if let Err(e) = tun.write_packet(pkt).await {
        debug!(error = %e, "TUN write failed");
    }
}
