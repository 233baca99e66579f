//! Client runtime: builds the path set, dials everything through the
//! multipath scheduler, and pumps packets between TUN and the tunnel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::multipath::{expand_paths, MultipathConn, PathConfig, PathDialer};
use crate::stripe::client::{StripeClientConn, StripeClientParams};
use crate::transport::{dial_quic, DatagramConn, QuicDatagramConn, StreamConn};
use crate::tun::TunIo;
use crate::types::{TransportKind, TransportMode};
use crate::util::{is_cgnat, resolve_bind_ip};

/// Delay before rebuilding the whole tunnel after a fatal failure.
const RETRY_DELAY: Duration = Duration::from_secs(3);

/// Shared slot exposing the live scheduler to the control API across
/// tunnel rebuilds.
#[derive(Default)]
pub struct SchedulerHandle {
    conn: RwLock<Option<Arc<MultipathConn>>>,
}

impl SchedulerHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, conn: Arc<MultipathConn>) {
        *self.conn.write() = Some(conn);
    }

    pub fn get(&self) -> Option<Arc<MultipathConn>> {
        self.conn.read().clone()
    }

    pub fn clear(&self) {
        *self.conn.write() = None;
    }
}

/// Resolve `auto` transports and apply Starlink defaults, then expand
/// pipes into sibling paths.
pub fn build_paths(config: &Config) -> Result<Vec<PathConfig>> {
    let mut resolved = Vec::new();
    for mut path in config.client_paths() {
        if path.transport == TransportKind::Auto {
            path.transport = TransportKind::Quic;
            if config.detect_starlink {
                if let Ok(std::net::IpAddr::V4(bind)) = resolve_bind_ip(&path.bind) {
                    if is_cgnat(bind) {
                        info!(
                            path = %path.name,
                            bind = %bind,
                            transport = %config.starlink_transport,
                            "CGNAT bind address, assuming Starlink"
                        );
                        path.transport = config.starlink_transport;
                        if path.pipes == 0 {
                            path.pipes = config.starlink_default_pipes;
                        }
                    }
                }
            }
        }
        if path.pipes == 0 {
            path.pipes = 1;
        }
        resolved.push(path);
    }
    Ok(expand_paths(resolved))
}

/// Dials paths for the scheduler: QUIC (datagram or reliable-stream) and
/// striped transports.
pub struct ClientDialer {
    config: Config,
}

impl ClientDialer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    async fn resolve_remote(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| Error::Config(format!("resolve {host}:{port}: {e}")))?
            .collect();
        // Prefer IPv4: paths bind to specific IPv4 uplink addresses.
        addrs.sort_by_key(|a| a.is_ipv6());
        addrs
            .into_iter()
            .next()
            .ok_or_else(|| Error::Config(format!("no addresses for {host}")))
    }

    async fn dial_quic_path(
        &self,
        cfg: &PathConfig,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn DatagramConn>> {
        let bind_ip = resolve_bind_ip(&cfg.bind)?;
        let bind: SocketAddr = (bind_ip, 0).into();
        let remote = self.resolve_remote(&cfg.remote_addr, cfg.remote_port).await?;

        let connection = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            conn = dial_quic(bind, remote, &self.config.tls, self.config.congestion_algorithm) => conn?,
        };

        match self.config.transport_mode {
            TransportMode::Datagram => Ok(Arc::new(QuicDatagramConn::new(connection))),
            TransportMode::Reliable => Ok(Arc::new(StreamConn::open(connection).await?)),
        }
    }

    async fn dial_stripe_path(
        &self,
        cfg: &PathConfig,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn DatagramConn>> {
        let bind_ip = resolve_bind_ip(&cfg.bind)?;
        let server_addr = self
            .resolve_remote(&cfg.remote_addr, self.config.stripe_port())
            .await?;
        // A stripe path with pipes left at 1 still fans out: one socket
        // per session is exactly what the shaper throttles.
        let pipes = if cfg.pipes <= 1 {
            crate::stripe::DEFAULT_PIPES
        } else {
            cfg.pipes
        };

        let conn = StripeClientConn::connect(
            StripeClientParams {
                path_name: cfg.name.clone(),
                bind_ip,
                server_addr,
                tun_ip: self.config.tun_ip()?,
                pipes,
                data_shards: self.config.stripe_data_shards,
                parity_shards: self.config.stripe_parity_shards,
                auth: self.config.stripe_auth()?,
            },
            cancel,
        )
        .await?;
        Ok(conn)
    }
}

#[async_trait]
impl PathDialer for ClientDialer {
    async fn dial(
        &self,
        cfg: &PathConfig,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn DatagramConn>> {
        match cfg.transport {
            TransportKind::Stripe => self.dial_stripe_path(cfg, cancel).await,
            TransportKind::Quic | TransportKind::Auto => self.dial_quic_path(cfg, cancel).await,
        }
    }
}

/// The client tunnel.
pub struct TunnelClient {
    config: Config,
    tun: Arc<dyn TunIo>,
    handle: Arc<SchedulerHandle>,
    cancel: CancellationToken,
}

impl TunnelClient {
    pub fn new(
        config: Config,
        tun: Arc<dyn TunIo>,
        handle: Arc<SchedulerHandle>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            tun,
            handle,
            cancel,
        }
    }

    /// Run until cancelled, rebuilding the tunnel after fatal failures.
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.run_once().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_cancelled() => return Ok(()),
                Err(e) => {
                    error!(error = %e, "tunnel failed, reconnecting in {RETRY_DELAY:?}");
                    tokio::select! {
                        () = self.cancel.cancelled() => return Ok(()),
                        () = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                }
            }
        }
    }

    async fn run_once(&self) -> Result<()> {
        let classifier = Arc::new(self.config.build_classifier()?);
        let paths = build_paths(&self.config)?;
        info!(
            paths = paths.len(),
            policy = %self.config.multipath_policy,
            "starting tunnel"
        );

        let dialer = Arc::new(ClientDialer::new(self.config.clone()));
        let conn = MultipathConn::new(paths, classifier, dialer, self.cancel.child_token());
        conn.start().await?;
        self.handle.set(Arc::clone(&conn));

        crate::telemetry::spawn_client(
            Arc::clone(&conn),
            self.config.telemetry_interval,
            conn.cancel_token().clone(),
        );

        let result = self.pump(&conn).await;
        self.handle.clear();
        conn.close_all();
        result
    }

    /// Move packets TUN→tunnel and tunnel→TUN until something fatal
    /// happens. Per-packet send failures (deadline, no paths) drop the
    /// packet; the reconnector restores paths in the background.
    async fn pump(&self, conn: &Arc<MultipathConn>) -> Result<()> {
        let (tun_err_tx, mut tun_err_rx) = tokio::sync::mpsc::channel::<Error>(1);

        // TUN → tunnel. The task lives and dies with this tunnel instance,
        // not the process: a rebuild must not leave a stale reader racing
        // the new one for TUN packets.
        let tun = Arc::clone(&self.tun);
        let send_conn = Arc::clone(conn);
        let cancel = conn.cancel_token().clone();
        tokio::spawn(async move {
            loop {
                let pkt = tokio::select! {
                    () = cancel.cancelled() => return,
                    pkt = tun.read_packet() => pkt,
                };
                let pkt = match pkt {
                    Ok(pkt) => pkt,
                    Err(e) => {
                        let _ = tun_err_tx.try_send(e);
                        return;
                    }
                };
                match send_conn.send_datagram(&pkt).await {
                    Ok(()) => {}
                    Err(e) if e.is_cancelled() => return,
                    Err(e) => debug!(error = %e, "send failed, packet dropped"),
                }
            }
        });

        // tunnel → TUN
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Err(Error::Cancelled),
                err = tun_err_rx.recv() => {
                    return Err(err.unwrap_or(Error::ConnectionClosed));
                }
                fatal = conn.fatal_error() => {
                    warn!(error = %fatal, "scheduler reported fatal condition");
                    return Err(fatal);
                }
                pkt = conn.recv_datagram() => {
                    let pkt = pkt?;
                    if let Err(e) = self.tun.write_packet(&pkt).await {
                        return Err(e);
                    }
                }
            }
        }
    }
}
