//! Per-path reconnection.
//!
//! Each failing path gets one independent reconnect task. The task holds
//! the scheduler by `Arc` and re-looks-up its path by index under the lock
//! on every attempt; it installs nothing while cancelled.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::Result;
use crate::transport::DatagramConn;

use super::scheduler::MultipathConn;
use super::{PathConfig, RECONNECT_BACKOFF};

/// Dials one path end-to-end: bind resolution, remote resolution, TLS,
/// QUIC (or stripe) setup. Implemented by the client runtime; test doubles
/// substitute channel-backed transports.
#[async_trait]
pub trait PathDialer: Send + Sync {
    async fn dial(
        &self,
        cfg: &PathConfig,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn DatagramConn>>;
}

/// Start the reconnect task for `index`. The caller must already have set
/// `reconnecting = true` under the state lock, which guarantees at most one
/// task per path.
pub fn spawn_reconnect(conn: Arc<MultipathConn>, index: usize) {
    tokio::spawn(async move {
        reconnect_loop(&conn, index).await;
    });
}

async fn reconnect_loop(conn: &Arc<MultipathConn>, index: usize) {
    let cfg: PathConfig = conn.state().read()[index].cfg.clone();
    let cancel = conn.cancel_token().clone();
    let dialer = conn.dialer();

    loop {
        if cancel.is_cancelled() {
            conn.state().write()[index].reconnecting = false;
            return;
        }

        match dialer.dial(&cfg, &cancel).await {
            Ok(dc) => {
                conn.state().write()[index].install(dc);
                info!(path = %cfg.name, "path reconnected");
                return;
            }
            Err(e) if e.is_cancelled() => {
                conn.state().write()[index].reconnecting = false;
                return;
            }
            Err(e) => {
                error!(path = %cfg.name, error = %e, "reconnect failed");
                tokio::select! {
                    () = cancel.cancelled() => {
                        conn.state().write()[index].reconnecting = false;
                        return;
                    }
                    () = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                }
            }
        }
    }
}
