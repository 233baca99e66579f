//! Periodic telemetry.
//!
//! Every interval (10 s by default) a structured summary goes to the log:
//! per-path counters and liveness, per-base-path aggregates when a path
//! was expanded into pipes, and per-class send counters. The server logs
//! its connection-table and stripe-session counters instead.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::multipath::MultipathConn;
use crate::server::ConnectionTable;
use crate::stripe::StripeServer;
use crate::types::PathStats;

/// Spawn the client-side telemetry task.
pub fn spawn_client(conn: Arc<MultipathConn>, interval: Duration, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The immediate first tick would log an all-zero summary.
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            log_client_summary(&conn);
        }
    });
}

fn log_client_summary(conn: &MultipathConn) {
    let snapshots = conn.path_snapshots();

    for path in &snapshots {
        info!(
            path = %path.name,
            alive = path.alive,
            reconnecting = path.reconnecting,
            tx_pkts = path.stats.tx_packets,
            rx_pkts = path.stats.rx_packets,
            tx_err = path.stats.tx_errors,
            rx_err = path.stats.rx_errors,
            fails = path.consecutive_fails,
            cooldown_ms = path.cooldown_remaining.as_millis() as u64,
            up_for = path.last_up.map(|t| t.elapsed().as_secs()),
            down_for = path.last_down.map(|t| t.elapsed().as_secs()),
            "path"
        );
    }

    // Aggregate expanded pipes under their base path.
    let mut bases: BTreeMap<String, (usize, usize, PathStats)> = BTreeMap::new();
    for path in &snapshots {
        let entry = bases
            .entry(path.base_name.clone())
            .or_insert((0, 0, PathStats::default()));
        entry.0 += 1;
        entry.1 += usize::from(path.alive);
        entry.2.add(&path.stats);
    }
    for (base, (total, alive, stats)) in bases {
        if total > 1 {
            info!(
                base = %base,
                pipes = total,
                alive,
                tx_pkts = stats.tx_packets,
                rx_pkts = stats.rx_packets,
                tx_err = stats.tx_errors,
                rx_err = stats.rx_errors,
                "base path"
            );
        }
    }

    for (class, stats) in conn.class_counters() {
        info!(
            class = %class,
            tx_pkts = stats.tx_packets,
            tx_err = stats.tx_errors,
            tx_dups = stats.tx_duplicates,
            "class"
        );
    }
}

/// Spawn the server-side telemetry task.
pub fn spawn_server(
    table: Arc<ConnectionTable>,
    stripe: Option<Arc<StripeServer>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            info!(
                peers = table.peer_count(),
                learned_routes = table.learned_route_count(),
                dispatch_drops = table.dispatch_drops(),
                dedup_hits = table.dedup_hits(),
                stripe_sessions = stripe.as_ref().map(|s| s.session_count()),
                "server"
            );
        }
    });
}
