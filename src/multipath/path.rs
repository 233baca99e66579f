//! Per-path lifecycle state.

use std::sync::Arc;
use std::time::Instant;

use crate::transport::DatagramConn;
use crate::types::PathStats;

use super::{PathConfig, COOLDOWN_STEP, MAX_CONSECUTIVE_FAILS};

/// Mutable state of one path, guarded by the scheduler's path-array lock.
pub struct PathState {
    pub cfg: PathConfig,

    /// Current transport handle; `None` while disconnected.
    pub dc: Option<Arc<dyn DatagramConn>>,

    pub alive: bool,
    pub reconnecting: bool,

    /// Saturates at [`MAX_CONSECUTIVE_FAILS`].
    pub consecutive_fails: u32,

    /// The path is not selectable until this instant.
    pub cooldown_until: Instant,

    pub tx_packets: u64,
    pub rx_packets: u64,
    pub tx_errors: u64,
    pub rx_errors: u64,

    pub last_up: Option<Instant>,
    pub last_down: Option<Instant>,
}

impl PathState {
    pub fn new(cfg: PathConfig) -> Self {
        Self {
            cfg,
            dc: None,
            alive: false,
            reconnecting: false,
            consecutive_fails: 0,
            cooldown_until: Instant::now(),
            tx_packets: 0,
            rx_packets: 0,
            tx_errors: 0,
            rx_errors: 0,
            last_up: None,
            last_down: None,
        }
    }

    /// Install a freshly dialed transport. Called on initial dial and on
    /// successful reconnect.
    pub fn install(&mut self, dc: Arc<dyn DatagramConn>) {
        self.dc = Some(dc);
        self.alive = true;
        self.reconnecting = false;
        self.consecutive_fails = self.consecutive_fails.saturating_sub(1);
        self.last_up = Some(Instant::now());
    }

    /// Record a send/receive failure and detach the transport handle for
    /// closing. The caller must close the returned handle *after* dropping
    /// the state lock: closing triggers receive-task errors that re-enter
    /// this lock.
    pub fn mark_down(&mut self) -> Option<Arc<dyn DatagramConn>> {
        self.alive = false;
        self.last_down = Some(Instant::now());
        self.consecutive_fails = (self.consecutive_fails + 1).min(MAX_CONSECUTIVE_FAILS);
        self.cooldown_until = Instant::now() + COOLDOWN_STEP * self.consecutive_fails;
        self.dc.take()
    }

    /// Receive success feedback: a working path slowly sheds its failure
    /// history.
    pub fn mark_rx_success(&mut self) {
        self.rx_packets += 1;
        self.consecutive_fails = self.consecutive_fails.saturating_sub(1);
    }

    /// Whether this path can be picked right now (ignoring class filters).
    pub fn selectable(&self, now: Instant) -> bool {
        self.alive && self.dc.is_some() && now >= self.cooldown_until
    }

    /// Scheduler score; smaller is better.
    pub fn score(&self, policy: crate::types::SchedulerPolicy) -> i64 {
        use crate::types::SchedulerPolicy;

        let base = i64::from(self.cfg.priority) * 1000;
        let fail_penalty = i64::from(self.consecutive_fails) * 100;
        let weight_bonus = match policy {
            SchedulerPolicy::Priority => i64::from(self.cfg.weight.saturating_sub(1)) * 10,
            SchedulerPolicy::Failover => 0,
            SchedulerPolicy::Balanced => i64::from(self.cfg.weight.saturating_sub(1)) * 120,
        };
        base + fail_penalty - weight_bonus
    }

    pub fn stats(&self) -> PathStats {
        PathStats {
            tx_packets: self.tx_packets,
            rx_packets: self.rx_packets,
            tx_errors: self.tx_errors,
            rx_errors: self.rx_errors,
        }
    }

    pub fn snapshot(&self) -> PathSnapshot {
        let now = Instant::now();
        PathSnapshot {
            name: self.cfg.name.clone(),
            base_name: self.cfg.base_name.clone(),
            alive: self.alive,
            reconnecting: self.reconnecting,
            consecutive_fails: self.consecutive_fails,
            cooldown_remaining: self.cooldown_until.saturating_duration_since(now),
            stats: self.stats(),
            last_up: self.last_up,
            last_down: self.last_down,
        }
    }
}

/// Point-in-time copy of a path's state for telemetry and the control API.
#[derive(Debug, Clone)]
pub struct PathSnapshot {
    pub name: String,
    pub base_name: String,
    pub alive: bool,
    pub reconnecting: bool,
    pub consecutive_fails: u32,
    pub cooldown_remaining: std::time::Duration,
    pub stats: PathStats,
    pub last_up: Option<Instant>,
    pub last_down: Option<Instant>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SchedulerPolicy, TransportKind};
    use std::time::Duration;

    fn cfg(priority: u32, weight: u32) -> PathConfig {
        PathConfig {
            name: "p".into(),
            base_name: "p".into(),
            bind: "10.0.0.1".into(),
            remote_addr: "192.0.2.1".into(),
            remote_port: 4433,
            priority,
            weight,
            pipes: 1,
            transport: TransportKind::Quic,
        }
    }

    #[test]
    fn cooldown_grows_linearly_and_saturates() {
        let mut path = PathState::new(cfg(1, 1));
        for expected in 1..=6u32 {
            let before = Instant::now();
            path.mark_down();
            assert_eq!(path.consecutive_fails, expected);
            let cooldown = path.cooldown_until.duration_since(before);
            assert!(cooldown >= Duration::from_secs(u64::from(expected)) - Duration::from_millis(50));
            assert!(cooldown <= Duration::from_secs(u64::from(expected)) + Duration::from_millis(50));
        }
        // Saturation at 6.
        path.mark_down();
        assert_eq!(path.consecutive_fails, 6);
    }

    #[test]
    fn rx_success_decrements_fails() {
        let mut path = PathState::new(cfg(1, 1));
        path.mark_down();
        path.mark_down();
        assert_eq!(path.consecutive_fails, 2);
        path.mark_rx_success();
        assert_eq!(path.consecutive_fails, 1);
        path.mark_rx_success();
        path.mark_rx_success();
        assert_eq!(path.consecutive_fails, 0, "saturates at zero");
    }

    #[test]
    fn score_by_policy() {
        let mut path = PathState::new(cfg(2, 5));
        assert_eq!(path.score(SchedulerPolicy::Priority), 2000 - 40);
        assert_eq!(path.score(SchedulerPolicy::Failover), 2000);
        assert_eq!(path.score(SchedulerPolicy::Balanced), 2000 - 480);

        path.consecutive_fails = 3;
        assert_eq!(path.score(SchedulerPolicy::Failover), 2000 + 300);
    }

    #[test]
    fn selectable_requires_alive_handle_and_no_cooldown() {
        let mut path = PathState::new(cfg(1, 1));
        let now = Instant::now();
        assert!(!path.selectable(now), "fresh path has no handle");

        path.alive = true;
        assert!(!path.selectable(now), "alive without handle");

        path.mark_down();
        assert!(!path.alive);
        assert!(
            !path.selectable(Instant::now() + Duration::from_secs(2)),
            "cooldown expiry alone does not revive a dead path"
        );
    }
}
