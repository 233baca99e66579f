//! Core types used throughout Braid.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transport carrying a path's traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// QUIC datagrams (or a reliable stream in `reliable` mode).
    #[default]
    Quic,
    /// FEC-striped raw UDP pipes.
    Stripe,
    /// Decide per path: stripe on detected Starlink uplinks, QUIC otherwise.
    Auto,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quic => write!(f, "quic"),
            Self::Stripe => write!(f, "stripe"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

/// Framing used on QUIC paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// One IP packet per QUIC datagram (unreliable, no HoL blocking).
    #[default]
    Datagram,
    /// One bidirectional stream carrying `[u16 len][payload]` frames.
    Reliable,
}

/// Congestion control algorithm for QUIC paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CongestionAlgorithm {
    #[default]
    Cubic,
    Bbr,
    Reno,
}

impl fmt::Display for CongestionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cubic => write!(f, "cubic"),
            Self::Bbr => write!(f, "bbr"),
            Self::Reno => write!(f, "reno"),
        }
    }
}

/// Scheduling policy applied when choosing a path for a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerPolicy {
    /// Priority order with a small weight bonus between equal priorities.
    #[default]
    Priority,
    /// Strict priority order; weight is ignored.
    Failover,
    /// Priority order with a heavy weight bonus, spreading load across
    /// similarly-prioritized paths.
    Balanced,
}

impl fmt::Display for SchedulerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Priority => write!(f, "priority"),
            Self::Failover => write!(f, "failover"),
            Self::Balanced => write!(f, "balanced"),
        }
    }
}

/// Role of this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
        }
    }
}

/// Per-path traffic counters, exported by telemetry.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PathStats {
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub tx_errors: u64,
    pub rx_errors: u64,
}

impl PathStats {
    pub fn add(&mut self, other: &Self) {
        self.tx_packets += other.tx_packets;
        self.rx_packets += other.rx_packets;
        self.tx_errors += other.tx_errors;
        self.rx_errors += other.rx_errors;
    }
}

/// Per-class traffic counters, exported by telemetry.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ClassStats {
    pub tx_packets: u64,
    pub tx_errors: u64,
    pub tx_duplicates: u64,
}
