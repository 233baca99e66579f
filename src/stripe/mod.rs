//! FEC-striped UDP transport.
//!
//! Starlink (and similar last-mile links) apply per-session UDP traffic
//! shaping. This transport opens N raw UDP sockets ("pipes") on the same
//! physical interface, each seen by the shaper as an independent session,
//! and stripes Reed-Solomon FEC groups across them round-robin. There is
//! deliberately no congestion control here: rate limiting is provided by
//! the TCP senders inside the tunnel.
//!
//! Wire format, big-endian, 16-byte header followed by the shard payload:
//!
//! ```text
//! offset size  field
//!  0      2    magic   = 0x5354  ("ST")
//!  2      1    version = 1
//!  3      1    type    (DATA / PARITY / REGISTER / KEEPALIVE)
//!  4      4    session_id
//!  8      4    group_seq
//! 12      1    shard_idx     (0..K-1 data, K..K+M-1 parity)
//! 13      1    group_data_n  (actual K of this group; 0 for PARITY)
//! 14      2    data_len      (embedded IP packet length; 0 for PARITY)
//! ```
//!
//! Both ends implement the same `DatagramConn` interface as the QUIC
//! transports, so the multipath scheduler and the server connection table
//! use striped paths transparently.

pub mod auth;
pub mod client;
pub mod server;

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::dataplane::fnv1a_32;
use crate::util::ipv4_to_u32;

pub use auth::{ReplayWindow, StripeAuth};
pub use client::StripeClientConn;
pub use server::StripeServer;

pub const STRIPE_MAGIC: u16 = 0x5354; // "ST"
pub const STRIPE_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 16;

/// Payload of a REGISTER packet: session_id(4) + pipe_idx(1) + total_pipes(1).
pub const REGISTER_PAYLOAD_LEN: usize = 6;

pub const DEFAULT_DATA_SHARDS: usize = 10;
pub const DEFAULT_PARITY_SHARDS: usize = 2;
pub const DEFAULT_PIPES: usize = 4;

pub const FLUSH_INTERVAL: Duration = Duration::from_millis(5);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(30);
pub const GC_INTERVAL: Duration = Duration::from_secs(10);
pub const REGISTER_RETRIES: usize = 3;
pub const REGISTER_DELAY: Duration = Duration::from_millis(500);

/// Stripe packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Data,
    Parity,
    Register,
    Keepalive,
}

impl PacketType {
    pub fn from_wire(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Data),
            0x02 => Some(Self::Parity),
            0x03 => Some(Self::Register),
            0x04 => Some(Self::Keepalive),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Data => 0x01,
            Self::Parity => 0x02,
            Self::Register => 0x03,
            Self::Keepalive => 0x04,
        }
    }
}

/// The 16-byte stripe packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeHeader {
    pub packet_type: PacketType,
    pub session_id: u32,
    pub group_seq: u32,
    pub shard_idx: u8,
    pub group_data_n: u8,
    pub data_len: u16,
}

impl StripeHeader {
    /// A bare header for control packets (REGISTER / KEEPALIVE).
    pub fn control(packet_type: PacketType, session_id: u32) -> Self {
        Self {
            packet_type,
            session_id,
            group_seq: 0,
            shard_idx: 0,
            group_data_n: 0,
            data_len: 0,
        }
    }

    /// Encode into the leading 16 bytes of `buf`.
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&STRIPE_MAGIC.to_be_bytes());
        buf[2] = STRIPE_VERSION;
        buf[3] = self.packet_type.to_wire();
        buf[4..8].copy_from_slice(&self.session_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.group_seq.to_be_bytes());
        buf[12] = self.shard_idx;
        buf[13] = self.group_data_n;
        buf[14..16].copy_from_slice(&self.data_len.to_be_bytes());
    }

    /// Build a full wire packet: header followed by payload.
    pub fn to_packet(&self, payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0u8; HEADER_LEN + payload.len()];
        self.encode(&mut pkt);
        pkt[HEADER_LEN..].copy_from_slice(payload);
        pkt
    }

    /// Decode the header from a received datagram. Fails on short input,
    /// wrong magic, wrong version, or an unknown packet type.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        if u16::from_be_bytes([buf[0], buf[1]]) != STRIPE_MAGIC || buf[2] != STRIPE_VERSION {
            return None;
        }
        Some(Self {
            packet_type: PacketType::from_wire(buf[3])?,
            session_id: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            group_seq: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            shard_idx: buf[12],
            group_data_n: buf[13],
            data_len: u16::from_be_bytes([buf[14], buf[15]]),
        })
    }
}

/// Session identifier for a (client TUN IP, path name) pair.
///
/// XOR-ing the path name hash into the TUN address keeps sessions distinct
/// when one client runs several stripe paths (e.g. `wan5` and `wan6`), so
/// their pipe registrations don't collide on the server.
pub fn session_id(tun_ip: Ipv4Addr, path_name: &str) -> u32 {
    ipv4_to_u32(tun_ip) ^ fnv1a_32(path_name.as_bytes())
}

/// Encode a REGISTER payload.
pub fn register_payload(session_id: u32, pipe_idx: u8, total_pipes: u8) -> [u8; REGISTER_PAYLOAD_LEN] {
    let mut payload = [0u8; REGISTER_PAYLOAD_LEN];
    payload[0..4].copy_from_slice(&session_id.to_be_bytes());
    payload[4] = pipe_idx;
    payload[5] = total_pipes;
    payload
}
