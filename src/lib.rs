//! # Braid
//!
//! Multipath IP-over-QUIC tunnel with an FEC-striped UDP side transport.
//!
//! Braid bonds several physical uplinks (e.g. multiple WAN links) into a
//! single virtual point-to-point link exposed through a layer-3 TUN device.
//! Every packet read from TUN is classified, scheduled onto one of the
//! configured paths, and carried either as a QUIC datagram or as a shard of
//! a Reed-Solomon FEC group striped across raw UDP "pipes".
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        TUN device (L3)                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │          Packet Inspector → Traffic Classifier                  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                   Multipath Scheduler                           │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────┐         │
//! │  │  Path 1  │  │  Path 2  │  │  Path 3  │  │  Path N  │         │
//! │  │  (QUIC)  │  │  (QUIC)  │  │ (stripe) │  │   ...    │         │
//! │  └──────────┘  └──────────┘  └──────────┘  └──────────┘         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │     QUIC datagrams / reliable stream / striped UDP + FEC        │
//! └─────────────────────────────────────────────────────────────────┘
//!
//! On the server the mirror image applies: a connection table maps each
//! peer's TUN address (and any learned LAN sources behind it) to the set of
//! paths the peer established, and return traffic is dispatched flow-hashed
//! across them through bounded per-path egress queues.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)] // wire fields are explicitly sized
#![allow(clippy::struct_excessive_bools)]   // boolean config fields are appropriate

pub mod client;
pub mod config;
pub mod control;
pub mod dataplane;
pub mod error;
pub mod fec;
pub mod multipath;
pub mod packet;
pub mod server;
pub mod stripe;
pub mod telemetry;
pub mod transport;
pub mod tun;
pub mod types;
pub mod util;

pub use config::Config;
pub use error::{Error, Result};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// ALPN protocol identifier for QUIC paths.
pub const ALPN: &[u8] = b"mpquic-ip";

/// Maximum IP packet size carried through the tunnel.
pub const MAX_PACKET: usize = 65535;

/// Capacity of the shared receive channel feeding the TUN writer.
pub const RECV_CHANNEL_CAP: usize = 512;

/// Capacity of each per-path egress queue on the server.
pub const EGRESS_QUEUE_CAP: usize = 256;
