//! IP packet inspection.
//!
//! Parses IPv4/IPv6 headers plus L4 ports and DSCP into a [`PacketMeta`]
//! used by the traffic classifier and the flow hasher. Parsing is
//! best-effort: anything that is not a well-formed IP packet yields `None`
//! and the caller falls back to the default class / round-robin scheduling.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Transport layer protocol, as carried in the IP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    Tcp,
    Udp,
    Icmp,
    Icmpv6,
    Other(u8),
}

impl ProtocolKind {
    /// Create from the IP protocol / next-header number.
    pub fn from_number(n: u8) -> Self {
        match n {
            6 => Self::Tcp,
            17 => Self::Udp,
            1 => Self::Icmp,
            58 => Self::Icmpv6,
            _ => Self::Other(n),
        }
    }

    /// The IP protocol number.
    pub fn number(&self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Icmp => 1,
            Self::Icmpv6 => 58,
            Self::Other(n) => *n,
        }
    }

    /// True for protocols that carry ports we can extract.
    pub fn has_ports(&self) -> bool {
        matches!(self, Self::Tcp | Self::Udp)
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
            Self::Icmp => write!(f, "icmp"),
            Self::Icmpv6 => write!(f, "icmpv6"),
            Self::Other(n) => write!(f, "{n}"),
        }
    }
}

/// Parsed per-packet metadata. Produced on the send path for every packet,
/// never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketMeta {
    pub protocol: ProtocolKind,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    /// Differentiated services code point, 0..=63.
    pub dscp: u8,
}

/// Parse an IP packet's headers.
///
/// Returns `None` for anything unparseable: empty input, unknown version
/// nibble, or a header shorter than its fixed part.
pub fn inspect(data: &[u8]) -> Option<PacketMeta> {
    match data.first()? >> 4 {
        4 => inspect_v4(data),
        6 => inspect_v6(data),
        _ => None,
    }
}

fn inspect_v4(data: &[u8]) -> Option<PacketMeta> {
    if data.len() < 20 {
        return None;
    }
    let ihl = usize::from(data[0] & 0x0f) * 4;
    if ihl < 20 || data.len() < ihl {
        return None;
    }

    let protocol = ProtocolKind::from_number(data[9]);
    let src_addr = IpAddr::V4(Ipv4Addr::new(data[12], data[13], data[14], data[15]));
    let dst_addr = IpAddr::V4(Ipv4Addr::new(data[16], data[17], data[18], data[19]));
    let dscp = data[1] >> 2;

    let (src_port, dst_port) = if protocol.has_ports() && data.len() >= ihl + 4 {
        (
            Some(u16::from_be_bytes([data[ihl], data[ihl + 1]])),
            Some(u16::from_be_bytes([data[ihl + 2], data[ihl + 3]])),
        )
    } else {
        (None, None)
    };

    Some(PacketMeta {
        protocol,
        src_addr,
        dst_addr,
        src_port,
        dst_port,
        dscp,
    })
}

fn inspect_v6(data: &[u8]) -> Option<PacketMeta> {
    if data.len() < 40 {
        return None;
    }

    let protocol = ProtocolKind::from_number(data[6]);

    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&data[8..24]);
    dst.copy_from_slice(&data[24..40]);

    // Traffic class spans the low nibble of byte 0 and the high nibble of
    // byte 1; DSCP is its upper six bits.
    let traffic_class = (data[0] & 0x0f) << 4 | data[1] >> 4;
    let dscp = traffic_class >> 2;

    let (src_port, dst_port) = if protocol.has_ports() && data.len() >= 44 {
        (
            Some(u16::from_be_bytes([data[40], data[41]])),
            Some(u16::from_be_bytes([data[42], data[43]])),
        )
    } else {
        (None, None)
    };

    Some(PacketMeta {
        protocol,
        src_addr: IpAddr::V6(Ipv6Addr::from(src)),
        dst_addr: IpAddr::V6(Ipv6Addr::from(dst)),
        src_port,
        dst_port,
        dscp,
    })
}

/// Extract just the destination address, used by the server TUN reader to
/// pick a connection-table entry without a full parse.
pub fn destination(data: &[u8]) -> Option<IpAddr> {
    match data.first()? >> 4 {
        4 if data.len() >= 20 => Some(IpAddr::V4(Ipv4Addr::new(
            data[16], data[17], data[18], data[19],
        ))),
        6 if data.len() >= 40 => {
            let mut dst = [0u8; 16];
            dst.copy_from_slice(&data[24..40]);
            Some(IpAddr::V6(Ipv6Addr::from(dst)))
        }
        _ => None,
    }
}

/// Extract just the IPv4 source address, used for route learning.
pub fn source_v4(data: &[u8]) -> Option<Ipv4Addr> {
    if data.first()? >> 4 == 4 && data.len() >= 20 {
        Some(Ipv4Addr::new(data[12], data[13], data[14], data[15]))
    } else {
        None
    }
}
