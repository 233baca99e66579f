//! Flow hashing for path pinning.
//!
//! The server dispatches return traffic with a 32-bit FNV-1a hash over the
//! IPv4 5-tuple so every packet of a TCP/UDP flow leaves on the same path
//! and the common-case flow is never reordered across paths. Only the hash
//! being *stable* matters; both directions are hashed by the same host.

use crate::packet::PacketMeta;
use std::net::IpAddr;

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over a byte slice.
pub fn fnv1a_32(data: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET;
    for &b in data {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Hash a packet's 5-tuple.
///
/// Returns `Some(hash)` only for parseable IPv4 TCP/UDP packets; everything
/// else returns `None` and the caller falls back to round-robin.
pub fn flow_hash(meta: &PacketMeta) -> Option<u32> {
    let (IpAddr::V4(src), IpAddr::V4(dst)) = (meta.src_addr, meta.dst_addr) else {
        return None;
    };
    if !meta.protocol.has_ports() {
        return None;
    }
    let (src_port, dst_port) = (meta.src_port?, meta.dst_port?);

    let mut buf = [0u8; 13];
    buf[0..4].copy_from_slice(&src.octets());
    buf[4..8].copy_from_slice(&dst.octets());
    buf[8] = meta.protocol.number();
    buf[9..11].copy_from_slice(&src_port.to_be_bytes());
    buf[11..13].copy_from_slice(&dst_port.to_be_bytes());
    Some(fnv1a_32(&buf))
}

/// Hash a raw packet, parsing it first.
pub fn flow_hash_packet(data: &[u8]) -> Option<u32> {
    crate::packet::inspect(data).as_ref().and_then(flow_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ProtocolKind;
    use std::net::Ipv4Addr;

    fn meta(src_port: u16, dst_port: u16, proto: ProtocolKind) -> PacketMeta {
        PacketMeta {
            protocol: proto,
            src_addr: IpAddr::V4(Ipv4Addr::new(10, 200, 17, 2)),
            dst_addr: IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            src_port: Some(src_port),
            dst_port: Some(dst_port),
            dscp: 0,
        }
    }

    #[test]
    fn fnv_reference_values() {
        // Standard FNV-1a test vectors
        assert_eq!(fnv1a_32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a_32(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn stable_for_identical_tuples() {
        let a = flow_hash(&meta(49152, 443, ProtocolKind::Tcp)).unwrap();
        let b = flow_hash(&meta(49152, 443, ProtocolKind::Tcp)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn differs_across_tuples() {
        let a = flow_hash(&meta(49152, 443, ProtocolKind::Tcp)).unwrap();
        let b = flow_hash(&meta(49153, 443, ProtocolKind::Tcp)).unwrap();
        let c = flow_hash(&meta(49152, 443, ProtocolKind::Udp)).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn none_for_icmp() {
        let mut m = meta(0, 0, ProtocolKind::Icmp);
        m.src_port = None;
        m.dst_port = None;
        assert_eq!(flow_hash(&m), None);
    }

    #[test]
    fn none_for_ipv6() {
        let mut m = meta(49152, 443, ProtocolKind::Tcp);
        m.src_addr = "2001:db8::1".parse().unwrap();
        m.dst_addr = "2001:db8::2".parse().unwrap();
        assert_eq!(flow_hash(&m), None);
    }
}
