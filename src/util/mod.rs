//! Small shared helpers: bind-address resolution, TUN CIDR parsing.

use std::net::{IpAddr, Ipv4Addr};

use crate::error::{Error, Result};

/// Resolve a configured bind value to an IPv4 address.
///
/// Accepts either a literal IP (`"192.0.2.10"`) or an interface reference
/// (`"if:wan0"`), which resolves to the first non-loopback IPv4 address on
/// that interface.
pub fn resolve_bind_ip(value: &str) -> Result<IpAddr> {
    if let Some(if_name) = value.strip_prefix("if:") {
        return interface_ipv4(if_name)
            .map(IpAddr::V4)
            .ok_or_else(|| Error::Config(format!("no ipv4 address found on {if_name}")));
    }
    value
        .parse::<IpAddr>()
        .map_err(|_| Error::Config(format!("invalid bind_ip: {value}")))
}

/// Extract the host address from a CIDR string like `"10.200.17.1/30"`.
/// A bare address without a prefix is also accepted.
pub fn parse_tun_ip(cidr: &str) -> Result<Ipv4Addr> {
    let host = cidr.split('/').next().unwrap_or(cidr);
    host.parse::<Ipv4Addr>()
        .map_err(|_| Error::Config(format!("invalid TUN CIDR: {cidr}")))
}

/// Convert an IPv4 address to its big-endian u32 representation.
pub fn ipv4_to_u32(ip: Ipv4Addr) -> u32 {
    u32::from_be_bytes(ip.octets())
}

/// Check whether an address falls in the CGNAT range `100.64.0.0/10`.
/// Starlink hands out CGNAT addresses to customer terminals, so a CGNAT
/// bind address is the detection signal for per-session traffic shaping.
pub fn is_cgnat(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    octets[0] == 100 && (octets[1] & 0xc0) == 0x40
}

/// First non-loopback IPv4 address on the named interface.
#[cfg(unix)]
fn interface_ipv4(name: &str) -> Option<Ipv4Addr> {
    use std::ffi::CStr;

    let mut found = None;

    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(std::ptr::addr_of_mut!(ifaddrs)) != 0 {
            return None;
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;
            current = ifa.ifa_next;

            if ifa.ifa_name.is_null() || ifa.ifa_addr.is_null() {
                continue;
            }
            let if_name = CStr::from_ptr(ifa.ifa_name).to_string_lossy();
            if if_name != name {
                continue;
            }
            if i32::from((*ifa.ifa_addr).sa_family) != libc::AF_INET {
                continue;
            }

            #[allow(clippy::cast_ptr_alignment)]
            let sockaddr = ifa.ifa_addr.cast::<libc::sockaddr_in>();
            let ip = Ipv4Addr::from(u32::from_be((*sockaddr).sin_addr.s_addr));
            if !ip.is_loopback() {
                found = Some(ip);
                break;
            }
        }

        libc::freeifaddrs(ifaddrs);
    }

    found
}

#[cfg(not(unix))]
fn interface_ipv4(_name: &str) -> Option<Ipv4Addr> {
    None
}
