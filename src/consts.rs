//! Well-known addresses and the 4-in-6 "via" prefix (`spec.md` §6
//! "Well-known constants" and GLOSSARY).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// The reserved service IP used for in-mesh DNS and other local services,
/// IPv4 family.
pub const SERVICE_IP_V4: Ipv4Addr = Ipv4Addr::new(100, 100, 100, 100);

/// The reserved service IP, IPv6 family.
pub const SERVICE_IP_V6: Ipv6Addr = Ipv6Addr::new(0xfd7a, 0x115c, 0xa1e0, 0, 0x53, 0, 0, 1);

/// The broadcast address, which the reconciler must never install or remove
/// (`spec.md` §3 invariant 3) even if the engine exposes it.
pub const NEVER_TOUCH_V4: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

/// `spec.md` §6: "UDP copy buffer = 1500".
pub const UDP_COPY_BUFFER: usize = 1500;

pub fn is_service_ip(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4 == SERVICE_IP_V4,
        IpAddr::V6(v6) => v6 == SERVICE_IP_V6,
    }
}

/// The well-known 4-in-6 "via" prefix: `fd7a:115c:a1e0:b1a::/64`. A via
/// address encodes an IPv4 destination in its low 32 bits.
const VIA_PREFIX: Ipv6Addr = Ipv6Addr::new(0xfd7a, 0x115c, 0xa1e0, 0x0b1a, 0, 0, 0, 0);

pub fn is_via_range(addr: Ipv6Addr) -> bool {
    let octets = addr.octets();
    octets[..8] == VIA_PREFIX.octets()[..8]
}

/// Recovers the IPv4 address encoded in a via-range address's low 32 bits.
pub fn via_to_v4(addr: Ipv6Addr) -> Ipv4Addr {
    let octets = addr.octets();
    Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15])
}
