//! Parses raw IP datagrams arriving from the tunnel into the handful of
//! fields the classifier, proxies and ping shim need.
//!
//! We lean on `etherparse` directly rather than through an intermediate
//! packet crate: the dispatcher only ever reads a few header fields and
//! occasionally rebuilds an ICMP echo-reply, so `etherparse::PacketBuilder`
//! plus a thin facade is all that's needed.

use etherparse::{IcmpEchoHeader, Icmpv4Type, Icmpv6Type, IpNumber, IpSlice, PacketBuilder};
use std::net::IpAddr;

/// The IP/TCP/UDP/ICMP header fields the rest of this crate cares about.
///
/// Borrows the original buffer for its lifetime; callers that need to keep
/// the packet around past the borrow (e.g. to hand it to the engine) copy
/// the raw bytes out via [`ParsedPacket::raw`].
#[derive(Debug, Clone, Copy)]
pub struct ParsedPacket<'a> {
    raw: &'a [u8],
    version: IpVersion,
    src: IpAddr,
    dst: IpAddr,
    transport: Transport,
    /// The bytes following the ICMP echo header, when `transport` is
    /// [`Transport::IcmpEchoRequest`] — preserved verbatim into the
    /// synthesized reply (`spec.md` §4.7 step 1).
    icmp_payload: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp {
        src_port: u16,
        dst_port: u16,
        syn: bool,
        ack: bool,
    },
    Udp {
        src_port: u16,
        dst_port: u16,
    },
    IcmpEchoRequest {
        identifier: u16,
        sequence: u16,
    },
    Other,
}

impl<'a> ParsedPacket<'a> {
    /// Parses `data` as an IPv4 or IPv6 datagram.
    ///
    /// Returns `None` for anything unparsable; per `spec.md` §7, an
    /// unparsable packet is logged by the caller and falls through to
    /// ACCEPT, it is never treated as an error here.
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        let ip = IpSlice::from_slice(data).ok()?;

        let (version, src, dst, ip_number, payload) = match &ip {
            IpSlice::Ipv4(slice) => (
                IpVersion::V4,
                IpAddr::V4(slice.header().source_addr()),
                IpAddr::V4(slice.header().destination_addr()),
                slice.header().protocol(),
                slice.payload().payload,
            ),
            IpSlice::Ipv6(slice) => (
                IpVersion::V6,
                IpAddr::V6(slice.header().source_addr()),
                IpAddr::V6(slice.header().destination_addr()),
                slice.payload().ip_number,
                slice.payload().payload,
            ),
        };

        let (transport, icmp_payload) = parse_transport(ip_number, payload, version);

        Some(Self {
            raw: data,
            version,
            src,
            dst,
            transport,
            icmp_payload,
        })
    }

    /// Returns just the source address, parsed from the well-known offset
    /// (4 for v4, 8 for v6) — the minimal parse the outbound pump needs
    /// (`spec.md` §4.4).
    pub fn source_only(data: &'a [u8]) -> Option<IpAddr> {
        match data.first()? >> 4 {
            4 if data.len() >= 20 => Some(IpAddr::V4(std::net::Ipv4Addr::new(
                data[12], data[13], data[14], data[15],
            ))),
            6 if data.len() >= 40 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[8..24]);
                Some(IpAddr::V6(std::net::Ipv6Addr::from(octets)))
            }
            _ => None,
        }
    }

    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }

    pub fn version(&self) -> IpVersion {
        self.version
    }

    pub fn source(&self) -> IpAddr {
        self.src
    }

    pub fn destination(&self) -> IpAddr {
        self.dst
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self.transport, Transport::Tcp { .. })
    }

    pub fn is_udp(&self) -> bool {
        matches!(self.transport, Transport::Udp { .. })
    }

    pub fn is_icmp_echo_request(&self) -> bool {
        matches!(self.transport, Transport::IcmpEchoRequest { .. })
    }

    /// The bytes following the ICMP echo header, empty unless
    /// [`ParsedPacket::is_icmp_echo_request`].
    pub fn icmp_payload(&self) -> &'a [u8] {
        self.icmp_payload
    }
}

fn parse_transport<'a>(
    ip_number: IpNumber,
    payload: &'a [u8],
    version: IpVersion,
) -> (Transport, &'a [u8]) {
    match ip_number {
        IpNumber::TCP => (
            etherparse::TcpHeaderSlice::from_slice(payload)
                .map(|tcp| Transport::Tcp {
                    src_port: tcp.source_port(),
                    dst_port: tcp.destination_port(),
                    syn: tcp.syn(),
                    ack: tcp.ack(),
                })
                .unwrap_or(Transport::Other),
            &[],
        ),
        IpNumber::UDP => (
            etherparse::UdpHeaderSlice::from_slice(payload)
                .map(|udp| Transport::Udp {
                    src_port: udp.source_port(),
                    dst_port: udp.destination_port(),
                })
                .unwrap_or(Transport::Other),
            &[],
        ),
        IpNumber::ICMP if version == IpVersion::V4 => etherparse::Icmpv4Slice::from_slice(payload)
            .ok()
            .and_then(|icmp| match icmp.icmp_type() {
                Icmpv4Type::EchoRequest(echo) => Some((
                    Transport::IcmpEchoRequest {
                        identifier: echo.id,
                        sequence: echo.seq,
                    },
                    icmp.payload(),
                )),
                _ => None,
            })
            .unwrap_or((Transport::Other, &[])),
        IpNumber::IPV6_ICMP if version == IpVersion::V6 => {
            etherparse::Icmpv6Slice::from_slice(payload)
                .ok()
                .and_then(|icmp| match icmp.icmp_type() {
                    Icmpv6Type::EchoRequest(echo) => Some((
                        Transport::IcmpEchoRequest {
                            identifier: echo.id,
                            sequence: echo.seq,
                        },
                        icmp.payload(),
                    )),
                    _ => None,
                })
                .unwrap_or((Transport::Other, &[]))
        }
        _ => (Transport::Other, &[]),
    }
}

/// Builds the echo-reply corresponding to an ICMP echo-request, preserving
/// the original payload, per `spec.md` §4.7 step 1.
///
/// `src`/`dst` are the request's *destination*/*source* respectively — the
/// reply is addressed back to whoever asked, appearing to originate from
/// the address that was pinged.
pub fn build_icmp_echo_reply(
    reply_src: IpAddr,
    reply_dst: IpAddr,
    identifier: u16,
    sequence: u16,
    payload: &[u8],
) -> anyhow::Result<Vec<u8>> {
    let echo = IcmpEchoHeader {
        id: identifier,
        seq: sequence,
    };

    let mut buf = Vec::new();

    match (reply_src, reply_dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            PacketBuilder::ipv4(src.octets(), dst.octets(), 64)
                .icmpv4_echo_reply(echo.id, echo.seq)
                .write(&mut buf, payload)?;
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            PacketBuilder::ipv6(src.octets(), dst.octets(), 64)
                .icmpv6_echo_reply(echo.id, echo.seq)
                .write(&mut buf, payload)?;
        }
        _ => anyhow::bail!("mismatched IP versions between echo-reply source and destination"),
    }

    Ok(buf)
}
