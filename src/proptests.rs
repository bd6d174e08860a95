//! Arbitrary-packet strategies for property-based tests, gated behind the
//! `proptest` feature exactly like the teacher's `ip-packet` crate
//! (`rust/connlib/ip-packet/src/proptests.rs`): a handful of `Strategy`
//! combinators building well-formed IPv4/IPv6 TCP/UDP packets out of
//! arbitrary addresses, ports and flags, reused by this crate's own
//! property tests (`registry.rs`, `classifier.rs`) instead of duplicating
//! packet-construction boilerplate in each.

use crate::packet::ParsedPacket;
use etherparse::PacketBuilder;
use proptest::prelude::*;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Builds a well-formed IPv4 TCP packet from arbitrary endpoints/flags and
/// returns its raw bytes — callers parse it with [`ParsedPacket::parse`].
pub fn tcp_packet_v4() -> impl Strategy<Value = Vec<u8>> {
    (
        any::<Ipv4Addr>(),
        any::<Ipv4Addr>(),
        any::<u16>(),
        any::<u16>(),
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(|(src, dst, sport, dport, syn, ack)| {
            let mut buf = Vec::new();
            let mut builder = PacketBuilder::ipv4(src.octets(), dst.octets(), 64).tcp(
                sport,
                dport,
                0,
                1024,
            );
            if syn {
                builder = builder.syn();
            }
            if ack {
                builder = builder.ack(0);
            }
            builder.write(&mut buf, &[]).unwrap();
            buf
        })
}

/// Builds a well-formed IPv6 TCP packet from arbitrary endpoints/flags.
pub fn tcp_packet_v6() -> impl Strategy<Value = Vec<u8>> {
    (
        any::<Ipv6Addr>(),
        any::<Ipv6Addr>(),
        any::<u16>(),
        any::<u16>(),
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(|(src, dst, sport, dport, syn, ack)| {
            let mut buf = Vec::new();
            let mut builder = PacketBuilder::ipv6(src.octets(), dst.octets(), 64).tcp(
                sport,
                dport,
                0,
                1024,
            );
            if syn {
                builder = builder.syn();
            }
            if ack {
                builder = builder.ack(0);
            }
            builder.write(&mut buf, &[]).unwrap();
            buf
        })
}

/// Builds a well-formed IPv4 UDP packet from arbitrary endpoints.
pub fn udp_packet_v4() -> impl Strategy<Value = Vec<u8>> {
    (any::<Ipv4Addr>(), any::<Ipv4Addr>(), any::<u16>(), any::<u16>()).prop_map(
        |(src, dst, sport, dport)| {
            let mut buf = Vec::new();
            PacketBuilder::ipv4(src.octets(), dst.octets(), 64)
                .udp(sport, dport)
                .write(&mut buf, &[])
                .unwrap();
            buf
        },
    )
}

/// Any of the above, uniformly mixed — for properties that hold regardless
/// of transport or IP family.
pub fn any_packet() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![tcp_packet_v4(), tcp_packet_v6(), udp_packet_v4()]
}

/// Parses `bytes` built by one of the strategies above. Panics if
/// unparsable — these strategies only ever build well-formed packets, so a
/// parse failure here is a bug in the strategy, not in the code under test.
pub fn parse(bytes: &[u8]) -> ParsedPacket<'_> {
    ParsedPacket::parse(bytes).expect("strategies only build well-formed packets")
}
