//! Ambient introspection counters (SPEC_FULL.md "Supplemented features").
//!
//! A bare set of atomics in the spirit of the teacher's `otel` module, minus
//! the OpenTelemetry dependency this crate has no use for: metrics/tracing
//! backends are out of scope per `spec.md` §1, but exposing plain counters
//! for embedders to poll is not an "outer surface".

use std::sync::atomic::AtomicU64;

#[derive(Default)]
pub struct Stats {
    pub packets_classified: AtomicU64,
    pub packets_pumped: AtomicU64,
    pub active_tcp_flows: AtomicU64,
    pub active_udp_flows: AtomicU64,
    pub ping_requests: AtomicU64,
}
