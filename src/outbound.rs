//! Outbound Pump (component E, `spec.md` §4.4).

use crate::consts;
use crate::engine::Engine;
use crate::packet::ParsedPacket;
use crate::stats::Stats;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The single long-running task draining engine-synthesized packets and
/// routing each one tunnel-out (to a mesh peer) or tunnel-in (to the host
/// kernel, for service-IP replies), per `spec.md` §4.4.
pub struct OutboundPump {
    engine: Arc<dyn Engine>,
    tunnel: Arc<dyn crate::engine::TunnelDevice>,
    stats: Arc<Stats>,
}

impl OutboundPump {
    pub fn new(
        engine: Arc<dyn Engine>,
        tunnel: Arc<dyn crate::engine::TunnelDevice>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            engine,
            tunnel,
            stats,
        }
    }

    /// Runs until `ctx` is cancelled or the engine read fails.
    ///
    /// `spec.md` §4.4 step 4: a delivery error is unrecoverable for this
    /// pump — we log and return, leaving the caller (the `Dispatcher`) to
    /// decide whether to restart.
    pub async fn run(&self, ctx: &CancellationToken) {
        loop {
            let Some(buffer) = self.engine.read_outbound(ctx).await else {
                if ctx.is_cancelled() {
                    tracing::debug!("Outbound pump: cancelled, terminating");
                } else {
                    tracing::error!("Outbound pump: engine read returned nothing; terminating");
                }
                return;
            };

            let bytes = buffer.bytes();
            let Some(source) = ParsedPacket::source_only(bytes) else {
                tracing::warn!("Outbound pump: could not parse source address, dropping");
                buffer.dec_ref();
                continue;
            };

            let delivered = if consts::is_service_ip(source) {
                self.tunnel.inject_inbound(bytes)
            } else {
                self.tunnel.inject_outbound(bytes)
            };

            if let Err(e) = delivered {
                tracing::error!("Outbound pump: delivery failed, terminating: {e}");
                return;
            }

            self.stats.packets_pumped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            buffer.dec_ref();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineBuffer, TunnelDevice};
    use etherparse::PacketBuilder;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FixedBuffer(Vec<u8>);

    impl EngineBuffer for FixedBuffer {
        fn bytes(&self) -> &[u8] {
            &self.0
        }

        fn dec_ref(self: Box<Self>) {}
    }

    struct OneShotEngine {
        packet: Mutex<Option<Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl Engine for OneShotEngine {
        async fn add_protocol_address(&self, _addr: IpAddr) -> anyhow::Result<()> {
            Ok(())
        }

        async fn remove_address(&self, _addr: IpAddr) -> anyhow::Result<()> {
            Ok(())
        }

        async fn inject_inbound(&self, _packet: ParsedPacket<'_>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn read_outbound(
            &self,
            ctx: &CancellationToken,
        ) -> Option<Box<dyn EngineBuffer>> {
            if let Some(bytes) = self.packet.lock().unwrap().take() {
                return Some(Box::new(FixedBuffer(bytes)));
            }
            ctx.cancel();
            None
        }

        fn register_tcp_forwarder(&self, _handler: crate::engine::TcpForwardHandler) {}
        fn register_udp_forwarder(&self, _handler: crate::engine::UdpForwardHandler) {}
        fn enable_tcp_sack(&self) {}
    }

    #[derive(Default)]
    struct RecordingTunnel {
        inbound: AtomicUsize,
        outbound: AtomicUsize,
    }

    impl TunnelDevice for RecordingTunnel {
        fn inject_inbound(&self, _bytes: &[u8]) -> std::io::Result<()> {
            self.inbound.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn inject_outbound(&self, _bytes: &[u8]) -> std::io::Result<()> {
            self.outbound.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn set_pre_filter_from_tun_to_netstack(&self, _hook: Arc<dyn crate::engine::FilterHook>) {}
        fn set_post_filter_in(&self, _hook: Arc<dyn crate::engine::FilterHook>) {}
    }

    /// A `TunnelDevice` whose every delivery fails, to exercise `spec.md`
    /// §4.4 step 4's "log it and terminate the pump" path.
    struct FailingTunnel;

    impl TunnelDevice for FailingTunnel {
        fn inject_inbound(&self, _bytes: &[u8]) -> std::io::Result<()> {
            Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "inbound delivery refused",
            ))
        }

        fn inject_outbound(&self, _bytes: &[u8]) -> std::io::Result<()> {
            Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "outbound delivery refused",
            ))
        }

        fn set_pre_filter_from_tun_to_netstack(&self, _hook: Arc<dyn crate::engine::FilterHook>) {}
        fn set_post_filter_in(&self, _hook: Arc<dyn crate::engine::FilterHook>) {}
    }

    /// Tracks whether `dec_ref` was ever called, so the error-path test can
    /// assert the refcount is left untouched on a delivery failure.
    struct TrackedBuffer {
        bytes: Vec<u8>,
        dec_ref_called: Arc<AtomicUsize>,
    }

    impl EngineBuffer for TrackedBuffer {
        fn bytes(&self) -> &[u8] {
            &self.bytes
        }

        fn dec_ref(self: Box<Self>) {
            self.dec_ref_called.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn v4_udp(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut buf = Vec::new();
        PacketBuilder::ipv4(src, dst, 64)
            .udp(1, 2)
            .write(&mut buf, &[])
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn packet_from_service_ip_is_delivered_inbound() {
        let packet = v4_udp(consts::SERVICE_IP_V4.octets(), [100, 64, 0, 2]);
        let engine = Arc::new(OneShotEngine {
            packet: Mutex::new(Some(packet)),
        });
        let tunnel = Arc::new(RecordingTunnel::default());
        let pump = OutboundPump::new(engine, tunnel.clone(), Arc::new(Stats::default()));

        let ctx = CancellationToken::new();
        pump.run(&ctx).await;

        assert_eq!(tunnel.inbound.load(Ordering::SeqCst), 1);
        assert_eq!(tunnel.outbound.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn packet_from_peer_is_delivered_outbound() {
        let packet = v4_udp([10, 0, 0, 5], [100, 64, 0, 2]);
        let engine = Arc::new(OneShotEngine {
            packet: Mutex::new(Some(packet)),
        });
        let tunnel = Arc::new(RecordingTunnel::default());
        let pump = OutboundPump::new(engine, tunnel.clone(), Arc::new(Stats::default()));

        let ctx = CancellationToken::new();
        pump.run(&ctx).await;

        assert_eq!(tunnel.outbound.load(Ordering::SeqCst), 1);
        assert_eq!(tunnel.inbound.load(Ordering::SeqCst), 0);
    }

    struct OneShotTrackedEngine {
        packet: Mutex<Option<Vec<u8>>>,
        dec_ref_called: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Engine for OneShotTrackedEngine {
        async fn add_protocol_address(&self, _addr: IpAddr) -> anyhow::Result<()> {
            Ok(())
        }

        async fn remove_address(&self, _addr: IpAddr) -> anyhow::Result<()> {
            Ok(())
        }

        async fn inject_inbound(&self, _packet: ParsedPacket<'_>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn read_outbound(
            &self,
            ctx: &CancellationToken,
        ) -> Option<Box<dyn EngineBuffer>> {
            if let Some(bytes) = self.packet.lock().unwrap().take() {
                return Some(Box::new(TrackedBuffer {
                    bytes,
                    dec_ref_called: self.dec_ref_called.clone(),
                }));
            }
            ctx.cancel();
            None
        }

        fn register_tcp_forwarder(&self, _handler: crate::engine::TcpForwardHandler) {}
        fn register_udp_forwarder(&self, _handler: crate::engine::UdpForwardHandler) {}
        fn enable_tcp_sack(&self) {}
    }

    #[tokio::test]
    async fn delivery_error_terminates_pump_without_decrementing_refcount() {
        crate::tracing_setup::init_default();

        let packet = v4_udp([10, 0, 0, 5], [100, 64, 0, 2]);
        let dec_ref_called = Arc::new(AtomicUsize::new(0));
        let engine = Arc::new(OneShotTrackedEngine {
            packet: Mutex::new(Some(packet)),
            dec_ref_called: dec_ref_called.clone(),
        });
        let pump = OutboundPump::new(engine, Arc::new(FailingTunnel), Arc::new(Stats::default()));

        let ctx = CancellationToken::new();
        pump.run(&ctx).await;

        assert_eq!(dec_ref_called.load(Ordering::SeqCst), 0);
        assert!(!ctx.is_cancelled());
    }
}
