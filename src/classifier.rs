//! Packet Classifier (component C, `spec.md` §4.2).
//!
//! Pure decision logic over a parsed packet's headers plus a handful of
//! atomics and the Local Backend — the only component on the hot inbound
//! path, so every step here is either lock-free or a single synchronous
//! registry call.

use crate::backend::LocalBackend;
use crate::consts;
use crate::netmap::{LocalIpFilter, RoutedSubnets};
use crate::packet::{IpVersion, ParsedPacket, Transport};
use crate::registry::AddressRegistry;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

/// `spec.md` §4.2: "Output: one of {ACCEPT, INTERCEPT, HANDLE-PING(addr),
/// DROP-SILENTLY}."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Intercept,
    HandlePing(IpAddr),
    DropSilently,
}

/// The two 16-bit atomic cells caching the peerAPI port observed per IP
/// family (`spec.md` §3: `peerAPIPort[v4/v6]`). `0` means "no port cached
/// yet" — a real peerAPI port is never 0.
#[derive(Default)]
struct PeerApiPorts {
    v4: AtomicU16,
    v6: AtomicU16,
}

impl PeerApiPorts {
    fn get(&self, version: IpVersion) -> Option<u16> {
        let slot = match version {
            IpVersion::V4 => &self.v4,
            IpVersion::V6 => &self.v6,
        };
        match slot.load(Ordering::Relaxed) {
            0 => None,
            port => Some(port),
        }
    }

    fn set(&self, version: IpVersion, port: u16) {
        let slot = match version {
            IpVersion::V4 => &self.v4,
            IpVersion::V6 => &self.v6,
        };
        slot.store(port, Ordering::Relaxed);
    }
}

pub struct Classifier {
    backend: Arc<dyn LocalBackend>,
    registry: Arc<AddressRegistry>,
    local_ip_filter: Arc<LocalIpFilter>,
    routed_subnets: Arc<RoutedSubnets>,
    peer_api_ports: PeerApiPorts,
    process_local_ips: bool,
    process_subnets: bool,
}

impl Classifier {
    pub fn new(
        backend: Arc<dyn LocalBackend>,
        registry: Arc<AddressRegistry>,
        local_ip_filter: Arc<LocalIpFilter>,
        routed_subnets: Arc<RoutedSubnets>,
        process_local_ips: bool,
        process_subnets: bool,
    ) -> Self {
        Self {
            backend,
            registry,
            local_ip_filter,
            routed_subnets,
            peer_api_ports: PeerApiPorts::default(),
            process_local_ips,
            process_subnets,
        }
    }

    /// Classifies an inbound packet and, for any INTERCEPT verdict whose
    /// destination is non-local, synchronously registers the destination
    /// with the address registry before returning — `spec.md` §4.2
    /// "Subnet-address admission" and §5's happens-before guarantee.
    pub async fn classify(&self, p: &ParsedPacket<'_>) -> Verdict {
        let dst = p.destination();
        let is_local = self.local_ip_filter.contains(&dst);

        let verdict = self.decide(p, dst, is_local).await;

        if verdict == Verdict::Intercept && !is_local {
            self.registry.acquire(dst).await;
        }

        verdict
    }

    async fn decide(&self, p: &ParsedPacket<'_>, dst: IpAddr, is_local: bool) -> Verdict {
        // Step 1: service-IP hook.
        if consts::is_service_ip(dst) {
            let allowed = matches!(
                p.transport(),
                Transport::Udp { dst_port: 53, .. } | Transport::Tcp { dst_port: 53, .. } | Transport::Tcp { dst_port: 80, .. }
            );
            return if allowed {
                Verdict::Intercept
            } else {
                Verdict::Accept
            };
        }

        if let Transport::Tcp {
            dst_port, syn, ack, ..
        } = p.transport()
        {
            // Step 2: peerAPI probe, first SYN only (no ACK).
            if is_local && syn && !ack {
                if let Some(port) = self.backend.get_peer_api_port(dst).await {
                    self.peer_api_ports.set(p.version(), port);
                    if dst_port == port {
                        return Verdict::Intercept;
                    }
                }
            }

            // Step 3: peerAPI cached hit.
            if is_local && self.peer_api_ports.get(p.version()) == Some(dst_port) {
                return Verdict::Intercept;
            }

            // Step 4: in-mesh SSH.
            if is_local && dst_port == 22 && self.backend.should_run_ssh() {
                return Verdict::Intercept;
            }
        }

        // Step 5: 4-in-6 translation range.
        if let IpAddr::V6(v6) = dst {
            if consts::is_via_range(v6) {
                return if self.backend.should_handle_via_ip(dst) {
                    Verdict::Intercept
                } else {
                    Verdict::Accept
                };
            }
        }

        // Step 6: ICMP echo-request → possible ping shim dispatch.
        if p.is_icmp_echo_request() {
            let via_v6 = matches!(dst, IpAddr::V6(v6) if consts::is_via_range(v6));
            let non_mesh_subnet = self.process_subnets && !is_local;

            if via_v6 || non_mesh_subnet {
                let target = match dst {
                    IpAddr::V6(v6) if consts::is_via_range(v6) => {
                        IpAddr::V4(consts::via_to_v4(v6))
                    }
                    other => other,
                };
                return Verdict::HandlePing(target);
            }
        }

        // Step 7: fast path when neither gate is enabled.
        if !self.process_local_ips && !self.process_subnets {
            return Verdict::Accept;
        }

        // Step 8: local-address interception.
        if self.process_local_ips && is_local {
            return Verdict::Intercept;
        }

        // Step 9: subnet-routed interception. Unconditional on `is_local`
        // alone — unlike step 6's ping gate, spec.md §4.2 step 9 does not
        // consult routed-subnet membership for the verdict itself; we still
        // check it here purely to log when a non-local destination we're
        // about to intercept falls outside the advertised AllowedIPs, which
        // is otherwise invisible from this decision's outcome.
        if self.process_subnets && !is_local {
            if !self.routed_subnets.contains(dst) {
                tracing::trace!(%dst, "Intercepting non-local destination outside routed subnets");
            }
            return Verdict::Intercept;
        }

        // Step 10: default.
        Verdict::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netmap::LocalIpFilter;
    use etherparse::PacketBuilder;
    use std::net::Ipv4Addr;

    struct FakeBackend {
        ssh_enabled: bool,
        peer_api_port: Option<u16>,
    }

    #[async_trait::async_trait]
    impl LocalBackend for FakeBackend {
        fn should_run_ssh(&self) -> bool {
            self.ssh_enabled
        }

        async fn get_peer_api_port(&self, _addr: IpAddr) -> Option<u16> {
            self.peer_api_port
        }

        async fn handle_ssh_conn(&self, _conn: Box<dyn crate::engine::TcpEndpoint>) {}

        async fn serve_peer_api_connection(
            &self,
            _src: std::net::SocketAddr,
            _dst: std::net::SocketAddr,
            _conn: Box<dyn crate::engine::TcpEndpoint>,
        ) {
        }

        async fn handle_quad100_port80_conn(&self, _conn: Box<dyn crate::engine::TcpEndpoint>) {}

        fn should_handle_via_ip(&self, _addr: IpAddr) -> bool {
            true
        }
    }

    fn dns_query(dst: Ipv4Addr) -> Vec<u8> {
        let mut buf = Vec::new();
        PacketBuilder::ipv4([100, 64, 0, 2], dst.octets(), 64)
            .udp(44444, 53)
            .write(&mut buf, &[0u8; 8])
            .unwrap();
        buf
    }

    fn engine_stub() -> Arc<dyn crate::engine::Engine> {
        struct Noop;
        #[async_trait::async_trait]
        impl crate::engine::Engine for Noop {
            async fn add_protocol_address(&self, _addr: IpAddr) -> anyhow::Result<()> {
                Ok(())
            }
            async fn remove_address(&self, _addr: IpAddr) -> anyhow::Result<()> {
                Ok(())
            }
            async fn inject_inbound(
                &self,
                _packet: ParsedPacket<'_>,
            ) -> anyhow::Result<()> {
                Ok(())
            }
            async fn read_outbound(
                &self,
                _ctx: &tokio_util::sync::CancellationToken,
            ) -> Option<Box<dyn crate::engine::EngineBuffer>> {
                None
            }

            fn register_tcp_forwarder(&self, _handler: crate::engine::TcpForwardHandler) {}
            fn register_udp_forwarder(&self, _handler: crate::engine::UdpForwardHandler) {}
            fn enable_tcp_sack(&self) {}
        }
        Arc::new(Noop)
    }

    fn classifier(process_local_ips: bool, process_subnets: bool) -> Classifier {
        Classifier::new(
            Arc::new(FakeBackend {
                ssh_enabled: false,
                peer_api_port: None,
            }),
            Arc::new(AddressRegistry::new(engine_stub())),
            Arc::new(LocalIpFilter::default()),
            Arc::new(RoutedSubnets::default()),
            process_local_ips,
            process_subnets,
        )
    }

    #[tokio::test]
    async fn service_ip_dns_is_intercepted_other_ports_accepted() {
        let c = classifier(false, false);

        let dns = dns_query(consts::SERVICE_IP_V4);
        let packet = ParsedPacket::parse(&dns).unwrap();
        assert_eq!(c.classify(&packet).await, Verdict::Intercept);

        let mut other = Vec::new();
        PacketBuilder::ipv4([100, 64, 0, 2], consts::SERVICE_IP_V4.octets(), 64)
            .udp(44444, 9999)
            .write(&mut other, &[0u8; 4])
            .unwrap();
        let other_packet = ParsedPacket::parse(&other).unwrap();
        assert_eq!(c.classify(&other_packet).await, Verdict::Accept);
    }

    #[tokio::test]
    async fn fast_path_accepts_everything_when_both_gates_disabled() {
        let c = classifier(false, false);
        let mut buf = Vec::new();
        PacketBuilder::ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(1234, 8080, 0, 1024)
            .write(&mut buf, &[])
            .unwrap();
        let packet = ParsedPacket::parse(&buf).unwrap();

        assert_eq!(c.classify(&packet).await, Verdict::Accept);
    }

    #[tokio::test]
    async fn subnet_routed_destination_is_intercepted_and_acquires_registry() {
        let backend = Arc::new(FakeBackend {
            ssh_enabled: false,
            peer_api_port: None,
        });
        let registry = Arc::new(AddressRegistry::new(engine_stub()));
        let local_ip_filter = Arc::new(LocalIpFilter::default());

        let c = Classifier::new(
            backend,
            registry.clone(),
            local_ip_filter,
            Arc::new(RoutedSubnets::default()),
            false,
            true,
        );

        let mut buf = Vec::new();
        PacketBuilder::ipv4([10, 0, 0, 9], [10, 0, 0, 5], 64)
            .tcp(1234, 8080, 0, 1024)
            .syn()
            .write(&mut buf, &[])
            .unwrap();
        let packet = ParsedPacket::parse(&buf).unwrap();

        assert_eq!(c.classify(&packet).await, Verdict::Intercept);
        assert_eq!(registry.refcount(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))).await, 1);
    }

    // `spec.md` §8 invariant 3: "For any packet `p` with `p.dst` in
    // {service-IP-v4, service-IP-v6} and proto/port outside {UDP/53,
    // TCP/53, TCP/80}, the classifier returns ACCEPT" — step 1 of the
    // decision order is checked first and unconditionally, so this must
    // hold regardless of what `processLocalIPs`/`processSubnets` are set to.
    #[cfg(feature = "proptest")]
    mod proptests {
        use super::*;
        use crate::proptests::{tcp_packet_v4, tcp_packet_v6, udp_packet_v4};
        use proptest::prelude::*;

        fn service_ip_packet_with_other_port() -> impl Strategy<Value = Vec<u8>> {
            (any::<u16>(), any::<bool>(), any::<bool>()).prop_filter_map(
                "dst_port must land outside {53, 80}",
                |(dst_port, syn, ack)| {
                    if dst_port == 53 || dst_port == 80 {
                        return None;
                    }
                    let mut buf = Vec::new();
                    let mut builder = etherparse::PacketBuilder::ipv4(
                        [100, 64, 0, 2],
                        consts::SERVICE_IP_V4.octets(),
                        64,
                    )
                    .tcp(44444, dst_port, 0, 1024);
                    if syn {
                        builder = builder.syn();
                    }
                    if ack {
                        builder = builder.ack(0);
                    }
                    builder.write(&mut buf, &[]).ok()?;
                    Some(buf)
                },
            )
        }

        proptest! {
            #[test]
            fn service_ip_off_allowlist_ports_always_accepted(bytes in service_ip_packet_with_other_port()) {
                let rt = tokio::runtime::Runtime::new().unwrap();
                let result: Result<(), TestCaseError> = rt.block_on(async {
                    for (process_local_ips, process_subnets) in
                        [(false, false), (true, false), (false, true), (true, true)]
                    {
                        let c = classifier(process_local_ips, process_subnets);
                        let packet = ParsedPacket::parse(&bytes).unwrap();
                        prop_assert_eq!(c.classify(&packet).await, Verdict::Accept);
                    }
                    Ok(())
                });
                result?;
            }
        }

        proptest! {
            #[test]
            fn classify_never_panics_on_arbitrary_well_formed_tcp(bytes in tcp_packet_v4()) {
                let rt = tokio::runtime::Runtime::new().unwrap();
                rt.block_on(async {
                    let c = classifier(true, true);
                    let packet = crate::proptests::parse(&bytes);
                    let _ = c.classify(&packet).await;
                });
            }
        }

        proptest! {
            #[test]
            fn classify_never_panics_on_arbitrary_well_formed_tcp_v6(bytes in tcp_packet_v6()) {
                let rt = tokio::runtime::Runtime::new().unwrap();
                rt.block_on(async {
                    let c = classifier(true, true);
                    let packet = crate::proptests::parse(&bytes);
                    let _ = c.classify(&packet).await;
                });
            }
        }

        proptest! {
            #[test]
            fn classify_never_panics_on_arbitrary_well_formed_udp(bytes in udp_packet_v4()) {
                let rt = tokio::runtime::Runtime::new().unwrap();
                rt.block_on(async {
                    let c = classifier(true, true);
                    let packet = crate::proptests::parse(&bytes);
                    let _ = c.classify(&packet).await;
                });
            }
        }
    }
}
