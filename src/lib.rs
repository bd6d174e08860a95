//! A user-space network dispatcher bridging a mesh-VPN tunnel, the host
//! operating system, and in-process service handlers (`spec.md` §1).
//!
//! [`Dispatcher`] is the facade: it owns every component (A–H) and wires
//! them together at [`Dispatcher::start`]. Everything it depends on —
//! tunnel device, TCP/IP engine, local backend, DNS resolver, identity
//! service, network-map source — is an external collaborator (§6) supplied
//! through [`DispatcherBuilder`].

pub mod backend;
pub mod classifier;
pub mod config;
pub mod consts;
pub mod engine;
pub mod error;
pub mod inbound;
pub mod netmap;
pub mod outbound;
pub mod packet;
pub mod ping_shim;
#[cfg(feature = "proptest")]
#[allow(clippy::unwrap_used)]
pub mod proptests;
pub mod registry;
pub mod stats;
pub mod tcp_proxy;
#[cfg(test)]
pub(crate) mod tracing_setup;
pub mod udp_proxy;
pub mod utils;

use backend::{DnsResolver, IdentityService, LocalBackend, NetworkMap, NetworkMapSource};
use classifier::{Classifier, Verdict};
use config::DispatcherConfig;
use engine::{Engine, FilterHook, FilterResponse, TcpEndpoint, TunnelDevice};
use error::ConstructionError;
use inbound::InboundInjector;
use netmap::{LocalIpFilter, NetmapReconciler, RoutedSubnets};
use outbound::OutboundPump;
use packet::{ParsedPacket, Transport};
use ping_shim::PingShim;
use registry::AddressRegistry;
use stats::Stats;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use tcp_proxy::TcpProxy;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use udp_proxy::UdpProxy;

/// A new TCP flow forwarded to an embedder-supplied hook rather than one of
/// the built-in handlers (`spec.md` §4.5: "`ForwardTCPIn` hook registered").
pub type TcpForwardHook = Arc<dyn Fn(SocketAddr, SocketAddr, Box<dyn TcpEndpoint>) + Send + Sync>;

/// Builds a [`Dispatcher`], validating that every required collaborator is
/// bound before construction succeeds (`spec.md` §7: "missing collaborator
/// → refuse to construct, surface as fatal").
#[derive(Default)]
pub struct DispatcherBuilder {
    config: Option<DispatcherConfig>,
    tunnel: Option<Arc<dyn TunnelDevice>>,
    engine: Option<Arc<dyn Engine>>,
    backend: Option<Arc<dyn LocalBackend>>,
    dns_resolver: Option<Arc<dyn DnsResolver>>,
    identity: Option<Arc<dyn IdentityService>>,
    network_map_source: Option<Arc<dyn NetworkMapSource>>,
    tcp_forward_hook: Option<TcpForwardHook>,
    process_local_ips: bool,
    process_subnets: bool,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn tunnel(mut self, tunnel: Arc<dyn TunnelDevice>) -> Self {
        self.tunnel = Some(tunnel);
        self
    }

    pub fn engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn LocalBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn dns_resolver(mut self, dns_resolver: Arc<dyn DnsResolver>) -> Self {
        self.dns_resolver = Some(dns_resolver);
        self
    }

    pub fn identity(mut self, identity: Arc<dyn IdentityService>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn network_map_source(mut self, source: Arc<dyn NetworkMapSource>) -> Self {
        self.network_map_source = Some(source);
        self
    }

    /// `spec.md` §4.5 dispatch table: "`ForwardTCPIn` hook registered".
    pub fn tcp_forward_hook(mut self, hook: TcpForwardHook) -> Self {
        self.tcp_forward_hook = Some(hook);
        self
    }

    /// `spec.md` §3: "gate whether the classifier intercepts local-address
    /// or subnet traffic", immutable once [`Dispatcher::start`] is called.
    pub fn process_local_ips(mut self, enabled: bool) -> Self {
        self.process_local_ips = enabled;
        self
    }

    pub fn process_subnets(mut self, enabled: bool) -> Self {
        self.process_subnets = enabled;
        self
    }

    pub fn build(self) -> Result<Dispatcher, ConstructionError> {
        let config = self.config.unwrap_or_default();
        let tunnel = self
            .tunnel
            .ok_or(ConstructionError::MissingCollaborator("tunnel device"))?;
        let engine = self
            .engine
            .ok_or(ConstructionError::MissingCollaborator("TCP/IP engine"))?;
        let backend = self
            .backend
            .ok_or(ConstructionError::MissingCollaborator("local backend"))?;
        let dns_resolver = self
            .dns_resolver
            .ok_or(ConstructionError::MissingCollaborator("DNS resolver"))?;
        let identity = self
            .identity
            .ok_or(ConstructionError::MissingCollaborator("identity service"))?;
        let network_map_source = self.network_map_source.ok_or(
            ConstructionError::MissingCollaborator("network-map source"),
        )?;

        let stats = Arc::new(Stats::default());
        let registry = Arc::new(AddressRegistry::new(engine.clone()));
        let local_ip_filter = Arc::new(LocalIpFilter::default());
        let routed_subnets = Arc::new(RoutedSubnets::default());

        let reconciler = Arc::new(NetmapReconciler::new(
            engine.clone(),
            registry.clone(),
            local_ip_filter.clone(),
            routed_subnets.clone(),
        ));

        let classifier = Arc::new(Classifier::new(
            backend.clone(),
            registry.clone(),
            local_ip_filter.clone(),
            routed_subnets,
            self.process_local_ips,
            self.process_subnets,
        ));

        let injector = Arc::new(InboundInjector::new(engine.clone()));

        let ping_shim = Arc::new(PingShim::new(
            config.ping_semaphore_permits,
            tunnel.clone(),
            stats.clone(),
        ));

        let outbound_pump = Arc::new(OutboundPump::new(
            engine.clone(),
            tunnel.clone(),
            stats.clone(),
        ));

        let tcp_proxy = Arc::new(TcpProxy::new(
            config.clone(),
            backend.clone(),
            dns_resolver.clone(),
            identity.clone(),
            registry.clone(),
            local_ip_filter.clone(),
            stats.clone(),
            self.tcp_forward_hook,
        ));

        let udp_proxy = Arc::new(UdpProxy::new(
            config.clone(),
            dns_resolver,
            identity,
            registry.clone(),
            local_ip_filter.clone(),
            stats.clone(),
        ));

        Ok(Dispatcher {
            tunnel,
            engine,
            network_map_source,
            reconciler,
            classifier,
            injector,
            ping_shim,
            outbound_pump,
            tcp_proxy,
            udp_proxy,
            stats,
            ctx: CancellationToken::new(),
            pump_handle: StdMutex::new(None),
        })
    }
}

/// The long-lived, single-instance-per-process facade over components A–H
/// (`spec.md` §3 "Lifecycle").
///
/// Created via [`DispatcherBuilder`] with all collaborators bound. After
/// [`Dispatcher::start`], the outbound pump runs and the two tunnel filter
/// hooks are installed until [`Dispatcher::close`].
pub struct Dispatcher {
    tunnel: Arc<dyn TunnelDevice>,
    engine: Arc<dyn Engine>,
    network_map_source: Arc<dyn NetworkMapSource>,
    reconciler: Arc<NetmapReconciler>,
    classifier: Arc<Classifier>,
    injector: Arc<InboundInjector>,
    ping_shim: Arc<PingShim>,
    outbound_pump: Arc<OutboundPump>,
    tcp_proxy: Arc<TcpProxy>,
    udp_proxy: Arc<UdpProxy>,
    stats: Arc<Stats>,
    ctx: CancellationToken,
    pump_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    /// Exposes the ambient introspection counters (SPEC_FULL.md
    /// "Supplemented features").
    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Wires forwarder callbacks, installs the two filter hooks, enables TCP
    /// SACK, registers the network-map callback, and spawns the outbound
    /// pump. Not idempotent — calling this twice on the same instance is a
    /// caller error, matching `spec.md` §3's single-instance-per-process
    /// assumption.
    pub fn start(self: &Arc<Self>) {
        self.engine.enable_tcp_sack();

        let tcp_proxy = self.tcp_proxy.clone();
        self.engine.register_tcp_forwarder(Box::new(move |request| {
            let tcp_proxy = tcp_proxy.clone();
            tokio::spawn(async move { tcp_proxy.handle(request).await });
        }));

        let udp_proxy = self.udp_proxy.clone();
        self.engine.register_udp_forwarder(Box::new(move |flow| {
            let udp_proxy = udp_proxy.clone();
            tokio::spawn(async move { udp_proxy.handle(flow).await });
        }));

        let reconciler = self.reconciler.clone();
        self.network_map_source
            .add_network_map_callback(Box::new(move |netmap: &NetworkMap| {
                let reconciler = reconciler.clone();
                let netmap = netmap.clone();
                tokio::spawn(async move { reconciler.reconcile(&netmap).await });
            }));

        self.tunnel
            .set_pre_filter_from_tun_to_netstack(Arc::new(PreFilterHook {
                injector: self.injector.clone(),
            }));
        self.tunnel.set_post_filter_in(Arc::new(PostFilterHook {
            classifier: self.classifier.clone(),
            injector: self.injector.clone(),
            ping_shim: self.ping_shim.clone(),
            stats: self.stats.clone(),
        }));

        let pump = self.outbound_pump.clone();
        let ctx = self.ctx.clone();
        let handle = tokio::spawn(async move { pump.run(&ctx).await });
        *self.pump_handle.lock().unwrap() = Some(handle);
    }

    /// Cancels the outbound pump and waits for it to terminate.
    ///
    /// `spec.md` §3: "cancelling it terminates the pump and closes the
    /// engine" — closing the engine itself is the embedder's responsibility
    /// once this returns, since `Engine` does not expose a `close` method in
    /// our collaborator contract (§6 lists it as the engine's own concern).
    pub async fn close(&self) {
        self.ctx.cancel();

        let handle = self.pump_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("Outbound pump task panicked: {e}");
            }
        }
    }
}

/// Inspects packets about to leave the host for the tunnel; redirects ones
/// bound for the service IP into the engine instead, so local processes
/// querying magic-DNS are served without ever reaching a mesh peer
/// (`spec.md` §4.3 "mirror" filter, §9 "Two filter hooks, not one").
struct PreFilterHook {
    injector: Arc<InboundInjector>,
}

#[async_trait::async_trait]
impl FilterHook for PreFilterHook {
    async fn filter(&self, bytes: &[u8]) -> FilterResponse {
        let Some(packet) = ParsedPacket::parse(bytes) else {
            return FilterResponse::Accept;
        };

        if !consts::is_service_ip(packet.destination()) {
            return FilterResponse::Accept;
        }

        if let Err(e) = self.injector.inject(packet).await {
            tracing::warn!("Failed to redirect host-to-service-IP packet into engine: {e:#}");
        }

        FilterResponse::DropSilently
    }
}

/// Inspects packets arriving from the tunnel before they reach the host
/// kernel — drives the Packet Classifier (C) and dispatches its verdict
/// (`spec.md` §4.2).
struct PostFilterHook {
    classifier: Arc<Classifier>,
    injector: Arc<InboundInjector>,
    ping_shim: Arc<PingShim>,
    stats: Arc<Stats>,
}

#[async_trait::async_trait]
impl FilterHook for PostFilterHook {
    async fn filter(&self, bytes: &[u8]) -> FilterResponse {
        // `spec.md` §7: "unparsable address → log and fall through to
        // ACCEPT".
        let Some(packet) = ParsedPacket::parse(bytes) else {
            tracing::debug!("Unparsable inbound packet, falling through to ACCEPT");
            return FilterResponse::Accept;
        };

        self.stats
            .packets_classified
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        match self.classifier.classify(&packet).await {
            Verdict::Accept => FilterResponse::Accept,
            Verdict::DropSilently => FilterResponse::DropSilently,
            Verdict::Intercept => {
                if let Err(e) = self.injector.inject(packet).await {
                    tracing::warn!("Failed to inject intercepted packet into engine: {e:#}");
                }
                FilterResponse::DropSilently
            }
            Verdict::HandlePing(target) => {
                if let Transport::IcmpEchoRequest {
                    identifier,
                    sequence,
                } = packet.transport()
                {
                    let reply_src = packet.destination();
                    let reply_dst = packet.source();
                    let payload = packet.icmp_payload().to_vec();
                    let shim = self.ping_shim.clone();
                    tokio::spawn(async move {
                        shim.handle(target, reply_src, reply_dst, identifier, sequence, payload)
                            .await;
                    });
                }
                FilterResponse::DropSilently
            }
        }
    }
}
