//! TCP Acceptor / Proxy (component F, `spec.md` §4.5).
//!
//! One task per accepted flow (`spec.md` §5: "one [task] per TCP flow"),
//! registered with the engine as a forwarder callback. The dispatch table
//! is evaluated top-to-bottom exactly as `spec.md` §4.5 lists it; the
//! catch-all branch dials the real backend before ever completing the
//! engine handshake, so a dead backend never leaves the client with a
//! half-open connection.

use crate::backend::{DnsResolver, LocalBackend, IdentityService};
use crate::config::DispatcherConfig;
use crate::consts;
use crate::engine::{TcpEndpoint, TcpFlowRequest};
use crate::netmap::LocalIpFilter;
use crate::registry::AddressRegistry;
use crate::stats::Stats;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;

type ForwardHook = Arc<dyn Fn(SocketAddr, SocketAddr, Box<dyn TcpEndpoint>) + Send + Sync>;

pub struct TcpProxy {
    config: DispatcherConfig,
    backend: Arc<dyn LocalBackend>,
    dns_resolver: Arc<dyn DnsResolver>,
    identity: Arc<dyn IdentityService>,
    registry: Arc<AddressRegistry>,
    local_ip_filter: Arc<LocalIpFilter>,
    stats: Arc<Stats>,
    accept_permits: Arc<Semaphore>,
    forward_hook: Option<ForwardHook>,
}

impl TcpProxy {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DispatcherConfig,
        backend: Arc<dyn LocalBackend>,
        dns_resolver: Arc<dyn DnsResolver>,
        identity: Arc<dyn IdentityService>,
        registry: Arc<AddressRegistry>,
        local_ip_filter: Arc<LocalIpFilter>,
        stats: Arc<Stats>,
        forward_hook: Option<ForwardHook>,
    ) -> Self {
        let accept_permits = Arc::new(Semaphore::new(config.max_tcp_accept_backlog));
        Self {
            config,
            backend,
            dns_resolver,
            identity,
            registry,
            local_ip_filter,
            stats,
            accept_permits,
            forward_hook,
        }
    }

    /// Handles one flow end to end; intended to be spawned as its own task
    /// per invocation of the engine's TCP forwarder callback.
    pub async fn handle(self: Arc<Self>, request: Box<dyn TcpFlowRequest>) {
        let Ok(_permit) = self.accept_permits.clone().acquire_owned().await else {
            request.reject();
            return;
        };

        self.stats.active_tcp_flows.fetch_add(1, Ordering::Relaxed);
        self.dispatch(request).await;
        self.stats.active_tcp_flows.fetch_sub(1, Ordering::Relaxed);
    }

    async fn dispatch(&self, request: Box<dyn TcpFlowRequest>) {
        let src = request.src();
        let dst = request.dst();
        let dst_ip = dst.ip();
        let is_local = self.local_ip_filter.contains(&dst_ip);

        // Address-registry admission per `spec.md` §4.2: the classifier
        // already acquired this address for non-local destinations before
        // we were ever invoked; we are responsible for the matching release
        // on every exit path.
        let release_on_exit = !is_local;

        if dst.port() == 53 && consts::is_service_ip(dst_ip) {
            if let Some(conn) = self.accept(request).await {
                self.dns_resolver.handle_tcp_conn(conn, src).await;
            }
        } else if dst.port() == 22 && is_local && self.backend.should_run_ssh() {
            if let Some(conn) = self.accept(request).await {
                conn.set_keepalive_idle(self.config.ssh_keepalive_idle);
                self.backend.handle_ssh_conn(conn).await;
            }
        } else if is_local && self.peer_api_match(dst).await {
            if let Some(conn) = self.accept(request).await {
                self.backend.serve_peer_api_connection(src, dst, conn).await;
            }
        } else if dst.port() == 80 && consts::is_service_ip(dst_ip) {
            if let Some(conn) = self.accept(request).await {
                self.backend.handle_quad100_port80_conn(conn).await;
            }
        } else if let Some(hook) = self.forward_hook.clone() {
            if let Some(conn) = self.accept(request).await {
                hook(src, dst, conn);
            }
        } else {
            self.forward_externally(request, src, dst, is_local).await;
        }

        if release_on_exit {
            self.registry.release(dst_ip).await;
        }
    }

    async fn peer_api_match(&self, dst: SocketAddr) -> bool {
        self.backend
            .get_peer_api_port(dst.ip())
            .await
            .is_some_and(|port| port == dst.port())
    }

    /// Completes the handshake, logging and rejecting on failure.
    ///
    /// `spec.md` §4.5: "Always set TCP keepalive on accepted endpoints" —
    /// applied here so every branch gets it; SSH overrides it afterwards.
    async fn accept(&self, request: Box<dyn TcpFlowRequest>) -> Option<Box<dyn TcpEndpoint>> {
        match request.create_endpoint().await {
            Ok(conn) => {
                conn.set_keepalive_idle(self.config.tcp_default_keepalive_idle);
                Some(conn)
            }
            Err(e) => {
                tracing::warn!("Failed to complete TCP handshake: {e}");
                None
            }
        }
    }

    /// `spec.md` §4.5 "otherwise" branch: deferred endpoint creation — dial
    /// the real backend first, only then complete the client handshake.
    async fn forward_externally(
        &self,
        request: Box<dyn TcpFlowRequest>,
        src: SocketAddr,
        dst: SocketAddr,
        is_local: bool,
    ) {
        let backend_addr = if is_local {
            SocketAddr::new(loopback_for(dst.ip()), dst.port())
        } else {
            via_translated(dst)
        };

        let backend_stream = match TcpStream::connect(backend_addr).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(%backend_addr, "Backend dial failed: {e}");
                request.reject();
                return;
            }
        };

        let client_conn = match request.create_endpoint().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("Failed to complete TCP handshake after backend dial: {e}");
                return;
            }
        };

        client_conn.set_keepalive_idle(self.config.tcp_default_keepalive_idle);

        let backend_local = match backend_stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!("Failed to read backend local address: {e}");
                return;
            }
        };

        self.identity.register_ip_port_identity(backend_local, src.ip());
        self.copy_bidirectional(client_conn, backend_stream).await;
        self.identity.unregister_ip_port_identity(backend_local);
    }

    async fn copy_bidirectional(&self, client: Box<dyn TcpEndpoint>, backend: TcpStream) {
        // Grabbed before `tokio::io::split` consumes `client` — there is no
        // `&self` left to call `hup` on afterwards (`spec.md` §4.5:
        // "Subscribe to the engine endpoint's HUP event").
        let hup = client.hup();

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut backend_read, mut backend_write) = backend.into_split();

        let client_to_backend = tokio::io::copy(&mut client_read, &mut backend_write);
        let backend_to_client = tokio::io::copy(&mut backend_read, &mut client_write);

        tokio::select! {
            r = client_to_backend => log_copy_result("client->backend", r),
            r = backend_to_client => log_copy_result("backend->client", r),
            () = hup => tracing::debug!("Client endpoint hung up, tearing down backend copy"),
        }
    }
}

fn log_copy_result(direction: &str, result: std::io::Result<u64>) {
    if let Err(e) = result {
        tracing::debug!(direction, "TCP copy ended: {e}");
    }
}

fn loopback_for(dst: IpAddr) -> IpAddr {
    match dst {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
    }
}

fn via_translated(dst: SocketAddr) -> SocketAddr {
    match dst.ip() {
        IpAddr::V6(v6) if consts::is_via_range(v6) => {
            SocketAddr::new(IpAddr::V4(consts::via_to_v4(v6)), dst.port())
        }
        _ => dst,
    }
}
