//! UDP Acceptor / Proxy (component G, `spec.md` §4.6).
//!
//! Mirrors the TCP Acceptor (F), but UDP flows have no deferred handshake —
//! the engine hands us a ready endpoint immediately — and session lifetime
//! is governed by an idle timer rather than EOF.

use crate::backend::{DnsResolver, IdentityService};
use crate::config::DispatcherConfig;
use crate::consts;
use crate::engine::{UdpEndpoint, UdpFlow};
use crate::registry::AddressRegistry;
use crate::stats::Stats;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;

pub struct UdpProxy {
    config: DispatcherConfig,
    dns_resolver: Arc<dyn DnsResolver>,
    identity: Arc<dyn IdentityService>,
    registry: Arc<AddressRegistry>,
    local_ip_filter: Arc<crate::netmap::LocalIpFilter>,
    stats: Arc<Stats>,
}

impl UdpProxy {
    pub fn new(
        config: DispatcherConfig,
        dns_resolver: Arc<dyn DnsResolver>,
        identity: Arc<dyn IdentityService>,
        registry: Arc<AddressRegistry>,
        local_ip_filter: Arc<crate::netmap::LocalIpFilter>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            config,
            dns_resolver,
            identity,
            registry,
            local_ip_filter,
            stats,
        }
    }

    /// Handles one UDP flow end to end; intended to be spawned as its own
    /// task per invocation of the engine's UDP forwarder callback
    /// (`spec.md` §5: "two [tasks] per UDP flow").
    pub async fn handle(self: Arc<Self>, flow: Box<dyn UdpFlow>) {
        let src = flow.src();
        let dst = flow.dst();
        self.stats.active_udp_flows.fetch_add(1, Ordering::Relaxed);

        if consts::is_service_ip(dst.ip()) {
            if dst.port() == 53 {
                self.serve_magic_dns(flow, src).await;
            } else {
                tracing::debug!(%dst, "Dropping non-DNS UDP flow to service IP");
            }
            // The service IP is never local, so the classifier always
            // acquired it for an INTERCEPT verdict (`spec.md` §4.2 "Subnet-
            // address admission"); match it here on every exit path.
            self.registry.release(dst.ip()).await;
        } else {
            self.generic_proxy(flow, src, dst).await;
        }

        self.stats.active_udp_flows.fetch_sub(1, Ordering::Relaxed);
    }

    /// `spec.md` §4.6 "Magic-DNS short-circuit": glibc may send multiple
    /// queries down one socket, so we loop reading with a short deadline
    /// rather than handling a single datagram and closing.
    async fn serve_magic_dns(&self, flow: Box<dyn UdpFlow>, src: SocketAddr) {
        let mut endpoint = flow.into_endpoint();
        let mut buf = vec![0u8; consts::UDP_COPY_BUFFER];

        for _ in 0..self.config.dns_max_datagrams_per_session {
            let read = tokio::time::timeout(
                self.config.dns_read_deadline,
                endpoint.recv(&mut buf),
            )
            .await;

            let n = match read {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    tracing::debug!("Magic-DNS UDP read failed: {e}");
                    return;
                }
                Err(_) => {
                    tracing::trace!("Magic-DNS UDP session idle, closing");
                    return;
                }
            };

            let response = match self.dns_resolver.query(&buf[..n], src).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!("Magic-DNS query failed: {e}");
                    continue;
                }
            };

            if let Err(e) = endpoint.send(&response).await {
                tracing::debug!("Magic-DNS UDP write failed: {e}");
                return;
            }
        }
    }

    /// `spec.md` §4.6 "Generic UDP proxy".
    async fn generic_proxy(&self, flow: Box<dyn UdpFlow>, src: SocketAddr, dst: SocketAddr) {
        let is_local = self.local_ip_filter.contains(&dst.ip());
        let release_on_exit = !is_local;

        let translated_dst = via_translated(dst);

        let backend = match bind_backend(src.port(), is_local, translated_dst.ip()).await {
            Some(socket) => socket,
            None => {
                tracing::warn!(%translated_dst, "Failed to bind UDP backend socket, twice, dropping flow");
                if release_on_exit {
                    self.registry.release(dst.ip()).await;
                }
                return;
            }
        };

        if let Err(e) = backend.connect(translated_dst).await {
            tracing::warn!(%translated_dst, "Failed to connect UDP backend socket: {e}");
            if release_on_exit {
                self.registry.release(dst.ip()).await;
            }
            return;
        }

        let backend_local = match backend.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!("Failed to read UDP backend local address: {e}");
                if release_on_exit {
                    self.registry.release(dst.ip()).await;
                }
                return;
            }
        };

        // `spec.md` §4.6 registers the identity mapping "before starting",
        // mirroring §4.5's external-forward branch — applied regardless of
        // locality since any backend socket we dial needs it recoverable.
        self.identity
            .register_ip_port_identity(backend_local, src.ip());

        let idle = if dst.port() == 53 {
            self.config.udp_idle_dns
        } else {
            self.config.udp_idle
        };

        self.copy_until_idle(flow.into_endpoint(), backend, idle).await;

        self.identity.unregister_ip_port_identity(backend_local);

        if release_on_exit {
            self.registry.release(dst.ip()).await;
        }
    }

    /// Runs two packet copiers until `idle` elapses with no successful copy
    /// in either direction — `spec.md` §4.6: "Every successful packet copy
    /// extends the timer."
    async fn copy_until_idle(
        &self,
        mut client: Box<dyn UdpEndpoint>,
        backend: UdpSocket,
        idle: Duration,
    ) {
        let mut client_buf = vec![0u8; consts::UDP_COPY_BUFFER];
        let mut backend_buf = vec![0u8; consts::UDP_COPY_BUFFER];
        let deadline = tokio::time::sleep(idle);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                () = &mut deadline => {
                    tracing::trace!("UDP session idle timer fired, closing");
                    return;
                }
                result = client.recv(&mut client_buf) => {
                    match result {
                        Ok(n) if n > 0 => {
                            if backend.send(&client_buf[..n]).await.is_err() {
                                return;
                            }
                            deadline.as_mut().reset(Instant::now() + idle);
                        }
                        _ => return,
                    }
                }
                result = backend.recv(&mut backend_buf) => {
                    match result {
                        Ok(n) if n > 0 => {
                            if client.send(&backend_buf[..n]).await.is_err() {
                                return;
                            }
                            deadline.as_mut().reset(Instant::now() + idle);
                        }
                        _ => return,
                    }
                }
            }
        }
    }
}

/// `spec.md` §4.6: bind `127.0.0.1:srcPort` for local destinations, else
/// `0.0.0.0:srcPort` / `[::]:srcPort`; retry once with an ephemeral port if
/// the requested one is busy.
async fn bind_backend(src_port: u16, is_local: bool, translated_dst: IpAddr) -> Option<UdpSocket> {
    let preferred = preferred_bind_addr(src_port, is_local, translated_dst);

    if let Ok(socket) = UdpSocket::bind(preferred).await {
        return Some(socket);
    }

    tracing::debug!(%preferred, "UDP backend bind busy, retrying with an ephemeral port");
    let ephemeral = SocketAddr::new(preferred.ip(), 0);
    UdpSocket::bind(ephemeral).await.ok()
}

fn preferred_bind_addr(src_port: u16, is_local: bool, translated_dst: IpAddr) -> SocketAddr {
    if is_local {
        SocketAddr::new(
            match translated_dst {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            },
            src_port,
        )
    } else {
        SocketAddr::new(
            match translated_dst {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            },
            src_port,
        )
    }
}

/// `spec.md` §4.6: "For via-IPs, rewrite `dst` to its IPv4 translation
/// before binding the backend."
fn via_translated(dst: SocketAddr) -> SocketAddr {
    match dst.ip() {
        IpAddr::V6(v6) if consts::is_via_range(v6) => {
            SocketAddr::new(IpAddr::V4(consts::via_to_v4(v6)), dst.port())
        }
        _ => dst,
    }
}
