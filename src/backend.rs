//! The remaining external collaborators from `spec.md` §6: the local
//! backend, the network-map source, the DNS resolver and the engine's
//! identity service. All are consumed through trait objects so tests can
//! supply fakes.

use async_trait::async_trait;
use std::net::IpAddr;

/// `spec.md` §6: "Local Backend": `ShouldRunSSH()`, `GetPeerAPIPort(addr)`,
/// `HandleSSHConn(conn)`, `ServePeerAPIConnection(src, dst, conn)`,
/// `HandleQuad100Port80Conn(conn)`, `ShouldHandleViaIP(addr)`.
#[async_trait]
pub trait LocalBackend: Send + Sync + 'static {
    fn should_run_ssh(&self) -> bool;

    /// Returns the peerAPI port currently advertised for `addr`, if any.
    async fn get_peer_api_port(&self, addr: IpAddr) -> Option<u16>;

    /// Hands an already-accepted connection to the SSH subsystem.
    async fn handle_ssh_conn(&self, conn: Box<dyn super::engine::TcpEndpoint>);

    /// Hands an already-accepted connection to the peerAPI HTTP server,
    /// tagging it with the flow's original source and destination so the
    /// handler can recover the mesh peer identity.
    async fn serve_peer_api_connection(
        &self,
        src: std::net::SocketAddr,
        dst: std::net::SocketAddr,
        conn: Box<dyn super::engine::TcpEndpoint>,
    );

    /// Hands an already-accepted connection bound for `service-ip:80` to
    /// the node's local HTTP status page.
    async fn handle_quad100_port80_conn(&self, conn: Box<dyn super::engine::TcpEndpoint>);

    /// Whether the 4-in-6 via-IP translation range should be handled
    /// locally for `addr` (`spec.md` §4.2 step 5).
    fn should_handle_via_ip(&self, addr: IpAddr) -> bool;
}

/// `spec.md` §6: "DNS resolver": `HandleTCPConn(conn, src)` and
/// `Query(ctx, bytes, src) -> bytes`.
#[async_trait]
pub trait DnsResolver: Send + Sync + 'static {
    async fn handle_tcp_conn(
        &self,
        conn: Box<dyn super::engine::TcpEndpoint>,
        src: std::net::SocketAddr,
    );

    async fn query(&self, query: &[u8], src: std::net::SocketAddr) -> anyhow::Result<Vec<u8>>;
}

/// `spec.md` §6: "Engine identity service":
/// `RegisterIPPortIdentity`/`UnregisterIPPortIdentity`, letting other
/// subsystems recover the original mesh peer behind a proxied flow.
pub trait IdentityService: Send + Sync + 'static {
    fn register_ip_port_identity(
        &self,
        backend_local: std::net::SocketAddr,
        client_remote: IpAddr,
    );
    fn unregister_ip_port_identity(&self, backend_local: std::net::SocketAddr);
}

/// A single node's advertised addresses and routed subnets, as carried by a
/// network-map update (`spec.md` §6 "Network-map source").
#[derive(Debug, Clone, Default)]
pub struct NetworkMap {
    pub self_addresses: Vec<IpAddr>,
    pub allowed_ips: Vec<ip_network::IpNetwork>,
}

/// `spec.md` §6: "Network-map source": `AddNetworkMapCallback(fn)`.
pub trait NetworkMapSource: Send + Sync + 'static {
    fn add_network_map_callback(&self, callback: Box<dyn Fn(&NetworkMap) + Send + Sync>);
}
