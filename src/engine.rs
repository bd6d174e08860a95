//! Trait boundaries for the collaborators `spec.md` §6 treats as external:
//! the tunnel device and the embedded TCP/IP engine.
//!
//! Neither is implemented by this crate — WireGuard, the TUN driver and the
//! user-space network stack are all out of scope per `spec.md` §1. These
//! traits exist purely so the dispatcher can be constructed, tested and
//! wired against real implementations without this crate depending on any
//! of them concretely.

use crate::packet::ParsedPacket;
use async_trait::async_trait;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;

/// Response a filter hook installed on the tunnel device can return.
///
/// Mirrors `spec.md` §6: "Filter response is `{ACCEPT, DROP-SILENTLY,
/// DROP}`".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterResponse {
    Accept,
    DropSilently,
    Drop,
}

/// A packet filter installed on the tunnel device (`spec.md` §6, §9 "Two
/// filter hooks, not one").
#[async_trait]
pub trait FilterHook: Send + Sync + 'static {
    async fn filter(&self, bytes: &[u8]) -> FilterResponse;
}

/// The virtual network interface carrying raw IP datagrams to/from mesh
/// peers (`spec.md` GLOSSARY: "Tunnel device").
///
/// Ownership of an injected buffer transfers to the tunnel device; callers
/// must not touch it afterwards, matching `spec.md` §3 invariant 5.
pub trait TunnelDevice: Send + Sync + 'static {
    /// Copies `bytes` and queues it for delivery *into* the host (as if the
    /// kernel had just received it over the network).
    ///
    /// An `Err` means delivery failed outright (`spec.md` §4.4 step 4): the
    /// caller must not decrement the buffer's refcount and must treat the
    /// pump driving it as unrecoverable.
    fn inject_inbound(&self, bytes: &[u8]) -> std::io::Result<()>;

    /// Copies `bytes` and queues it for delivery *out* to the mesh peer
    /// (encrypted and sent over the tunnel). Same error contract as
    /// [`TunnelDevice::inject_inbound`].
    fn inject_outbound(&self, bytes: &[u8]) -> std::io::Result<()>;

    /// Installs the hook inspecting packets about to leave the host for the
    /// tunnel, *before* encryption (`spec.md` §4.3: "The tunnel-outbound
    /// filter has a mirror"). Active from `Start` to `Close`.
    fn set_pre_filter_from_tun_to_netstack(&self, hook: Arc<dyn FilterHook>);

    /// Installs the hook inspecting packets arriving from the tunnel,
    /// before they reach the host kernel — drives the Packet Classifier
    /// (component C). Active from `Start` to `Close`.
    fn set_post_filter_in(&self, hook: Arc<dyn FilterHook>);
}

/// A single buffer handed to us by the engine, carrying its own
/// reference-count discipline (`spec.md` §6: "per-buffer refcount
/// `DecRef`").
///
/// We never clone the underlying bytes out of this type without going
/// through [`EngineBuffer::dec_ref`] first — Rust's ownership rules give us
/// the "exactly once" part of `spec.md` §3 invariant 5 for free; `dec_ref`
/// exists only so the *engine's own* accounting (not ours) stays correct.
pub trait EngineBuffer: Send + 'static {
    fn bytes(&self) -> &[u8];
    fn dec_ref(self: Box<Self>);
}

/// The 5-tuple and deferred endpoint-creation handle the engine exposes
/// when a new TCP flow arrives, before the handshake completes
/// (`spec.md` §4.5).
#[async_trait]
pub trait TcpFlowRequest: Send + Sync {
    fn src(&self) -> SocketAddr;
    fn dst(&self) -> SocketAddr;

    /// Completes the three-way handshake (sends SYN-ACK) and returns a
    /// stream-like endpoint. Must only be called once the caller has
    /// decided to accept the flow — see `spec.md` §4.5 "Deferred endpoint
    /// creation".
    async fn create_endpoint(
        self: Box<Self>,
    ) -> std::io::Result<Box<dyn TcpEndpoint>>;

    /// Completes the request with a TCP RST instead of a SYN-ACK.
    fn reject(self: Box<Self>);
}

/// A live, accepted TCP endpoint inside the engine.
///
/// Not `#[async_trait]`: [`TcpEndpoint::hup`] must be obtainable *before*
/// the endpoint is consumed by `tokio::io::split` (see `tcp_proxy.rs`'s
/// `copy_bidirectional`), so it returns an owned, `'static` future rather
/// than one borrowing `&self` for its whole lifetime.
pub trait TcpEndpoint: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {
    /// Sets the TCP keepalive idle time (`spec.md` §4.5: SSH gets 72h,
    /// everything else gets the engine default of ~2h).
    fn set_keepalive_idle(&self, idle: std::time::Duration);

    /// Returns a future that resolves when the engine signals that the
    /// peer side hung up (`spec.md` §4.5). Call this before handing the
    /// endpoint to `tokio::io::split` — afterwards there is no `&self` left
    /// to call it on.
    fn hup(&self) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// A live UDP endpoint inside the engine, read/written datagram-at-a-time.
#[async_trait]
pub trait UdpEndpoint: Send {
    async fn recv(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    async fn send(&mut self, buf: &[u8]) -> std::io::Result<usize>;
}

/// A new UDP flow handed to the UDP Acceptor (G), already past the engine's
/// own connection tracking — unlike TCP there is no deferred handshake, so
/// the endpoint is ready to use immediately (`spec.md` §4.6).
pub trait UdpFlow: Send {
    fn src(&self) -> SocketAddr;
    fn dst(&self) -> SocketAddr;
    fn into_endpoint(self: Box<Self>) -> Box<dyn UdpEndpoint>;
}

/// A new TCP flow forwarded by the engine, boxed so it can cross a channel
/// or be passed to a spawned task (`spec.md` §4.5).
pub type TcpForwardHandler = Box<dyn Fn(Box<dyn TcpFlowRequest>) + Send + Sync>;

/// A new UDP flow forwarded by the engine (`spec.md` §4.6).
pub type UdpForwardHandler = Box<dyn Fn(Box<dyn UdpFlow>) + Send + Sync>;

/// The embedded TCP/IP engine terminating connections on our behalf
/// (`spec.md` GLOSSARY: "TCP/IP engine").
///
/// `Engine` is what Inbound Injector (D), Outbound Pump (E) and the NIC
/// address mutation in Address Registry (A) all talk to.
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Adds a `/32` (v4) or `/128` (v6) static protocol address to the
    /// single virtual NIC (`spec.md` §4.1).
    async fn add_protocol_address(&self, addr: IpAddr) -> anyhow::Result<()>;

    /// Removes a previously-added address.
    async fn remove_address(&self, addr: IpAddr) -> anyhow::Result<()>;

    /// Enqueues a parsed packet on the engine's L2 channel, consuming one
    /// slot of backpressure (`spec.md` §4.3, §5 "L2 channel buffer holds
    /// 512 packets").
    async fn inject_inbound(&self, packet: ParsedPacket<'_>) -> anyhow::Result<()>;

    /// Blocks until the engine has a synthesized packet ready to leave the
    /// L2 channel, or `ctx` is cancelled (`spec.md` §4.4).
    async fn read_outbound(
        &self,
        ctx: &tokio_util::sync::CancellationToken,
    ) -> Option<Box<dyn EngineBuffer>>;

    /// Registers the callback invoked for every new TCP flow the engine
    /// terminates (`spec.md` §6: "TCP ... forwarder registrations").
    fn register_tcp_forwarder(&self, handler: TcpForwardHandler);

    /// Registers the callback invoked for every new UDP flow.
    fn register_udp_forwarder(&self, handler: UdpForwardHandler);

    /// `spec.md` §6: "`SetTransportProtocolOption` to enable TCP SACK."
    fn enable_tcp_sack(&self);
}
