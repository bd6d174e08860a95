use std::time::Duration;

/// Well-known constants from `spec.md` §6, lifted into a `Clone`able struct so
/// tests can shrink timeouts without touching the production defaults — the
/// teacher crate keeps these as bare `const` items; we only promote them to
/// fields where a test genuinely needs to override one.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Id of the single virtual NIC carrying the default v4/v6 routes.
    pub nic_id: u32,
    /// Capacity of the L2 channel feeding the TCP/IP engine.
    pub l2_channel_capacity: usize,
    /// Max in-flight TCP accepts the engine will buffer for us.
    pub max_tcp_accept_backlog: usize,
    /// Concurrent `ping` child processes allowed at once.
    pub ping_semaphore_permits: usize,
    /// Keepalive-idle applied to in-mesh SSH connections.
    pub ssh_keepalive_idle: Duration,
    /// Keepalive-idle applied to every other accepted TCP endpoint
    /// (`spec.md` §4.5: "Always set TCP keepalive ... engine defaults are
    /// effectively two hours").
    pub tcp_default_keepalive_idle: Duration,
    /// Idle timeout for a generic UDP proxy session.
    pub udp_idle: Duration,
    /// Idle timeout for a magic-DNS UDP proxy session.
    pub udp_idle_dns: Duration,
    /// Read deadline applied to each datagram read in the magic-DNS loop.
    pub dns_read_deadline: Duration,
    /// Max consecutive datagrams served per magic-DNS UDP session.
    pub dns_max_datagrams_per_session: usize,
    /// Verbose (`debug`) vs terse (`info`) logging, read from
    /// `TS_DEBUG_NETSTACK` at construction time.
    pub verbose_logging: bool,
    /// Forwarded verbatim to the engine's leak-check option.
    pub leak_check_mode: LeakCheckMode,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            nic_id: 1,
            l2_channel_capacity: 512,
            max_tcp_accept_backlog: 16,
            ping_semaphore_permits: 20,
            ssh_keepalive_idle: Duration::from_secs(72 * 60 * 60),
            tcp_default_keepalive_idle: Duration::from_secs(2 * 60 * 60),
            udp_idle: Duration::from_secs(2 * 60),
            udp_idle_dns: Duration::from_secs(30),
            dns_read_deadline: Duration::from_millis(150),
            dns_max_datagrams_per_session: 16,
            verbose_logging: read_bool_env("TS_DEBUG_NETSTACK"),
            leak_check_mode: LeakCheckMode::from_env("TS_DEBUG_NETSTACK_LEAK_MODE"),
        }
    }
}

impl DispatcherConfig {
    /// Default `tracing` filter directive implied by `verbose_logging`:
    /// `debug` when `TS_DEBUG_NETSTACK` was set, `info` otherwise. Consumed
    /// by [`crate::tracing_setup`] so test harnesses pick up the same
    /// verbosity the production default would use, absent an explicit
    /// `RUST_LOG` override.
    pub fn default_filter_directive(&self) -> &'static str {
        if self.verbose_logging {
            "debug"
        } else {
            "info"
        }
    }
}

/// Mirrors the engine's leak-check modes. Meaning is owned by the (external)
/// engine; we only parse and forward it, per `spec.md` §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeakCheckMode {
    #[default]
    Disabled,
    LogOnly,
    Panic,
}

impl LeakCheckMode {
    fn from_env(var: &str) -> Self {
        match std::env::var(var).unwrap_or_default().as_str() {
            "" => Self::Disabled,
            "log" => Self::LogOnly,
            "panic" => Self::Panic,
            other => {
                tracing::debug!(value = %other, "Unrecognised leak-check mode, disabling");
                Self::Disabled
            }
        }
    }
}

fn read_bool_env(var: &str) -> bool {
    matches!(
        std::env::var(var).unwrap_or_default().as_str(),
        "1" | "true" | "yes"
    )
}
