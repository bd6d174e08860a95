//! User-Space Ping Shim (component H, `spec.md` §4.7).
//!
//! The embedded TCP/IP engine doesn't implement ICMP; an echo-request that
//! reaches the classifier's `HANDLE-PING` verdict (§4.2 step 6) is answered
//! by shelling out to the host's `ping` binary and synthesizing the
//! corresponding echo-reply ourselves.

use crate::packet::build_icmp_echo_reply;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Semaphore;

/// Bounds concurrent `ping` child processes (`spec.md` §6: "ping semaphore
/// = 20"). Acquire failure (the semaphore being closed) drops the request
/// silently — this never happens in practice since we never `close()` it,
/// but mirrors `spec.md` §4.7: "On acquire failure: drop silently."
pub struct PingShim {
    permits: Arc<Semaphore>,
    tunnel: Arc<dyn crate::engine::TunnelDevice>,
    stats: Arc<crate::stats::Stats>,
}

impl PingShim {
    pub fn new(
        permits: usize,
        tunnel: Arc<dyn crate::engine::TunnelDevice>,
        stats: Arc<crate::stats::Stats>,
    ) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(permits)),
            tunnel,
            stats,
        }
    }

    /// Spawns the ping and, on success, injects the synthesized reply
    /// outbound. Intended to be called as a detached task per echo-request
    /// so the classifier's hot path never blocks on a child process.
    ///
    /// `reply_src`/`reply_dst` are the request's destination/source: the
    /// reply appears to originate from whoever was pinged (`target`, which
    /// may already be the via-translated v4 address).
    pub async fn handle(
        self: Arc<Self>,
        target: IpAddr,
        reply_src: IpAddr,
        reply_dst: IpAddr,
        identifier: u16,
        sequence: u16,
        payload: Vec<u8>,
    ) {
        let Ok(_permit) = self.permits.clone().try_acquire_owned() else {
            tracing::trace!(%target, "Ping semaphore exhausted, dropping echo-request");
            return;
        };

        self.stats
            .ping_requests
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let started = Instant::now();
        match run_ping(target).await {
            Ok(()) => match build_icmp_echo_reply(reply_src, reply_dst, identifier, sequence, &payload) {
                Ok(reply) => {
                    if let Err(e) = self.tunnel.inject_outbound(&reply) {
                        tracing::warn!(%target, "Failed to deliver echo-reply: {e}");
                    }
                }
                Err(e) => tracing::warn!(%target, "Failed to synthesize echo-reply: {e:#}"),
            },
            Err(e) => {
                // `spec.md` §4.7 step 3: a fast failure usually means the
                // `ping` binary is missing or misused; a slow one usually
                // means the target was genuinely unreachable and `ping`
                // already waited out its own timeout — only the former is
                // worth a log line.
                if started.elapsed() < Duration::from_millis(500) {
                    tracing::warn!(%target, "ping exec failed: {e:#}");
                }
            }
        }
    }
}

async fn run_ping(target: IpAddr) -> anyhow::Result<()> {
    let (program, args) = ping_invocation(target);

    let status = Command::new(program)
        .args(&args)
        .status()
        .await
        .map_err(|e| anyhow::anyhow!("failed to spawn `{program}`: {e}"))?;

    if !status.success() {
        anyhow::bail!("`{program}` exited with {status}");
    }

    Ok(())
}

/// `spec.md` §4.7 step 2: OS-specific `ping` invocation.
fn ping_invocation(target: IpAddr) -> (&'static str, Vec<String>) {
    let addr = target.to_string();

    if cfg!(target_os = "windows") {
        ("ping", vec!["-n".into(), "1".into(), "-w".into(), "3000".into(), addr])
    } else if cfg!(target_os = "macos") {
        ("ping", vec!["-c".into(), "1".into(), "-W".into(), "2000".into(), addr])
    } else if cfg!(target_os = "android") {
        let bin = match target {
            IpAddr::V4(_) => "/system/bin/ping",
            IpAddr::V6(_) => "/system/bin/ping6",
        };
        (bin, vec!["-c".into(), "1".into(), "-W".into(), "3".into(), addr])
    } else {
        ("ping", vec!["-c".into(), "1".into(), "-W".into(), "3".into(), addr])
    }
}
