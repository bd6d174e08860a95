//! Address Registry (component A, `spec.md` §4.1).
//!
//! Tracks per-subnet-IP reference counts and installs/removes the
//! corresponding `/32` or `/128` static protocol address on the virtual
//! NIC. The engine refuses to accept a SYN for an address it doesn't own;
//! enumerating every address in a routed subnet up front is infeasible, so
//! we install host addresses lazily the first time a flow needs one.

use crate::engine::Engine;
use crate::error::RegistryError;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct Refcounts {
    counts: BTreeMap<IpAddr, usize>,
}

/// `spec.md` §3 invariant 1: `subnetRefcounts[a] > 0` iff `a` is currently
/// present on the NIC because a connection referenced it.
pub struct AddressRegistry {
    engine: Arc<dyn Engine>,
    refcounts: Mutex<Refcounts>,
}

impl AddressRegistry {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            refcounts: Mutex::default(),
        }
    }

    /// Increments the refcount for `ip`; on a 0→1 transition, installs `ip`
    /// on the virtual NIC.
    ///
    /// Operations are mutually exclusive via the internal mutex, held only
    /// across the map mutation, never across the NIC I/O call — matching
    /// `spec.md` §5's rule that the registry mutex is "never held while
    /// doing I/O".
    pub async fn acquire(&self, ip: IpAddr) {
        let first_reference = {
            let mut guard = self.refcounts.lock().await;
            let count = guard.counts.entry(ip).or_insert(0);
            *count += 1;
            *count == 1
        };

        if !first_reference {
            return;
        }

        if let Err(source) = self.engine.add_protocol_address(ip).await {
            // Installation failures are logged, not surfaced: the next
            // `acquire` for this address will retry (`spec.md` §7).
            let error = RegistryError::Add { addr: ip, source };
            tracing::warn!("{error}");
        } else {
            tracing::debug!(%ip, "Installed subnet address on virtual NIC");
        }
    }

    /// Decrements the refcount for `ip`; on a transition to 0, removes it
    /// from the NIC and drops the entry.
    pub async fn release(&self, ip: IpAddr) {
        let last_reference = {
            let mut guard = self.refcounts.lock().await;
            let Some(count) = guard.counts.get_mut(&ip) else {
                tracing::debug!(%ip, "Released an address with no outstanding refcount");
                return;
            };

            *count = count.saturating_sub(1);
            let drained = *count == 0;

            if drained {
                guard.counts.remove(&ip);
            }

            drained
        };

        if !last_reference {
            return;
        }

        if let Err(source) = self.engine.remove_address(ip).await {
            let error = RegistryError::Remove { addr: ip, source };
            tracing::warn!("{error}");
        } else {
            tracing::debug!(%ip, "Removed subnet address from virtual NIC");
        }
    }

    /// Whether `ip` is currently held by at least one in-flight flow —
    /// consulted by the network-map reconciler (component B) so it never
    /// removes an address the registry owns (`spec.md` §3 invariant 2).
    pub async fn holds(&self, ip: &IpAddr) -> bool {
        self.refcounts.lock().await.counts.contains_key(ip)
    }

    #[cfg(test)]
    pub(crate) async fn refcount(&self, ip: &IpAddr) -> usize {
        self.refcounts
            .lock()
            .await
            .counts
            .get(ip)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineBuffer;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeEngine {
        added: AtomicUsize,
        removed: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Engine for FakeEngine {
        async fn add_protocol_address(&self, _addr: IpAddr) -> anyhow::Result<()> {
            self.added.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn remove_address(&self, _addr: IpAddr) -> anyhow::Result<()> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn inject_inbound(
            &self,
            _packet: crate::packet::ParsedPacket<'_>,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn read_outbound(
            &self,
            _ctx: &tokio_util::sync::CancellationToken,
        ) -> Option<Box<dyn EngineBuffer>> {
            None
        }

        fn register_tcp_forwarder(&self, _handler: crate::engine::TcpForwardHandler) {}
        fn register_udp_forwarder(&self, _handler: crate::engine::UdpForwardHandler) {}
        fn enable_tcp_sack(&self) {}
    }

    #[tokio::test]
    async fn install_happens_once_on_first_acquire() {
        let engine = Arc::new(FakeEngine::default());
        let registry = AddressRegistry::new(engine.clone());
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));

        registry.acquire(ip).await;
        registry.acquire(ip).await;

        assert_eq!(engine.added.load(Ordering::SeqCst), 1);
        assert_eq!(registry.refcount(&ip).await, 2);
    }

    #[tokio::test]
    async fn remove_happens_once_refcount_drains() {
        let engine = Arc::new(FakeEngine::default());
        let registry = AddressRegistry::new(engine.clone());
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));

        registry.acquire(ip).await;
        registry.acquire(ip).await;
        registry.release(ip).await;
        assert_eq!(engine.removed.load(Ordering::SeqCst), 0);

        registry.release(ip).await;
        assert_eq!(engine.removed.load(Ordering::SeqCst), 1);
        assert!(!registry.holds(&ip).await);
    }

    #[tokio::test]
    async fn release_without_acquire_is_a_noop() {
        let engine = Arc::new(FakeEngine::default());
        let registry = AddressRegistry::new(engine.clone());
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));

        registry.release(ip).await;

        assert_eq!(engine.removed.load(Ordering::SeqCst), 0);
    }

    // `spec.md` §8 invariant 1: "the net count of acquire(a) minus
    // release(a) matches the registry's observable refcount". Generates a
    // random interleaving of acquire/release calls against a single address
    // and checks the registry's refcount against a hand-tracked net count
    // computed the same way the teacher's property tests check an
    // `Arbitrary`-derived model against the system under test.
    #[cfg(feature = "proptest")]
    mod proptests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone, Copy)]
        enum Op {
            Acquire,
            Release,
        }

        fn ops() -> impl Strategy<Value = Vec<Op>> {
            proptest::collection::vec(
                prop_oneof![Just(Op::Acquire), Just(Op::Release)],
                0..50,
            )
        }

        proptest! {
            #[test]
            fn refcount_matches_net_acquire_release_count(ops in ops()) {
                let rt = tokio::runtime::Runtime::new().unwrap();
                let result: Result<(), TestCaseError> = rt.block_on(async {
                    let engine = Arc::new(FakeEngine::default());
                    let registry = AddressRegistry::new(engine);
                    let ip = IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3));

                    let mut net: i64 = 0;
                    for op in ops {
                        match op {
                            Op::Acquire => {
                                registry.acquire(ip).await;
                                net += 1;
                            }
                            Op::Release => {
                                registry.release(ip).await;
                                net = (net - 1).max(0);
                            }
                        }
                    }

                    let observed = registry.refcount(&ip).await as i64;
                    prop_assert_eq!(observed, net);
                    prop_assert_eq!(observed > 0, registry.holds(&ip).await);
                    Ok(())
                });
                result?;
            }
        }
    }
}
