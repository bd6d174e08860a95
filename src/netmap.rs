//! Network-Map Reconciler (component B, `spec.md` §4.2 "Control flow" and
//! §9 "Address-registry reconciliation").
//!
//! On every network-map update, diffs the desired set of NIC addresses
//! (the self-node's advertised addresses) against what's currently
//! installed and applies the delta — while never touching an address the
//! [`AddressRegistry`] currently holds a refcount on.

use crate::backend::NetworkMap;
use crate::consts::NEVER_TOUCH_V4;
use crate::engine::Engine;
use crate::registry::AddressRegistry;
use crate::utils::SubnetSet;
use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// The atomically-swappable `Addr → bool` predicate from `spec.md` §3:
/// "replaced wholesale on network-map update", with lock-free reads.
#[derive(Default)]
pub struct LocalIpFilter(ArcSwap<HashSet<IpAddr>>);

impl LocalIpFilter {
    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.0.load().contains(addr)
    }

    fn replace(&self, addresses: HashSet<IpAddr>) {
        self.0.store(Arc::new(addresses));
    }
}

/// The routed-subnet membership table (`AllowedIPs` minus the self-node's
/// own addresses), atomically republished alongside [`LocalIpFilter`] on
/// every network-map update.
pub struct RoutedSubnets(ArcSwap<SubnetSet>);

impl Default for RoutedSubnets {
    fn default() -> Self {
        Self(ArcSwap::new(Arc::new(SubnetSet::default())))
    }
}

impl RoutedSubnets {
    pub fn contains(&self, addr: IpAddr) -> bool {
        self.0.load().contains(addr)
    }

    fn replace(&self, set: SubnetSet) {
        self.0.store(Arc::new(set));
    }
}

pub struct NetmapReconciler {
    engine: Arc<dyn Engine>,
    registry: Arc<AddressRegistry>,
    local_ip_filter: Arc<LocalIpFilter>,
    routed_subnets: Arc<RoutedSubnets>,
    /// Addresses currently installed on the NIC because the *network map*
    /// put them there — disjoint from `registry`'s refcounted entries
    /// (`spec.md` §3 invariant 1 parenthetical).
    installed: Mutex<HashSet<IpAddr>>,
}

impl NetmapReconciler {
    pub fn new(
        engine: Arc<dyn Engine>,
        registry: Arc<AddressRegistry>,
        local_ip_filter: Arc<LocalIpFilter>,
        routed_subnets: Arc<RoutedSubnets>,
    ) -> Self {
        Self {
            engine,
            registry,
            local_ip_filter,
            routed_subnets,
            installed: Mutex::default(),
        }
    }

    /// Applies a network-map update: installs newly-advertised self
    /// addresses, removes ones no longer advertised (unless the registry
    /// still holds them), and atomically republishes the local-IP filter.
    ///
    /// `spec.md` §8 end-to-end scenario 5 ("Netmap churn").
    pub async fn reconcile(&self, netmap: &NetworkMap) {
        let desired: HashSet<IpAddr> = netmap.self_addresses.iter().copied().collect();

        // Hold the registry mutex implicitly across this whole
        // compute-then-apply step by serializing reconciles through our own
        // `installed` lock first, per `spec.md` §9: "Implementers should
        // hold the registry mutex across the 'compute ipsToRemove' step."
        let mut installed = self.installed.lock().await;

        let to_remove: Vec<IpAddr> = installed.difference(&desired).copied().collect();
        let to_add: Vec<IpAddr> = desired.difference(&installed).copied().collect();

        for addr in to_remove {
            if is_never_touch(addr) {
                continue;
            }

            if self.registry.holds(&addr).await {
                tracing::debug!(%addr, "Netmap reconcile: address still held by a flow, keeping");
                continue;
            }

            if let Err(e) = self.engine.remove_address(addr).await {
                tracing::warn!(%addr, "Netmap reconcile: failed to remove address: {e:#}");
                continue;
            }

            installed.remove(&addr);
            tracing::debug!(%addr, "Netmap reconcile: removed address");
        }

        for addr in to_add {
            if is_never_touch(addr) {
                continue;
            }

            if let Err(e) = self.engine.add_protocol_address(addr).await {
                tracing::warn!(%addr, "Netmap reconcile: failed to add address: {e:#}");
                continue;
            }

            installed.insert(addr);
            tracing::debug!(%addr, "Netmap reconcile: added address");
        }

        drop(installed);

        self.local_ip_filter.replace(desired);
        self.routed_subnets
            .replace(SubnetSet::from_networks(netmap.allowed_ips.iter().copied()));
    }
}

fn is_never_touch(addr: IpAddr) -> bool {
    matches!(addr, IpAddr::V4(v4) if v4 == NEVER_TOUCH_V4)
}
