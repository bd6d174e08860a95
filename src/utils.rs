//! Subnet-membership helpers shared by the classifier and the network-map
//! reconciler.
//!
//! Grounded in the teacher's `network_contains_network` helper: containment
//! is checked prefix-wise, since the inputs here are single addresses
//! tested against a handful of routed prefixes, not a wildcard lookup.

use ip_network::IpNetwork;
use ip_network_table::IpNetworkTable;
use std::net::IpAddr;

/// A set of routed subnets (`spec.md` §3: `processSubnets` gate, `AllowedIPs`
/// from the network map), queried by address.
#[derive(Default)]
pub struct SubnetSet {
    table: IpNetworkTable<()>,
}

impl SubnetSet {
    pub fn from_networks(networks: impl IntoIterator<Item = IpNetwork>) -> Self {
        let mut table = IpNetworkTable::new();
        for network in networks {
            table.insert(network, ());
        }
        Self { table }
    }

    /// Whether `addr` falls inside any routed subnet — longest-prefix-match
    /// semantics, though for route-acceptance purposes any match is enough.
    pub fn contains(&self, addr: IpAddr) -> bool {
        self.table.longest_match(addr).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn address_inside_routed_subnet_is_contained() {
        let network: IpNetwork = "10.0.0.0/24".parse().unwrap();
        let set = SubnetSet::from_networks([network]);

        assert!(set.contains(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))));
        assert!(!set.contains(IpAddr::V4(Ipv4Addr::new(10, 0, 1, 5))));
    }
}
