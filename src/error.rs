use std::net::IpAddr;

/// Errors that can bubble out of [`crate::Dispatcher::new`].
///
/// Every other failure mode described in the design (dial failures, bind
/// failures, a missing `ping` binary, ...) is handled locally and logged —
/// see the module-level docs on [`crate::tcp_proxy`] and [`crate::udp_proxy`].
#[derive(thiserror::Error, Debug)]
pub enum ConstructionError {
    #[error("missing required collaborator: {0}")]
    MissingCollaborator(&'static str),
}

/// Why the address registry failed to (un)install an address on the NIC.
///
/// Registry failures are always logged, never surfaced: see `spec.md` §4.1
/// ("Installation failures are logged, not surfaced").
#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("failed to add {addr} to the virtual NIC: {source:#}")]
    Add {
        addr: IpAddr,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to remove {addr} from the virtual NIC: {source:#}")]
    Remove {
        addr: IpAddr,
        #[source]
        source: anyhow::Error,
    },
}
