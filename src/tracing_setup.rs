//! Test-support subscriber installation (`spec.md` §4.0.1).
//!
//! Unit tests that exercise more than one component at a time (the pump
//! loops, the proxies) benefit from seeing `tracing` output when they fail,
//! the same way the teacher's integration tests do. This mirrors
//! `rust/headless-client/tests/search_domain.rs`'s
//! `tracing_subscriber::fmt().with_test_writer()` idiom, except the default
//! filter directive is taken from [`DispatcherConfig::default_filter_directive`]
//! rather than hard-coded, so `TS_DEBUG_NETSTACK` picks the same verbosity
//! here as it would in production.
//!
//! `RUST_LOG` always wins when set; this only supplies the fallback.

use crate::config::DispatcherConfig;
use tracing_subscriber::EnvFilter;

/// Installs a process-wide `tracing` subscriber for the current test binary,
/// if one isn't already installed. Safe to call from every test that wants
/// logging — `try_init` silently no-ops on the second and later calls.
pub(crate) fn init(config: &DispatcherConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_filter_directive()));

    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(filter)
        .try_init();
}

/// Convenience wrapper for tests that don't care about a custom config.
pub(crate) fn init_default() {
    init(&DispatcherConfig::default());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_does_not_panic_when_called_twice() {
        init_default();
        init_default();
    }
}
