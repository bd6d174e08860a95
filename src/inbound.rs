//! Inbound Injector (component D, `spec.md` §4.3).

use crate::engine::Engine;
use crate::packet::ParsedPacket;
use std::sync::Arc;

/// Pushes a classifier-admitted packet into the engine's L2 channel.
///
/// The engine takes its own copy and owns its own buffer refcount from the
/// moment `inject_inbound` returns — there is nothing for us to decrement
/// afterwards; Rust's ownership of `packet` already gives the "exactly
/// once" half of `spec.md` §3 invariant 5 that the teacher's engine
/// enforces with an explicit `DecRef` call.
pub struct InboundInjector {
    engine: Arc<dyn Engine>,
}

impl InboundInjector {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    /// `spec.md` §4.3: "enqueue it on the engine's L2 channel." Backpressure
    /// from a full 512-entry channel (`spec.md` §5) is implicit in this
    /// call blocking.
    pub async fn inject(&self, packet: ParsedPacket<'_>) -> anyhow::Result<()> {
        self.engine.inject_inbound(packet).await
    }
}
