//! Sink for per-message faults that must not end a sync session.

use tracing::{error, warn};

/// Where a fault was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// An inbound frame could not be decoded or classified.
    Message,
    /// A consumer handler returned an error.
    Handler,
    /// A replenishing `RequestNext` could not be sent.
    Replenish,
}

/// Receives faults isolated to a single message or handler invocation.
pub trait FaultSink: Send + Sync {
    fn report(&self, kind: FaultKind, error: &(dyn std::error::Error + 'static));
}

/// Default sink: logs every fault through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingFaultSink;

impl FaultSink for TracingFaultSink {
    fn report(&self, kind: FaultKind, error: &(dyn std::error::Error + 'static)) {
        match kind {
            FaultKind::Message => warn!(?kind, %error, "dropping inbound message"),
            FaultKind::Handler | FaultKind::Replenish => error!(?kind, %error, "chain sync fault"),
        }
    }
}
