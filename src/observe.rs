use tracing::{debug, info, warn};

use crate::decision::{Decision, DecisionKind};

/// Receives every decision the bridge makes, for logging or telemetry.
///
/// Observers are called inline on the evaluation path and must not block.
pub trait DecisionObserver: Send + Sync {
    fn observe(&self, decision: &Decision);
}

/// Reports decisions through `tracing`.
///
/// Sends and send failures log at `info`/`warn`; the high-frequency outcomes log at `debug`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl DecisionObserver for TracingObserver {
    fn observe(&self, d: &Decision) {
        let kind = d.kind.as_str();
        match d.kind {
            DecisionKind::Sent => info!(
                kind,
                label = %d.label,
                confidence = d.confidence,
                "sound detected and sent"
            ),
            DecisionKind::SendFailed => warn!(
                kind,
                label = %d.label,
                confidence = d.confidence,
                error = d.error.as_deref().unwrap_or_default(),
                "sound detected but not delivered"
            ),
            _ => debug!(
                kind,
                label = %d.label,
                confidence = d.confidence,
                "decision"
            ),
        }
    }
}
