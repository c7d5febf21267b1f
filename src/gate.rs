//! The detection gate: turns classification events into at most one outbound command each.
//!
//! Order of checks:
//! 1. display floor (`DISPLAY_FLOOR`)
//! 2. background label exclusion
//! 3. configurable device threshold
//! 4. duplicate window (`DEDUP_WINDOW`)
//! 5. send through the attached sink
//!
//! Only the last step has a side effect. The dedup lock is held across the send so a second
//! send can never interleave with the dedup update of the first.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::Result;
use crate::decision::{Decision, DecisionKind};
use crate::event::ClassificationEvent;
use crate::labels::Labels;
use crate::sink::SinkSlot;
use crate::thresholds::Thresholds;

/// Events whose top confidence is under this are never acted on, whatever the device threshold.
pub const DISPLAY_FLOOR: f32 = 0.2;

/// Identical commands inside this window are suppressed. Not user-configurable.
pub const DEDUP_WINDOW: Duration = Duration::from_millis(3000);

/// Confidence reported for manually dispatched commands.
const MANUAL_CONFIDENCE: f32 = 1.0;

/// The last command that was accepted by a sink.
///
/// Only a successful send mutates this. It is never cleared, including across listen sessions
/// and reconnects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupState {
    pub last_sent_command: Option<String>,
    pub last_sent_at: Option<Instant>,
}

impl DedupState {
    /// Whether sending `command` at `now` would repeat the last send inside the window.
    pub fn is_duplicate(&self, command: &str, now: Instant) -> bool {
        match (&self.last_sent_command, self.last_sent_at) {
            (Some(last), Some(at)) if last == command => {
                // `now` earlier than `at` counts as inside the window.
                now.saturating_duration_since(at) < DEDUP_WINDOW
            }
            _ => false,
        }
    }

    fn record(&mut self, command: &str, now: Instant) {
        self.last_sent_command = Some(command.to_owned());
        self.last_sent_at = Some(now);
    }
}

/// Gate context: the label set, the live thresholds, and the dedup state.
pub struct DetectionGate {
    labels: Labels,
    thresholds: Arc<Thresholds>,
    dedup: Mutex<DedupState>,
}

impl DetectionGate {
    pub fn new(labels: Labels, thresholds: Arc<Thresholds>) -> Self {
        Self {
            labels,
            thresholds,
            dedup: Mutex::new(DedupState::default()),
        }
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn thresholds(&self) -> &Arc<Thresholds> {
        &self.thresholds
    }

    /// Copy of the current dedup state.
    pub async fn dedup_snapshot(&self) -> DedupState {
        self.dedup.lock().await.clone()
    }

    /// Decide what to do with one classification event, sending through `sink` when it qualifies.
    ///
    /// Returns `Error::ContractViolation` when the score count doesn't match the label set.
    /// Sink failures never surface as errors; they become [`DecisionKind::SendFailed`].
    pub async fn evaluate(
        &self,
        event: &ClassificationEvent,
        now: Instant,
        sink: &SinkSlot,
    ) -> Result<Decision> {
        let top = event.top(&self.labels)?;
        let (label, confidence) = (top.label, top.confidence);

        if confidence < DISPLAY_FLOOR {
            return Ok(Decision::new(
                DecisionKind::Inconclusive,
                label,
                confidence,
                now,
            ));
        }

        if self.labels.is_background(label) {
            return Ok(Decision::new(
                DecisionKind::BackgroundSuppressed,
                label,
                confidence,
                now,
            ));
        }

        let device_threshold = self.thresholds.device_threshold();
        if confidence < device_threshold {
            debug!(
                label,
                confidence, device_threshold, "detection below device threshold"
            );
            return Ok(Decision::new(
                DecisionKind::BelowThreshold,
                label,
                confidence,
                now,
            ));
        }

        info!(label, confidence, "high confidence detection");
        Ok(self.dispatch(label, confidence, now, sink).await)
    }

    /// Send a command directly, skipping confidence checks but honoring the duplicate window.
    pub async fn dispatch_manual(&self, command: &str, now: Instant, sink: &SinkSlot) -> Decision {
        info!(command, "dispatching manual command");
        self.dispatch(command, MANUAL_CONFIDENCE, now, sink).await
    }

    async fn dispatch(
        &self,
        command: &str,
        confidence: f32,
        now: Instant,
        sink: &SinkSlot,
    ) -> Decision {
        let mut dedup = self.dedup.lock().await;

        if dedup.is_duplicate(command, now) {
            debug!(command, "skipping duplicate command");
            return Decision::new(DecisionKind::Suppressed, command, confidence, now);
        }

        match sink.send(command).await {
            Ok(()) => {
                dedup.record(command, now);
                info!(command, "sent to device");
                Decision::new(DecisionKind::Sent, command, confidence, now)
            }
            Err(err) => {
                warn!(command, error = %err, "failed to send command");
                Decision::send_failed(command, confidence, now, err.to_string())
            }
        }
    }
}
