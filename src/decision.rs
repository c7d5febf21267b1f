use std::time::Instant;

use serde::Serialize;

/// Outcome of running one event (or one manual command) through the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// Top confidence was under the display floor.
    Inconclusive,
    /// The top label is the designated background label.
    BackgroundSuppressed,
    /// Above the floor but under the device threshold.
    BelowThreshold,
    /// Same command already sent inside the duplicate window.
    Suppressed,
    /// Command accepted by the sink.
    Sent,
    /// The sink was absent or the write failed. Nothing is retried.
    SendFailed,
}

impl DecisionKind {
    pub const ALL: [DecisionKind; 6] = [
        DecisionKind::Inconclusive,
        DecisionKind::BackgroundSuppressed,
        DecisionKind::BelowThreshold,
        DecisionKind::Suppressed,
        DecisionKind::Sent,
        DecisionKind::SendFailed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DecisionKind::Inconclusive => "inconclusive",
            DecisionKind::BackgroundSuppressed => "background_suppressed",
            DecisionKind::BelowThreshold => "below_threshold",
            DecisionKind::Suppressed => "suppressed",
            DecisionKind::Sent => "sent",
            DecisionKind::SendFailed => "send_failed",
        }
    }
}

/// A gate decision, carrying the top label and confidence regardless of outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub kind: DecisionKind,
    pub label: String,
    pub confidence: f32,
    #[serde(skip)]
    pub at: Instant,
    /// Sink error text for [`DecisionKind::SendFailed`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Decision {
    pub(crate) fn new(kind: DecisionKind, label: &str, confidence: f32, at: Instant) -> Self {
        Self {
            kind,
            label: label.to_owned(),
            confidence,
            at,
            error: None,
        }
    }

    pub(crate) fn send_failed(label: &str, confidence: f32, at: Instant, error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::new(DecisionKind::SendFailed, label, confidence, at)
        }
    }

    pub fn is_sent(&self) -> bool {
        self.kind == DecisionKind::Sent
    }
}
