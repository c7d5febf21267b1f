use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::Result;
use crate::decision::Decision;

/// Sink for reported decisions (stdout, a log file, a socket).
pub trait DecisionEncoder {
    fn write_decision(&mut self, record: &DecisionRecord<'_>) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

/// A decision stamped with wall-clock time for reporting.
#[derive(Debug, Serialize)]
pub struct DecisionRecord<'a> {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub decision: &'a Decision,
}

impl<'a> DecisionRecord<'a> {
    pub fn new(decision: &'a Decision, at: SystemTime) -> Self {
        let timestamp_ms = at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            timestamp_ms,
            decision,
        }
    }

    pub fn now(decision: &'a Decision) -> Self {
        Self::new(decision, SystemTime::now())
    }
}
