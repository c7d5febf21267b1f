use std::io::Write;

use crate::Result;
use crate::decision::DecisionKind;
use crate::decision_encoder::{DecisionEncoder, DecisionRecord};

/// A `DecisionEncoder` that writes human-readable status lines.
///
/// Lines look like `14:03:07: sent Alarm (93.0%)`. Times are UTC wall-clock.
pub struct TextEncoder<W: Write> {
    w: W,
    closed: bool,
}

impl<W: Write> TextEncoder<W> {
    pub fn new(w: W) -> Self {
        Self { w, closed: false }
    }
}

impl<W: Write> DecisionEncoder for TextEncoder<W> {
    fn write_decision(&mut self, record: &DecisionRecord<'_>) -> Result<()> {
        if self.closed {
            return Err(crate::Error::msg(
                "cannot write decision: encoder is already closed",
            ));
        }

        let d = record.decision;
        let time = format_time_of_day(record.timestamp_ms);
        let percent = d.confidence * 100.0;

        match d.kind {
            DecisionKind::Inconclusive => {
                writeln!(&mut self.w, "{time}: listening (max confidence {percent:.1}%)")?
            }
            DecisionKind::SendFailed => writeln!(
                &mut self.w,
                "{time}: send_failed {} ({percent:.1}%): {}",
                d.label,
                d.error.as_deref().unwrap_or("unknown error")
            )?,
            kind => writeln!(
                &mut self.w,
                "{time}: {} {} ({percent:.1}%)",
                kind.as_str(),
                d.label
            )?,
        }

        self.w.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        self.w.flush()?;
        self.closed = true;
        Ok(())
    }
}

/// Format Unix milliseconds as `HH:MM:SS` (UTC).
fn format_time_of_day(timestamp_ms: u64) -> String {
    let total_s = timestamp_ms / 1000;
    let s = total_s % 60;
    let m = (total_s / 60) % 60;
    let h = (total_s / 3600) % 24;
    format!("{h:02}:{m:02}:{s:02}")
}
