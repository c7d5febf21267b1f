use std::io::Write;

use crate::Result;
use crate::decision_encoder::{DecisionEncoder, DecisionRecord};

/// A `DecisionEncoder` that writes one JSON object per line (NDJSON).
///
/// Each line stands alone, so consumers can tail the output while the bridge runs.
///
/// Example output:
/// ```json
/// {"timestamp_ms":1700000000000,"kind":"sent","label":"Alarm","confidence":0.93}
/// {"timestamp_ms":1700000000400,"kind":"suppressed","label":"Alarm","confidence":0.91}
/// ```
pub struct JsonLinesEncoder<W: Write> {
    /// The underlying writer we stream JSON into.
    w: W,

    /// Once closed, no further writes are allowed.
    closed: bool,
}

impl<W: Write> JsonLinesEncoder<W> {
    pub fn new(w: W) -> Self {
        Self { w, closed: false }
    }
}

impl<W: Write> DecisionEncoder for JsonLinesEncoder<W> {
    fn write_decision(&mut self, record: &DecisionRecord<'_>) -> Result<()> {
        if self.closed {
            return Err(crate::Error::msg(
                "cannot write decision: encoder is already closed",
            ));
        }

        serde_json::to_writer(&mut self.w, record)?;
        self.w.write_all(b"\n")?;

        // Flush so streaming consumers (stdout, pipes, sockets) see output promptly.
        self.w.flush()?;

        Ok(())
    }

    /// Flush the underlying writer. Calling `close()` more than once is safe.
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        self.w.flush()?;
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant, UNIX_EPOCH};

    use super::*;
    use crate::decision::{Decision, DecisionKind};

    fn decision(kind: DecisionKind, label: &str, confidence: f32) -> Decision {
        Decision {
            kind,
            label: label.to_owned(),
            confidence,
            at: Instant::now(),
            error: None,
        }
    }

    #[test]
    fn writes_one_object_per_line() -> anyhow::Result<()> {
        let mut out = Vec::new();
        let mut enc = JsonLinesEncoder::new(&mut out);
        let at = UNIX_EPOCH + Duration::from_millis(1_500);

        let sent = decision(DecisionKind::Sent, "Alarm", 0.9);
        let skipped = decision(DecisionKind::BackgroundSuppressed, "Background Noise", 0.95);
        enc.write_decision(&DecisionRecord::new(&sent, at))?;
        enc.write_decision(&DecisionRecord::new(&skipped, at))?;
        enc.close()?;

        let s = std::str::from_utf8(&out)?;
        let lines: Vec<serde_json::Value> = s
            .lines()
            .map(serde_json::from_str)
            .collect::<std::result::Result<_, _>>()?;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "sent");
        assert_eq!(lines[0]["label"], "Alarm");
        assert_eq!(lines[0]["timestamp_ms"], 1_500);
        assert!(lines[0].get("error").is_none());
        assert_eq!(lines[1]["kind"], "background_suppressed");
        Ok(())
    }

    #[test]
    fn send_failures_carry_the_error() -> anyhow::Result<()> {
        let mut out = Vec::new();
        let mut enc = JsonLinesEncoder::new(&mut out);
        let mut failed = decision(DecisionKind::SendFailed, "Alarm", 0.9);
        failed.error = Some("device not connected".to_owned());
        enc.write_decision(&DecisionRecord::now(&failed))?;

        let v: serde_json::Value = serde_json::from_slice(&out)?;
        assert_eq!(v["kind"], "send_failed");
        assert_eq!(v["error"], "device not connected");
        Ok(())
    }

    #[test]
    fn write_after_close_errors() -> anyhow::Result<()> {
        let mut out = Vec::new();
        let mut enc = JsonLinesEncoder::new(&mut out);
        enc.close()?;
        enc.close()?;
        let d = decision(DecisionKind::Sent, "Alarm", 0.9);
        let err = enc.write_decision(&DecisionRecord::now(&d)).unwrap_err();
        assert!(err.to_string().contains("already closed"));
        Ok(())
    }
}
