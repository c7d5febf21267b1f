//! Inference sources: push-based streams of [`ClassificationEvent`]s.
//!
//! The model itself is a black box. A source is anything that can be started with a
//! [`ListenConfig`], delivers events in FIFO order through a [`Subscription`], and can be stopped.
//!
//! Two adapters are provided:
//! - [`JsonLinesSource`] reads events from any async byte stream (stdin, a file, a socket).
//! - [`ProcessSource`] spawns an external engine and reads events from its stdout.
//!
//! Both accept one event per line, either a bare JSON array of scores or an object with a
//! `scores` field. Malformed lines are logged and skipped.

use std::ffi::OsString;
use std::process::Stdio;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::event::ClassificationEvent;
use crate::thresholds::Thresholds;
use crate::{Error, Result};

/// Buffered events between the reader task and the gate.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Options handed to the inference engine when listening starts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ListenConfig {
    /// Diagnostic only; the gate never looks at spectrograms.
    pub include_spectrogram: bool,
    /// Engine-side gating hint.
    pub probability_threshold: f32,
    /// Engine-side windowing overlap.
    pub overlap_factor: f32,
    /// Must stay `true` for the gate to see every event, not just confident ones.
    pub invoke_callback_on_noise_and_unknown: bool,
}

impl ListenConfig {
    /// Snapshot the engine-facing thresholds.
    ///
    /// Engines read these once per listen session; later changes apply on the next start.
    pub fn from_thresholds(thresholds: &Thresholds, include_spectrogram: bool) -> Self {
        Self {
            include_spectrogram,
            probability_threshold: thresholds.probability_threshold(),
            overlap_factor: thresholds.overlap_factor(),
            invoke_callback_on_noise_and_unknown: true,
        }
    }

    /// Whether the engine would deliver an event with these scores.
    fn delivers(&self, scores: &[f32]) -> bool {
        if self.invoke_callback_on_noise_and_unknown {
            return true;
        }
        let max = scores.iter().copied().filter(|s| !s.is_nan()).fold(f32::MIN, f32::max);
        max >= self.probability_threshold
    }
}

/// A running stream of events. Dropping it stops the stream.
pub struct Subscription {
    rx: mpsc::Receiver<ClassificationEvent>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Build a subscription fed by `rx` and stopped through `cancel`.
    pub fn new(rx: mpsc::Receiver<ClassificationEvent>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }

    /// Next event, or `None` once the stream has ended or was stopped.
    pub async fn next(&mut self) -> Option<ClassificationEvent> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.rx.recv() => event,
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// A handle that stops this subscription from elsewhere (a signal handler, an HTTP route).
    pub fn stop_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A producer of classification events.
pub trait InferenceSource {
    /// Begin listening. Events flow until the subscription is stopped or the source ends.
    fn start(&mut self, config: ListenConfig) -> Result<Subscription>;

    /// Stop the current subscription, if any.
    fn stop(&mut self);
}

/// Events read line by line from an async reader.
///
/// The reader is kept between sessions, so a stopped source can be started again and continues
/// where it left off, including a line that was only partly read when it stopped.
pub struct JsonLinesSource<R> {
    input: Arc<Mutex<LineInput<R>>>,
    current: Option<CancellationToken>,
}

struct LineInput<R> {
    reader: R,
    partial: Vec<u8>,
}

impl<R> JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    pub fn new(reader: R) -> Self {
        Self {
            input: Arc::new(Mutex::new(LineInput {
                reader,
                partial: Vec::new(),
            })),
            current: None,
        }
    }
}

impl JsonLinesSource<BufReader<tokio::io::Stdin>> {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

impl<R> InferenceSource for JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    fn start(&mut self, config: ListenConfig) -> Result<Subscription> {
        self.stop();

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let input = Arc::clone(&self.input);
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            let mut input = input.lock().await;
            let LineInput { reader, partial } = &mut *input;
            pump_events(reader, partial, config, tx, task_cancel).await;
        });

        self.current = Some(cancel.clone());
        Ok(Subscription::new(rx, cancel))
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.current.take() {
            cancel.cancel();
        }
    }
}

/// An external inference engine run as a child process.
///
/// The listen configuration is passed through environment variables:
/// `SOUNDGATE_PROBABILITY_THRESHOLD`, `SOUNDGATE_OVERLAP_FACTOR`,
/// `SOUNDGATE_INCLUDE_SPECTROGRAM` and `SOUNDGATE_INVOKE_ON_NOISE`. The engine writes one event
/// per line to stdout. Stopping the subscription kills the child.
pub struct ProcessSource {
    program: OsString,
    args: Vec<OsString>,
    current: Option<CancellationToken>,
}

impl ProcessSource {
    pub fn new<I, S>(program: impl Into<OsString>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            current: None,
        }
    }

    fn command(&self, config: &ListenConfig) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(
                "SOUNDGATE_PROBABILITY_THRESHOLD",
                config.probability_threshold.to_string(),
            )
            .env("SOUNDGATE_OVERLAP_FACTOR", config.overlap_factor.to_string())
            .env(
                "SOUNDGATE_INCLUDE_SPECTROGRAM",
                config.include_spectrogram.to_string(),
            )
            .env(
                "SOUNDGATE_INVOKE_ON_NOISE",
                config.invoke_callback_on_noise_and_unknown.to_string(),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

impl InferenceSource for ProcessSource {
    fn start(&mut self, config: ListenConfig) -> Result<Subscription> {
        self.stop();

        let program = self.program.to_string_lossy().into_owned();
        let mut child = self.command(&config).spawn().map_err(|err| {
            Error::msg(format!("failed to start inference engine '{program}': {err}"))
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::msg("inference engine stdout was not captured"))?;

        info!(engine = %program, pid = ?child.id(), "inference engine started");

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            pump_events(&mut reader, &mut Vec::new(), config, tx, task_cancel).await;

            if let Err(err) = child.start_kill() {
                // Already exited on its own.
                tracing::debug!(error = %err, "inference engine kill skipped");
            }
            match child.wait().await {
                Ok(status) => info!(engine = %program, %status, "inference engine exited"),
                Err(err) => warn!(engine = %program, error = %err, "failed to reap inference engine"),
            }
        });

        self.current = Some(cancel.clone());
        Ok(Subscription::new(rx, cancel))
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.current.take() {
            cancel.cancel();
        }
    }
}

/// Read lines from `reader` and forward parsed events until EOF, a read error, or cancellation.
///
/// `partial` holds the bytes of a line not yet terminated. It survives cancellation, so a caller
/// that keeps it can resume the same line later.
async fn pump_events<R>(
    reader: &mut R,
    partial: &mut Vec<u8>,
    config: ListenConfig,
    tx: mpsc::Sender<ClassificationEvent>,
    cancel: CancellationToken,
) where
    R: AsyncBufRead + Unpin + ?Sized,
{
    loop {
        // `read_until` keeps partially read bytes in `partial` when the select drops it.
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            read = reader.read_until(b'\n', partial) => read,
        };

        let eof = match read {
            Ok(0) => true,
            Ok(_) => false,
            Err(err) => {
                warn!(error = %err, "inference stream read failed");
                break;
            }
        };

        if !partial.is_empty() {
            let line = String::from_utf8_lossy(partial).into_owned();
            partial.clear();
            if !forward_line(&line, &config, &tx, &cancel).await {
                break;
            }
        }

        if eof {
            info!("inference stream ended");
            break;
        }
    }
}

/// Parse one line and hand it to the subscriber. Returns `false` once nobody is listening.
async fn forward_line(
    line: &str,
    config: &ListenConfig,
    tx: &mpsc::Sender<ClassificationEvent>,
    cancel: &CancellationToken,
) -> bool {
    let event = match parse_event_line(line) {
        Ok(Some(event)) => event,
        Ok(None) => return true,
        Err(err) => {
            warn!(error = %err, line = line.trim(), "skipping malformed event");
            return true;
        }
    };

    if !config.delivers(&event.scores) {
        return true;
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireEvent {
    Scores(Vec<f32>),
    Event(ClassificationEvent),
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse_event_line(line: &str) -> Result<Option<ClassificationEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let event = match serde_json::from_str::<WireEvent>(line)? {
        WireEvent::Scores(scores) => ClassificationEvent::new(scores),
        WireEvent::Event(event) => event,
    };
    Ok(Some(event))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ListenConfig {
        ListenConfig::from_thresholds(&Thresholds::default(), false)
    }

    #[test]
    fn parses_bare_arrays_and_objects() -> anyhow::Result<()> {
        let bare = parse_event_line("[0.1, 0.9]\n")?.expect("event");
        assert_eq!(bare.scores, vec![0.1, 0.9]);

        let obj = parse_event_line(r#"{"scores":[0.3,0.7],"spectrogram":{"frameSize":232}}"#)?
            .expect("event");
        assert_eq!(obj.scores, vec![0.3, 0.7]);
        Ok(())
    }

    #[test]
    fn blank_lines_are_skipped_and_garbage_is_an_error() -> anyhow::Result<()> {
        assert!(parse_event_line("   \n")?.is_none());
        assert!(parse_event_line("not json").is_err());
        assert!(parse_event_line(r#"{"labels":["a"]}"#).is_err());
        Ok(())
    }

    #[test]
    fn config_reads_engine_thresholds() -> anyhow::Result<()> {
        let t = Thresholds::default();
        t.set_overlap_factor(0.3)?;
        let c = ListenConfig::from_thresholds(&t, true);
        assert!(c.include_spectrogram);
        assert!(c.invoke_callback_on_noise_and_unknown);
        assert_eq!(c.overlap_factor, 0.3);
        assert_eq!(c.probability_threshold, 0.75);
        Ok(())
    }

    #[test]
    fn engine_gating_only_applies_when_noise_callbacks_are_off() {
        let mut c = config();
        assert!(c.delivers(&[0.1, 0.1]));
        c.invoke_callback_on_noise_and_unknown = false;
        assert!(!c.delivers(&[0.1, 0.1]));
        assert!(c.delivers(&[0.1, 0.8]));
    }

    #[tokio::test]
    async fn json_lines_source_delivers_in_order_and_skips_bad_lines() -> anyhow::Result<()> {
        let input: &[u8] = b"[0.1,0.9]\n\nnope\n{\"scores\":[0.8,0.2]}\n";
        let mut source = JsonLinesSource::new(input);
        let mut sub = source.start(config())?;

        assert_eq!(sub.next().await.map(|e| e.scores), Some(vec![0.1, 0.9]));
        assert_eq!(sub.next().await.map(|e| e.scores), Some(vec![0.8, 0.2]));
        assert!(sub.next().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn stopped_subscription_yields_nothing() -> anyhow::Result<()> {
        let (client, _server) = tokio::io::duplex(64);
        let mut source = JsonLinesSource::new(BufReader::new(client));
        let mut sub = source.start(config())?;

        source.stop();
        assert!(sub.next().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn restarted_source_continues_reading() -> anyhow::Result<()> {
        use tokio::io::AsyncWriteExt;

        let (client, mut server) = tokio::io::duplex(256);
        let mut source = JsonLinesSource::new(BufReader::new(client));

        let mut first = source.start(config())?;
        server.write_all(b"[0.4,0.6]\n").await?;
        assert_eq!(first.next().await.map(|e| e.scores), Some(vec![0.4, 0.6]));
        drop(first);

        let mut second = source.start(config())?;
        server.write_all(b"[0.6,0.4]\n").await?;
        assert_eq!(second.next().await.map(|e| e.scores), Some(vec![0.6, 0.4]));
        Ok(())
    }

    #[tokio::test]
    async fn line_split_across_a_restart_is_kept_whole() -> anyhow::Result<()> {
        use std::time::Duration;
        use tokio::io::AsyncWriteExt;

        let (client, mut server) = tokio::io::duplex(256);
        let mut source = JsonLinesSource::new(BufReader::new(client));

        let first = source.start(config())?;
        server.write_all(b"[0.3,").await?;
        // Let the reader pick up the fragment before stopping.
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(first);

        let mut second = source.start(config())?;
        server.write_all(b"0.7]\n").await?;
        assert_eq!(second.next().await.map(|e| e.scores), Some(vec![0.3, 0.7]));
        Ok(())
    }

    #[tokio::test]
    async fn final_line_without_newline_is_delivered() -> anyhow::Result<()> {
        let input: &[u8] = b"[0.1,0.9]\n[0.2,0.8]";
        let mut source = JsonLinesSource::new(input);
        let mut sub = source.start(config())?;

        assert_eq!(sub.next().await.map(|e| e.scores), Some(vec![0.1, 0.9]));
        assert_eq!(sub.next().await.map(|e| e.scores), Some(vec![0.2, 0.8]));
        assert!(sub.next().await.is_none());
        Ok(())
    }
}
