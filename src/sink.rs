//! Outbound command transport.
//!
//! A command is a label string written as a single `\n`-terminated UTF-8 line. Success means the
//! transport accepted the bytes, not that the device acted on them.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::info;

/// Failure reported by a [`CommandSink`]. Always recovered into a `SendFailed` decision.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("device not connected")]
    Unavailable,

    #[error("write failed: {0}")]
    Write(#[from] io::Error),
}

/// Something that accepts outbound commands.
///
/// The method returns a boxed future so sinks can live behind `dyn` in a [`SinkSlot`].
pub trait CommandSink: Send {
    fn send<'a>(&'a mut self, command: &'a str) -> BoxFuture<'a, Result<(), SinkError>>;

    /// Short human-readable name used in logs.
    fn describe(&self) -> String {
        "command sink".to_owned()
    }
}

/// Frame a command for the wire.
pub fn encode_command(command: &str) -> Vec<u8> {
    let mut line = Vec::with_capacity(command.len() + 1);
    line.extend_from_slice(command.as_bytes());
    line.push(b'\n');
    line
}

/// A [`CommandSink`] over any async writer (a tty opened as a file, a socket, stdout, ...).
pub struct WriterSink<W> {
    w: W,
    name: String,
}

impl<W> WriterSink<W> {
    pub fn new(w: W, name: impl Into<String>) -> Self {
        Self {
            w,
            name: name.into(),
        }
    }

    pub fn into_inner(self) -> W {
        self.w
    }
}

impl<W> CommandSink for WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn send<'a>(&'a mut self, command: &'a str) -> BoxFuture<'a, Result<(), SinkError>> {
        async move {
            self.w.write_all(&encode_command(command)).await?;
            // Flush so line-oriented readers on the far end see the command promptly.
            self.w.flush().await?;
            Ok(())
        }
        .boxed()
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Holds the currently attached sink, if any.
///
/// The gate only observes whether a sink is present; attaching and detaching belong to whoever
/// manages the connection.
#[derive(Default)]
pub struct SinkSlot {
    inner: Mutex<Option<Box<dyn CommandSink>>>,
    connected: AtomicBool,
}

impl SinkSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a slot with a sink already attached.
    pub fn with_sink(sink: Box<dyn CommandSink>) -> Self {
        Self {
            inner: Mutex::new(Some(sink)),
            connected: AtomicBool::new(true),
        }
    }

    /// Attach a sink, replacing (and returning) any previous one.
    pub async fn attach(&self, sink: Box<dyn CommandSink>) -> Option<Box<dyn CommandSink>> {
        let name = sink.describe();
        let mut guard = self.inner.lock().await;
        let previous = guard.replace(sink);
        self.connected.store(true, Ordering::Release);
        info!(sink = %name, "device connection established");
        previous
    }

    pub async fn detach(&self) -> Option<Box<dyn CommandSink>> {
        let mut guard = self.inner.lock().await;
        self.connected.store(false, Ordering::Release);
        let previous = guard.take();
        if let Some(sink) = &previous {
            info!(sink = %sink.describe(), "device disconnected");
        }
        previous
    }

    /// Whether a sink is attached. Never waits on an in-flight send.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Send through the attached sink, or fail with [`SinkError::Unavailable`] right away.
    pub async fn send(&self, command: &str) -> Result<(), SinkError> {
        if !self.is_connected() {
            return Err(SinkError::Unavailable);
        }

        let mut guard = self.inner.lock().await;
        match guard.as_mut() {
            Some(sink) => sink.send(command).await,
            None => Err(SinkError::Unavailable),
        }
    }
}
