//! Decision output for the server.
//!
//! Encoders write synchronously. Stdout can be a pipe that stops draining, so bytes are handed to
//! a dedicated thread instead of being written on an async worker.

use std::io::{self, Write};
use std::sync::mpsc;
use std::thread::JoinHandle;

use tracing::warn;

/// A `Write` handle that forwards every buffer to the output thread. Never blocks.
#[derive(Clone)]
pub struct ChannelWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

/// Start a thread named `name` that owns `w` and writes whatever the returned handles send.
///
/// The thread exits once every [`ChannelWriter`] is dropped or a write fails, and hands `w` back.
pub fn spawn_writer<W>(name: &str, mut w: W) -> io::Result<(ChannelWriter, JoinHandle<W>)>
where
    W: Write + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    let handle = std::thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || {
            for chunk in rx {
                if let Err(err) = w.write_all(&chunk).and_then(|()| w.flush()) {
                    warn!(error = %err, "decision output failed");
                    break;
                }
            }
            w
        })?;
    Ok((ChannelWriter { tx }, handle))
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "decision output closed"))?;
        Ok(buf.len())
    }

    // The output thread flushes after every chunk.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
