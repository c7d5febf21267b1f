//! Serial-port device connection.
//!
//! Writes go through [`SerialSink`], which implements [`CommandSink`]. A background thread reads
//! whatever the device prints back and logs it line by line.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serialport::SerialPort;
use tracing::{info, warn};

use crate::sink::{CommandSink, SinkError, encode_command};
use crate::{Error, Result};

/// Baud rate the device firmware listens at unless told otherwise.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// How long a blocking read waits before re-checking whether the reader should stop.
const READ_TIMEOUT: Duration = Duration::from_millis(250);

/// A serial device accepting newline-terminated commands.
pub struct SerialSink {
    // Shared with the blocking write task, which may outlive a cancelled `send`.
    port: Arc<Mutex<Box<dyn SerialPort>>>,
    name: String,
    reader_stop: Arc<AtomicBool>,
}

impl SerialSink {
    /// Open `path` at `baud_rate` and start logging what the device sends back.
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|err| Error::msg(format!("failed to open serial port '{path}': {err}")))?;

        let sink = Self::from_port(port, path)?;
        info!(port = path, baud_rate, "serial port opened");
        Ok(sink)
    }

    /// Wrap an already opened port. The port's read timeout paces the reader thread.
    pub fn from_port(port: Box<dyn SerialPort>, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let reader = port
            .try_clone()
            .map_err(|err| Error::msg(format!("failed to clone serial port '{name}': {err}")))?;

        let reader_stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&reader_stop);
        std::thread::Builder::new()
            .name("soundgate-serial-reader".to_owned())
            .spawn(move || read_device_lines(reader, &thread_stop))?;

        Ok(Self {
            port: Arc::new(Mutex::new(port)),
            name,
            reader_stop,
        })
    }
}

impl Drop for SerialSink {
    fn drop(&mut self) {
        self.reader_stop.store(true, Ordering::Release);
    }
}

impl CommandSink for SerialSink {
    fn send<'a>(
        &'a mut self,
        command: &'a str,
    ) -> BoxFuture<'a, std::result::Result<(), SinkError>> {
        let port = Arc::clone(&self.port);
        let frame = encode_command(command);
        async move {
            // serialport is blocking; keep it off the async workers. If the caller gives up, the
            // write still finishes and releases the port.
            tokio::task::spawn_blocking(move || {
                let mut port = port
                    .lock()
                    .map_err(|_| io::Error::other("serial port lock poisoned"))?;
                port.write_all(&frame)?;
                port.flush()
            })
            .await
            .map_err(|err| SinkError::Write(io::Error::other(err)))?
            .map_err(SinkError::from)
        }
        .boxed()
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Names of the serial ports visible on this machine.
pub fn available_ports() -> Result<Vec<String>> {
    let ports = serialport::available_ports()
        .map_err(|err| Error::msg(format!("failed to enumerate serial ports: {err}")))?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

/// Log every line read from `port` until EOF, a hard read error, or `stop` is set.
///
/// Read timeouts are expected and only used to poll `stop`. Returns the lines seen.
fn read_device_lines<R: Read>(port: R, stop: &AtomicBool) -> Vec<String> {
    let mut reader = BufReader::new(port);
    let mut buf = Vec::new();
    let mut seen = Vec::new();

    while !stop.load(Ordering::Acquire) {
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    emit_device_line(&buf, &mut seen);
                    buf.clear();
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(err) => {
                warn!(error = %err, "serial read error");
                break;
            }
        }
    }

    // Trailing text without a newline.
    emit_device_line(&buf, &mut seen);
    seen
}

fn emit_device_line(raw: &[u8], seen: &mut Vec<String>) {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    info!(line = text, "device output");
    seen.push(text.to_owned());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_logs_trimmed_non_empty_lines() {
        let input: &[u8] = b"READY\r\n\nLED on: Alarm\r\npartial";
        let stop = AtomicBool::new(false);
        let lines = read_device_lines(input, &stop);
        assert_eq!(lines, ["READY", "LED on: Alarm", "partial"]);
    }

    #[test]
    fn reader_exits_immediately_when_stopped() {
        let input: &[u8] = b"READY\n";
        let stop = AtomicBool::new(true);
        assert!(read_device_lines(input, &stop).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_send_keeps_the_port() -> anyhow::Result<()> {
        use std::time::Instant;

        use crate::decision::DecisionKind;
        use crate::gate::DetectionGate;
        use crate::labels::{DEFAULT_BACKGROUND_LABEL, Labels};
        use crate::sink::SinkSlot;
        use crate::thresholds::Thresholds;

        let (mut host, mut device) = serialport::TTYPort::pair()?;
        device.set_timeout(Duration::from_secs(5))?;
        host.set_timeout(Duration::from_millis(50))?;

        let sink = SerialSink::from_port(Box::new(device), "pty")?;
        let slot = Arc::new(SinkSlot::with_sink(Box::new(sink)));
        let labels = Labels::new([DEFAULT_BACKGROUND_LABEL, "Alarm"], DEFAULT_BACKGROUND_LABEL)?;
        let gate = Arc::new(DetectionGate::new(labels, Arc::new(Thresholds::default())));

        // Larger than the pty buffer, so the write blocks until the host side reads.
        let oversized = "x".repeat(200_000);
        let stalled = {
            let (gate, slot) = (Arc::clone(&gate), Arc::clone(&slot));
            tokio::spawn(async move {
                gate.dispatch_manual(&oversized, Instant::now(), &slot)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        stalled.abort();
        assert!(stalled.await.is_err());

        let drain = std::thread::spawn(move || {
            let mut seen = Vec::new();
            let mut buf = [0u8; 4096];
            let deadline = Instant::now() + Duration::from_secs(10);
            while Instant::now() < deadline && !seen.windows(5).any(|w| w == b"Alarm") {
                match host.read(&mut buf) {
                    Ok(n) => seen.extend_from_slice(&buf[..n]),
                    Err(err) if err.kind() == io::ErrorKind::TimedOut => {}
                    Err(_) => break,
                }
            }
            seen
        });

        let decision = gate.dispatch_manual("Alarm", Instant::now(), &slot).await;
        assert_eq!(decision.kind, DecisionKind::Sent, "{:?}", decision.error);
        assert!(slot.is_connected());

        let seen = drain.join().expect("drain thread");
        assert!(seen.windows(5).any(|w| w == b"Alarm"));
        Ok(())
    }

    #[test]
    fn missing_port_is_a_clear_error() {
        let err = match SerialSink::open("/dev/soundgate-does-not-exist", DEFAULT_BAUD_RATE) {
            Ok(_) => panic!("expected error for missing port"),
            Err(err) => err.to_string(),
        };
        assert!(err.contains("failed to open serial port"), "unexpected: {err}");
    }
}
