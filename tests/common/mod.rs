#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use soundgate::{CommandSink, DEFAULT_BACKGROUND_LABEL, Labels, SinkError};

/// Records every command it accepts; can be switched into a failing or stalling mode.
#[derive(Clone, Default)]
pub struct RecordingSink {
    pub sent: Arc<Mutex<Vec<String>>>,
    pub fail: Arc<AtomicBool>,
    pub stall: Arc<AtomicBool>,
}

impl RecordingSink {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().expect("sink lock").clone()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// The next send never completes; later sends behave normally.
    pub fn stall_next_send(&self) {
        self.stall.store(true, Ordering::SeqCst);
    }
}

impl CommandSink for RecordingSink {
    fn send<'a>(&'a mut self, command: &'a str) -> BoxFuture<'a, Result<(), SinkError>> {
        async move {
            if self.stall.swap(false, Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(SinkError::Write(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "device unplugged",
                )));
            }
            self.sent.lock().expect("sink lock").push(command.to_owned());
            Ok(())
        }
        .boxed()
    }
}

pub fn alarm_labels() -> Labels {
    Labels::new([DEFAULT_BACKGROUND_LABEL, "Alarm"], DEFAULT_BACKGROUND_LABEL)
        .expect("valid labels")
}
