//! `soundgate` forwards confident sound-classification results to a microcontroller.
//!
//! This crate provides:
//! - Label-set loading (inline, `metadata.json` on disk, or a model URL)
//! - Inference sources that deliver per-frame score vectors (JSON lines, child-process engines)
//! - The detection gate: display floor, background exclusion, device threshold, duplicate window
//! - Command sinks (any async writer, serial ports)
//! - Decision encoders (JSON lines, text) and observers
//!
//! The model itself is a black box: anything that can print one score vector per line can drive
//! the bridge.

// High-level API (most consumers should start here).
pub mod bridge;
pub mod opts;

// Core decision pipeline.
pub mod decision;
pub mod event;
pub mod gate;
pub mod labels;
pub mod thresholds;

// Event producers and command consumers.
pub mod sink;
pub mod source;

#[cfg(feature = "serial")]
pub mod serial;

// Output selection and encoder interfaces.
pub mod decision_encoder;
pub mod observe;
pub mod output_type;

// Output encoders that serialize decisions into various formats.
pub mod json_lines_encoder;
pub mod text_encoder;

// Logging configuration and control.
#[cfg(feature = "logging")]
pub mod logging;

#[cfg(feature = "cli")]
pub mod cli;

mod error;

pub use bridge::{Bridge, RunSummary};
pub use decision::{Decision, DecisionKind};
pub use error::{Error, Result};
pub use event::ClassificationEvent;
pub use gate::{DEDUP_WINDOW, DISPLAY_FLOOR, DedupState, DetectionGate};
pub use labels::{DEFAULT_BACKGROUND_LABEL, Labels};
pub use opts::Opts;
pub use output_type::OutputType;
pub use sink::{CommandSink, SinkError, SinkSlot, WriterSink};
pub use source::{InferenceSource, JsonLinesSource, ListenConfig, ProcessSource, Subscription};
pub use thresholds::{ThresholdValues, Thresholds};

#[cfg(feature = "logging")]
pub use logging::init as init_logging;
