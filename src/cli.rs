//! Command-line argument groups shared by the binaries.

use std::path::PathBuf;

use clap::Args;

use crate::labels::{DEFAULT_BACKGROUND_LABEL, Labels};
use crate::opts::Opts;
use crate::output_type::OutputType;
use crate::source::{InferenceSource, JsonLinesSource, ProcessSource};
use crate::thresholds::{
    DEFAULT_DEVICE_THRESHOLD, DEFAULT_OVERLAP_FACTOR, DEFAULT_PROBABILITY_THRESHOLD,
    ThresholdValues,
};
use crate::{Error, Result};

/// Where the model's label set comes from.
#[derive(Args, Debug, Clone)]
pub struct LabelArgs {
    /// Comma-separated labels, in model output order.
    #[arg(long = "labels", value_delimiter = ',', conflicts_with_all = ["metadata", "model_url"])]
    pub labels: Vec<String>,

    /// Path to the model's `metadata.json`.
    #[arg(long = "metadata", conflicts_with = "model_url")]
    pub metadata: Option<PathBuf>,

    /// Model base URL; `metadata.json` is fetched from it (e.g. `http://localhost:8000/model/`).
    #[arg(long = "model-url")]
    pub model_url: Option<String>,

    /// Label that is never forwarded to the device.
    #[arg(long = "background-label", default_value = DEFAULT_BACKGROUND_LABEL)]
    pub background_label: String,
}

impl LabelArgs {
    pub async fn load(&self) -> Result<Labels> {
        let labels = if !self.labels.is_empty() {
            Labels::new(
                self.labels.iter().map(|l| l.trim().to_owned()),
                self.background_label.as_str(),
            )?
        } else if let Some(path) = &self.metadata {
            Labels::from_metadata_file(path, self.background_label.as_str())?
        } else if let Some(url) = &self.model_url {
            load_from_url(url, &self.background_label).await?
        } else {
            return Err(Error::msg(
                "no label source given: pass --labels, --metadata or --model-url",
            ));
        };

        tracing::info!(
            labels = ?labels.iter().collect::<Vec<_>>(),
            background = labels.background(),
            "class labels loaded"
        );
        Ok(labels)
    }
}

#[cfg(feature = "remote")]
async fn load_from_url(url: &str, background: &str) -> Result<Labels> {
    Labels::from_model_url(url, background).await
}

#[cfg(not(feature = "remote"))]
async fn load_from_url(url: &str, _background: &str) -> Result<Labels> {
    Err(Error::msg(format!(
        "cannot fetch '{url}': built without the `remote` feature"
    )))
}

/// Initial threshold values.
#[derive(Args, Debug, Clone)]
pub struct ThresholdArgs {
    /// Engine-side probability threshold.
    #[arg(long = "probability-threshold", default_value_t = DEFAULT_PROBABILITY_THRESHOLD)]
    pub probability_threshold: f32,

    /// Engine-side overlap factor.
    #[arg(long = "overlap-factor", default_value_t = DEFAULT_OVERLAP_FACTOR)]
    pub overlap_factor: f32,

    /// Minimum confidence before a detection is sent to the device.
    #[arg(long = "device-threshold", default_value_t = DEFAULT_DEVICE_THRESHOLD)]
    pub device_threshold: f32,
}

impl ThresholdArgs {
    pub fn values(&self) -> ThresholdValues {
        ThresholdValues {
            probability_threshold: self.probability_threshold,
            overlap_factor: self.overlap_factor,
            device_threshold: self.device_threshold,
        }
    }
}

/// Which inference engine feeds the bridge.
#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    /// Engine command and arguments (after `--`). Its stdout must be JSON lines.
    /// Reads events from stdin when omitted.
    #[arg(last = true)]
    pub engine: Vec<String>,

    /// Don't ask the engine for spectrograms.
    #[arg(long = "no-spectrogram", default_value_t = false)]
    pub no_spectrogram: bool,

    /// Let the engine drop events below the probability threshold instead of reporting them.
    #[arg(long = "engine-gating", default_value_t = false)]
    pub engine_gating: bool,
}

impl EngineArgs {
    pub fn source(&self) -> Box<dyn InferenceSource + Send> {
        match self.engine.split_first() {
            Some((program, args)) => Box::new(ProcessSource::new(program, args)),
            None => Box::new(JsonLinesSource::stdin()),
        }
    }
}

/// Serial device selection.
#[cfg(feature = "serial")]
#[derive(Args, Debug, Clone)]
pub struct DeviceArgs {
    /// Serial device path (e.g. `/dev/ttyACM0`). Without it, sends fail as not connected.
    #[arg(short = 'd', long = "device")]
    pub device: Option<String>,

    /// Serial baud rate.
    #[arg(long = "baud", default_value_t = crate::serial::DEFAULT_BAUD_RATE)]
    pub baud_rate: u32,
}

#[cfg(feature = "serial")]
impl DeviceArgs {
    /// Open the device, if one was named.
    pub fn open(&self) -> Result<Option<crate::serial::SerialSink>> {
        self.device
            .as_deref()
            .map(|path| crate::serial::SerialSink::open(path, self.baud_rate))
            .transpose()
    }
}

/// Map argument groups into library options.
pub fn opts(thresholds: &ThresholdArgs, engine: &EngineArgs, output_type: OutputType) -> Opts {
    Opts {
        thresholds: thresholds.values(),
        include_spectrogram: !engine.no_spectrogram,
        invoke_callback_on_noise_and_unknown: !engine.engine_gating,
        output_type,
    }
}
