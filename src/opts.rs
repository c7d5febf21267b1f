use crate::output_type::OutputType;
use crate::thresholds::ThresholdValues;

/// Options that control how the bridge listens and reports.
///
/// This struct represents *library-level configuration*, not CLI flags directly.
/// The binaries map user input into this type so other frontends (services, tests) can
/// construct it programmatically.
#[derive(Debug, Clone)]
pub struct Opts {
    /// Initial threshold values. They stay adjustable while the bridge runs.
    pub thresholds: ThresholdValues,

    /// Ask the engine to attach spectrograms. Diagnostic only.
    pub include_spectrogram: bool,

    /// Ask the engine to report noise and unknown frames too.
    ///
    /// Leaving this `true` lets the gate see every event; turning it off moves
    /// `probability_threshold` gating into the engine.
    pub invoke_callback_on_noise_and_unknown: bool,

    /// The desired output format for reported decisions.
    pub output_type: OutputType,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            thresholds: ThresholdValues::default(),
            include_spectrogram: true,
            invoke_callback_on_noise_and_unknown: true,
            output_type: OutputType::default(),
        }
    }
}
