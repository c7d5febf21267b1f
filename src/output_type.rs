/// The supported output formats for reported decisions.
///
/// Each variant maps to a concrete `DecisionEncoder` implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum OutputType {
    /// One JSON object per decision, one per line.
    Json,

    /// Human-readable status lines, similar to a serial monitor.
    #[default]
    Text,
}
