use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize structured JSON logging.
///
/// Defaults to `info` level unless overridden by `SOUNDGATE_LOG`. Status messages (model
/// loaded, device connected, commands sent) are logged at `info`, so the default shows them.
pub fn init() {
    let filter = EnvFilter::builder()
        .with_env_var("SOUNDGATE_LOG")
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .from_env_lossy();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(std::io::stderr),
        )
        .try_init();
}
