use std::io;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use soundgate::cli::{DeviceArgs, EngineArgs, LabelArgs, ThresholdArgs, opts};
use soundgate::{Bridge, DecisionKind, OutputType};

#[derive(Parser, Debug)]
#[command(name = "soundgate")]
#[command(about = "Forward confident sound detections to a serial device")]
struct Params {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen for classification events and forward detections.
    Run {
        #[command(flatten)]
        labels: LabelArgs,

        #[command(flatten)]
        device: DeviceArgs,

        #[command(flatten)]
        thresholds: ThresholdArgs,

        #[command(flatten)]
        engine: EngineArgs,

        #[arg(
            short = 'o',
            long = "output-type",
            value_enum,
            default_value_t = OutputType::Text
        )]
        output_type: OutputType,
    },

    /// Send one command to the device, as a connection test.
    Send {
        #[command(flatten)]
        device: DeviceArgs,

        /// Command (label) to send.
        command: String,
    },

    /// Print the model's labels, one per line.
    Labels {
        #[command(flatten)]
        labels: LabelArgs,
    },

    /// List serial ports visible on this machine.
    Ports,
}

#[tokio::main]
async fn main() {
    soundgate::init_logging();

    if let Err(err) = run().await {
        error!(error = ?err, "soundgate failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    match Params::parse().command {
        Command::Run {
            labels,
            device,
            thresholds,
            engine,
            output_type,
        } => {
            let labels = labels.load().await.context("failed to load class labels")?;
            let bridge = Bridge::new(labels, opts(&thresholds, &engine, output_type))
                .context("invalid bridge options")?;

            if let Some(sink) = device.open().context("device connection failed")? {
                bridge.sink().attach(Box::new(sink)).await;
            }

            let stop = CancellationToken::new();
            let ctrl_c_stop = stop.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received");
                    ctrl_c_stop.cancel();
                }
            });

            let mut source = engine.source();
            let summary = bridge
                .run_to_writer(source.as_mut(), io::stdout(), stop)
                .await?;
            info!(
                session_id = %summary.session_id,
                events = summary.events(),
                sent = summary.count(DecisionKind::Sent),
                "done"
            );
            Ok(())
        }

        Command::Send { device, command } => {
            let Some(sink) = device.open().context("device connection failed")? else {
                bail!("no device given; pass --device");
            };

            // Labels are irrelevant for manual sends; the bridge only needs a non-empty set.
            let labels = soundgate::Labels::new([command.as_str()], "")?;
            let bridge = Bridge::new(labels, Default::default())?;
            bridge.sink().attach(Box::new(sink)).await;

            let decision = bridge.send_manual(&command).await;
            println!("{}", serde_json::to_string(&decision)?);
            if !decision.is_sent() {
                bail!("command was not sent ({})", decision.kind.as_str());
            }
            Ok(())
        }

        Command::Labels { labels } => {
            let labels = labels.load().await.context("failed to load class labels")?;
            for label in labels.iter() {
                println!("{label}");
            }
            Ok(())
        }

        Command::Ports => {
            for port in soundgate::serial::available_ports()? {
                println!("{port}");
            }
            Ok(())
        }
    }
}
