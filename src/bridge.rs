//! High-level API for running the sound-to-device bridge.
//!
//! `Bridge` is the single coordinating component. It owns:
//! - the detection gate (labels, dedup state)
//! - the live thresholds, shared with whatever surface lets users adjust them
//! - the sink slot the device connection is attached to
//! - the observers every decision is reported to
//!
//! The event loop in [`Bridge::run`] pulls one event at a time from an [`InferenceSource`] and
//! awaits its evaluation before pulling the next, so there is never more than one evaluation in
//! flight.

use std::collections::HashMap;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::Result;
use crate::decision::{Decision, DecisionKind};
use crate::decision_encoder::{DecisionEncoder, DecisionRecord};
use crate::event::ClassificationEvent;
use crate::gate::{DedupState, DetectionGate};
use crate::json_lines_encoder::JsonLinesEncoder;
use crate::labels::Labels;
use crate::observe::{DecisionObserver, TracingObserver};
use crate::opts::Opts;
use crate::output_type::OutputType;
use crate::sink::SinkSlot;
use crate::source::{InferenceSource, ListenConfig};
use crate::text_encoder::TextEncoder;
use crate::thresholds::Thresholds;

pub struct Bridge {
    gate: DetectionGate,
    sink: Arc<SinkSlot>,
    opts: Opts,
    observers: Vec<Arc<dyn DecisionObserver>>,
    last_decision: watch::Sender<Option<Decision>>,
}

/// What happened during one listen session.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub session_id: Uuid,
    pub counts: HashMap<DecisionKind, u64>,
}

impl RunSummary {
    pub fn count(&self, kind: DecisionKind) -> u64 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn events(&self) -> u64 {
        self.counts.values().sum()
    }
}

impl Bridge {
    /// Create a bridge with no device attached and a tracing observer installed.
    ///
    /// Fails if any initial threshold in `opts` is outside `[0, 1]`.
    pub fn new(labels: Labels, opts: Opts) -> Result<Self> {
        let thresholds = Arc::new(Thresholds::new(opts.thresholds)?);
        if !opts.invoke_callback_on_noise_and_unknown {
            warn!("noise callbacks disabled; the engine will drop events below probability_threshold");
        }

        let (last_decision, _) = watch::channel(None);
        Ok(Self {
            gate: DetectionGate::new(labels, thresholds),
            sink: Arc::new(SinkSlot::new()),
            opts,
            observers: vec![Arc::new(TracingObserver)],
            last_decision,
        })
    }

    /// Add another decision observer (metrics, a UI feed).
    pub fn with_observer(mut self, observer: Arc<dyn DecisionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn labels(&self) -> &Labels {
        self.gate.labels()
    }

    pub fn thresholds(&self) -> &Arc<Thresholds> {
        self.gate.thresholds()
    }

    pub fn sink(&self) -> &Arc<SinkSlot> {
        &self.sink
    }

    pub fn opts(&self) -> &Opts {
        &self.opts
    }

    pub fn gate(&self) -> &DetectionGate {
        &self.gate
    }

    pub async fn dedup_snapshot(&self) -> DedupState {
        self.gate.dedup_snapshot().await
    }

    /// The most recent decision, if any.
    pub fn last_decision(&self) -> Option<Decision> {
        self.last_decision.borrow().clone()
    }

    /// Subscribe to decision updates.
    pub fn watch_decisions(&self) -> watch::Receiver<Option<Decision>> {
        self.last_decision.subscribe()
    }

    /// The engine configuration a listen session starts with.
    pub fn listen_config(&self) -> ListenConfig {
        ListenConfig {
            invoke_callback_on_noise_and_unknown: self.opts.invoke_callback_on_noise_and_unknown,
            ..ListenConfig::from_thresholds(self.thresholds(), self.opts.include_spectrogram)
        }
    }

    /// Evaluate one event and report the decision.
    pub async fn handle(&self, event: &ClassificationEvent, now: Instant) -> Result<Decision> {
        let decision = self.gate.evaluate(event, now, &self.sink).await?;
        self.report(&decision);
        Ok(decision)
    }

    /// Send a command by hand through the duplicate window and the attached sink.
    pub async fn send_manual(&self, command: &str) -> Decision {
        let decision = self
            .gate
            .dispatch_manual(command, Instant::now(), &self.sink)
            .await;
        self.report(&decision);
        decision
    }

    fn report(&self, decision: &Decision) {
        for observer in &self.observers {
            observer.observe(decision);
        }
        self.last_decision.send_replace(Some(decision.clone()));
    }

    /// Run one listen session, writing decisions to `w` in the format chosen by `opts`.
    pub async fn run_to_writer<S, W>(
        &self,
        source: &mut S,
        w: W,
        stop: CancellationToken,
    ) -> Result<RunSummary>
    where
        S: InferenceSource + Send + ?Sized,
        W: Write + Send,
    {
        let writer = BufWriter::new(w);

        // Select an encoder based on the requested output type.
        // We keep this explicit (no trait objects) to avoid lifetime surprises.
        match self.opts.output_type {
            OutputType::Json => {
                let mut encoder = JsonLinesEncoder::new(writer);
                let run_res = self.run(source, &mut encoder, stop).await;
                merge_run_and_close(run_res, encoder.close())
            }
            OutputType::Text => {
                let mut encoder = TextEncoder::new(writer);
                let run_res = self.run(source, &mut encoder, stop).await;
                merge_run_and_close(run_res, encoder.close())
            }
        }
    }

    /// Run one listen session until the source ends or `stop` is cancelled.
    ///
    /// A score vector that doesn't match the label set stops the session and is returned as
    /// `Error::ContractViolation`. Dedup state carries over from earlier sessions.
    pub async fn run<S>(
        &self,
        source: &mut S,
        encoder: &mut (dyn DecisionEncoder + Send),
        stop: CancellationToken,
    ) -> Result<RunSummary>
    where
        S: InferenceSource + Send + ?Sized,
    {
        let session_id = Uuid::new_v4();
        let span = info_span!("listen", %session_id);

        async {
            let config = self.listen_config();
            let mut subscription = source.start(config)?;
            info!(
                probability_threshold = config.probability_threshold,
                overlap_factor = config.overlap_factor,
                device_threshold = self.thresholds().device_threshold(),
                "recognition started"
            );

            let mut summary = RunSummary {
                session_id,
                ..RunSummary::default()
            };

            let res = loop {
                let event = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break Ok(()),
                    event = subscription.next() => event,
                };
                let Some(event) = event else {
                    break Ok(());
                };

                let decision = match self.handle(&event, Instant::now()).await {
                    Ok(decision) => decision,
                    Err(err) => break Err(err),
                };
                *summary.counts.entry(decision.kind).or_default() += 1;

                if let Err(err) = encoder.write_decision(&DecisionRecord::now(&decision)) {
                    break Err(err);
                }
            };

            subscription.stop();
            source.stop();
            info!(
                events = summary.events(),
                sent = summary.count(DecisionKind::Sent),
                "recognition stopped"
            );

            res.map(|()| summary)
        }
        .instrument(span)
        .await
    }
}

fn merge_run_and_close<T>(run_res: Result<T>, close_res: Result<()>) -> Result<T> {
    match (run_res, close_res) {
        (Ok(v), Ok(())) => Ok(v),
        (Ok(_), Err(close_err)) => Err(close_err),
        (Err(err), _) => Err(err),
    }
}
