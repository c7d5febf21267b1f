use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware::from_fn;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info, warn};

mod metrics;
mod output;

use output::ChannelWriter;
use soundgate::cli::{DeviceArgs, EngineArgs, LabelArgs, ThresholdArgs, opts};
use soundgate::serial::{DEFAULT_BAUD_RATE, SerialSink};
use soundgate::{
    Bridge, Decision, DecisionKind, InferenceSource, ListenConfig, OutputType, ThresholdValues,
};

#[derive(Parser, Debug)]
#[command(name = "soundgate-server")]
#[command(about = "Sound-to-device bridge with an HTTP control surface")]
struct Params {
    #[command(flatten)]
    labels: LabelArgs,

    #[command(flatten)]
    device: DeviceArgs,

    #[command(flatten)]
    thresholds: ThresholdArgs,

    #[command(flatten)]
    engine: EngineArgs,

    /// Format for decisions echoed to stdout.
    #[arg(
        short = 'o',
        long = "output-type",
        value_enum,
        default_value_t = OutputType::Json
    )]
    output_type: OutputType,

    /// Host interface to bind to.
    #[arg(long = "host", default_value = "127.0.0.1")]
    host: String,

    /// TCP port to listen on.
    #[arg(long = "port", default_value_t = 8080)]
    port: u16,

    /// Don't start listening until `POST /v1/listen`.
    #[arg(long = "idle", default_value_t = false)]
    idle: bool,
}

#[derive(Clone)]
struct AppState {
    bridge: Arc<Bridge>,
    listener: Arc<Listener>,
}

/// Owns the inference source and the listen session running on it, if any.
struct Listener {
    source: Arc<tokio::sync::Mutex<Box<dyn InferenceSource + Send>>>,
    session: Mutex<Option<Session>>,
    output: ChannelWriter,
    shutdown: CancellationToken,
}

struct Session {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl Listener {
    fn new(
        source: Box<dyn InferenceSource + Send>,
        output: ChannelWriter,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source: Arc::new(tokio::sync::Mutex::new(source)),
            session: Mutex::new(None),
            output,
            shutdown,
        }
    }

    fn is_listening(&self) -> bool {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|session| !session.task.is_finished())
    }

    /// Start a new listen session with the current settings, unless one is already running.
    fn start(&self, bridge: &Arc<Bridge>) -> std::result::Result<ListenConfig, AppError> {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if session.as_ref().is_some_and(|s| !s.task.is_finished()) {
            return Err(AppError::conflict("already listening"));
        }

        let config = bridge.listen_config();
        let stop = self.shutdown.child_token();
        let task = tokio::spawn(listen(
            Arc::clone(bridge),
            Arc::clone(&self.source),
            self.output.clone(),
            stop.clone(),
        ));
        *session = Some(Session { stop, task });
        Ok(config)
    }

    /// Stop the current session and wait for it to release the source.
    async fn stop(&self) {
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            session.stop.cancel();
            if let Err(err) = session.task.await {
                warn!(error = %err, "listen task failed");
            }
        }
    }
}

async fn listen(
    bridge: Arc<Bridge>,
    source: Arc<tokio::sync::Mutex<Box<dyn InferenceSource + Send>>>,
    output: ChannelWriter,
    stop: CancellationToken,
) {
    let mut source = source.lock().await;
    match bridge.run_to_writer(&mut **source, output, stop).await {
        Ok(summary) => info!(
            session_id = %summary.session_id,
            events = summary.events(),
            sent = summary.count(DecisionKind::Sent),
            "listen session ended"
        ),
        Err(err) => error!(error = %err, "listen session failed"),
    }
}

/// Partial settings update; omitted fields keep their current value.
#[derive(Debug, Default, Deserialize)]
struct SettingsUpdate {
    #[serde(default)]
    probability_threshold: Option<f32>,
    #[serde(default)]
    overlap_factor: Option<f32>,
    #[serde(default)]
    device_threshold: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    command: String,
}

#[derive(Debug, Deserialize)]
struct ConnectRequest {
    path: String,
    #[serde(default)]
    baud_rate: Option<u32>,
}

#[derive(Debug, Serialize)]
struct DeviceResponse {
    connected: bool,
}

#[derive(Debug, Serialize)]
struct ListenResponse {
    listening: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<ListenConfig>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    connected: bool,
    listening: bool,
    labels: Vec<String>,
    background_label: String,
    settings: ThresholdValues,
    last_decision: Option<Decision>,
    last_sent_command: Option<String>,
    last_sent_ms_ago: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[tokio::main]
async fn main() {
    soundgate::init_logging();

    if let Err(err) = run().await {
        error!(error = ?err, "soundgate-server failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let params = Params::parse();

    metrics::init();

    let addr: SocketAddr = format!("{}:{}", params.host, params.port)
        .parse()
        .context("invalid host/port bind address")?;

    let labels = params
        .labels
        .load()
        .await
        .context("failed to load class labels")?;
    let bridge = Bridge::new(
        labels,
        opts(&params.thresholds, &params.engine, params.output_type),
    )
    .context("invalid bridge options")?
    .with_observer(Arc::new(metrics::MetricsObserver));
    let bridge = Arc::new(bridge);

    match params.device.open() {
        Ok(Some(sink)) => {
            bridge.sink().attach(Box::new(sink)).await;
        }
        Ok(None) => info!("no device given; connect one with POST /v1/device"),
        // The control surface stays useful without a device; it can be connected later.
        Err(err) => warn!(error = %err, "device connection failed"),
    }

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            signal_shutdown.cancel();
        }
    });

    let (output, _output_thread) = output::spawn_writer("soundgate-stdout", io::stdout())
        .context("failed to start decision output")?;
    let listener = Arc::new(Listener::new(
        params.engine.source(),
        output,
        shutdown.clone(),
    ));
    if params.idle {
        info!("idle; start listening with POST /v1/listen");
    } else if let Err(err) = listener.start(&bridge) {
        warn!(error = %err.message, "listen session not started");
    }

    let state = AppState {
        bridge,
        listener: Arc::clone(&listener),
    };
    let app = router(state).layer(
        TraceLayer::new_for_http()
            .make_span_with(
                DefaultMakeSpan::new()
                    .level(Level::INFO)
                    .include_headers(false),
            )
            .on_response(DefaultOnResponse::new().level(Level::INFO))
            .on_failure(DefaultOnFailure::new().level(Level::ERROR)),
    );

    let tcp_listener = TcpListener::bind(addr).await.context("bind failed")?;
    info!(%addr, "http server listening");
    axum::serve(tcp_listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("server error")?;

    listener.stop().await;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics::prometheus_metrics))
        .route("/v1/status", get(status))
        .route("/v1/settings", get(get_settings).put(update_settings))
        .route("/v1/listen", post(start_listening).delete(stop_listening))
        .route("/v1/commands", post(send_command))
        .route("/v1/device", post(connect_device).delete(disconnect_device))
        .route_layer(from_fn(metrics::track_http_metrics))
        .with_state(state)
}

async fn root() -> &'static str {
    "soundgate-server: GET /v1/status, GET|PUT /v1/settings, POST|DELETE /v1/listen, \
     POST /v1/commands, POST|DELETE /v1/device"
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let bridge = &state.bridge;
    let dedup = bridge.dedup_snapshot().await;
    let last_sent_ms_ago = dedup
        .last_sent_at
        .map(|at| Instant::now().saturating_duration_since(at).as_millis() as u64);

    Json(StatusResponse {
        connected: bridge.sink().is_connected(),
        listening: state.listener.is_listening(),
        labels: bridge.labels().iter().map(str::to_owned).collect(),
        background_label: bridge.labels().background().to_owned(),
        settings: bridge.thresholds().values(),
        last_decision: bridge.last_decision(),
        last_sent_command: dedup.last_sent_command,
        last_sent_ms_ago,
    })
}

async fn get_settings(State(state): State<AppState>) -> Json<ThresholdValues> {
    Json(state.bridge.thresholds().values())
}

/// Apply a partial update. `probability_threshold` and `overlap_factor` reach the engine on the
/// next listen session; `device_threshold` applies to the next event.
async fn update_settings(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> std::result::Result<Json<ThresholdValues>, AppError> {
    let thresholds = state.bridge.thresholds();
    let merged = merge_settings(thresholds.values(), &update);
    thresholds
        .apply(merged)
        .map_err(|err| AppError::bad_request(err.to_string()))?;
    Ok(Json(thresholds.values()))
}

fn merge_settings(current: ThresholdValues, update: &SettingsUpdate) -> ThresholdValues {
    ThresholdValues {
        probability_threshold: update
            .probability_threshold
            .unwrap_or(current.probability_threshold),
        overlap_factor: update.overlap_factor.unwrap_or(current.overlap_factor),
        device_threshold: update.device_threshold.unwrap_or(current.device_threshold),
    }
}

/// Start a listen session. The engine gets the settings current at this moment.
async fn start_listening(
    State(state): State<AppState>,
) -> std::result::Result<Json<ListenResponse>, AppError> {
    let config = state.listener.start(&state.bridge)?;
    Ok(Json(ListenResponse {
        listening: true,
        config: Some(config),
    }))
}

/// Stop the running listen session, if any. Dedup state is kept.
async fn stop_listening(State(state): State<AppState>) -> Json<ListenResponse> {
    state.listener.stop().await;
    Json(ListenResponse {
        listening: false,
        config: None,
    })
}

async fn send_command(
    State(state): State<AppState>,
    Json(req): Json<CommandRequest>,
) -> std::result::Result<Json<Decision>, AppError> {
    let command = req.command.trim();
    if command.is_empty() {
        return Err(AppError::bad_request("command must not be empty"));
    }
    if command.contains('\n') {
        return Err(AppError::bad_request("command must be a single line"));
    }
    Ok(Json(state.bridge.send_manual(command).await))
}

async fn connect_device(
    State(state): State<AppState>,
    Json(req): Json<ConnectRequest>,
) -> std::result::Result<Json<DeviceResponse>, AppError> {
    let baud_rate = req.baud_rate.unwrap_or(DEFAULT_BAUD_RATE);
    let path = req.path.clone();

    let sink = tokio::task::spawn_blocking(move || SerialSink::open(&path, baud_rate))
        .await
        .map_err(|err| AppError::unavailable(err.to_string()))?
        .map_err(|err| AppError::unavailable(err.to_string()))?;

    state.bridge.sink().attach(Box::new(sink)).await;
    Ok(Json(DeviceResponse {
        connected: state.bridge.sink().is_connected(),
    }))
}

async fn disconnect_device(State(state): State<AppState>) -> Json<DeviceResponse> {
    state.bridge.sink().detach().await;
    Json(DeviceResponse {
        connected: state.bridge.sink().is_connected(),
    })
}
