// Pulsemeter Agent - Host runner for the pulse pipeline
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Pulsemeter Agent
//!
//! Runs the pulse pipeline against a file-backed ledger and an HTTP
//! collector, exposes Prometheus metrics, and can replay a pulse script in
//! place of real interrupt lines.
//!
//! ## Usage
//!
//! ```bash
//! # Defaults: ./EnergyData.csv, collector at 192.168.21.7:2050
//! pulsemeter-agent
//!
//! # Custom configuration, replay at 10x
//! pulsemeter-agent --config pulsemeter.json --replay pulses.csv --speed 10.0
//! ```

mod metrics;

#[cfg(feature = "replay")]
mod replay;

use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use clap::Parser;
use metrics::{encode_metrics, update_pipeline_metrics};
use pulsemeter::{
    FileMedium, HttpCollector, Pipeline, PipelineConfig, PipelineStats, RunningPipeline,
    StatsSnapshot,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "replay")]
use replay::{ReplayConfig, ReplayEngine, ReplayState, ScriptInfo};

/// Pulsemeter host agent
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "9100")]
    port: u16,

    /// JSON pipeline configuration (defaults apply to missing fields)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the collector URL
    #[arg(long)]
    collector_url: Option<String>,

    /// Override the ledger location
    #[arg(long)]
    ledger: Option<PathBuf>,

    /// Pulse script to replay (timestamp_ms,meter_id)
    #[arg(short, long)]
    replay: Option<String>,

    /// Replay speed multiplier (1.0 = real-time)
    #[arg(short, long, default_value = "1.0")]
    speed: f64,

    /// Loop the replay when it reaches the end
    #[arg(short, long)]
    loop_replay: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Application state shared across handlers.
struct AppState {
    config: PipelineConfig,
    stats: Arc<PipelineStats>,
    pipeline: Mutex<Option<RunningPipeline<FileMedium>>>,
    #[cfg(feature = "replay")]
    replay_state: Option<Arc<ReplayState>>,
    #[cfg(feature = "replay")]
    script_info: Option<ScriptInfo>,
    start_time: std::time::Instant,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize tracing; library `log` records are bridged by the subscriber
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        EnvFilter::from_default_env().add_directive(level.into())
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Pulsemeter Agent v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let running = match start_pipeline(&config).await {
        Ok(running) => running,
        Err(e) => {
            error!("Pipeline startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let stats = Arc::clone(running.stats());

    // Start replay if a script was given
    #[cfg(feature = "replay")]
    let (replay_state, script_info) = if let Some(csv_path) = args.replay.clone() {
        let replay_config = ReplayConfig {
            csv_path,
            speed: args.speed,
            loop_replay: args.loop_replay,
            ..Default::default()
        };

        match ReplayEngine::from_csv(replay_config, running.source()) {
            Ok(engine) => {
                let state = engine.state();
                let info = engine.script_info();

                info!(
                    "Script loaded: {} pulses over {}ms for {} meters",
                    info.event_count,
                    info.duration_ms,
                    info.meter_ids.len()
                );

                tokio::spawn(async move {
                    engine.run().await;
                });

                (Some(state), Some(info))
            }
            Err(e) => {
                error!("Failed to load pulse script: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        info!("No pulse script, waiting for edge input");
        (None, None)
    };

    #[cfg(not(feature = "replay"))]
    if args.replay.is_some() {
        tracing::warn!("Replay feature not enabled, ignoring --replay argument");
    }

    let state = Arc::new(AppState {
        config,
        stats,
        pipeline: Mutex::new(Some(running)),
        #[cfg(feature = "replay")]
        replay_state,
        #[cfg(feature = "replay")]
        script_info,
        start_time: std::time::Instant::now(),
    });

    let app = Router::new()
        .route("/", get(root_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/status", get(status_handler))
        .with_state(Arc::clone(&state));

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("Starting server on http://{}", addr);
    info!("Metrics endpoint: http://{}/metrics", addr);

    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if let Some(running) = state.pipeline.lock().await.take() {
        running.shutdown().await;
    }

    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Server error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Build the pipeline configuration from file and CLI overrides.
fn load_config(args: &Args) -> Result<PipelineConfig, pulsemeter::ConfigError> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(url) = &args.collector_url {
        config.collector_url = url.clone();
    }
    if let Some(ledger) = &args.ledger {
        config.ledger_path = ledger.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Bring the ledger up and start the writer and uploader tasks.
async fn start_pipeline(config: &PipelineConfig) -> pulsemeter::Result<RunningPipeline<FileMedium>> {
    let collector = HttpCollector::new(config.request_timeout())?;
    let medium = FileMedium::new(config.ledger_path.clone());
    let pipeline = Pipeline::build(config.clone(), medium).await?;
    Ok(pipeline.spawn(collector))
}

/// Resolve on Ctrl-C.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

/// Root handler - shows a simple HTML page.
async fn root_handler() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Pulsemeter Agent</title>
    <style>
        body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; max-width: 800px; margin: 50px auto; padding: 20px; }
        h1 { color: #2c3e50; }
        a { color: #3498db; text-decoration: none; }
        .endpoints { background: #f8f9fa; padding: 20px; border-radius: 8px; margin: 20px 0; }
        code { background: #e9ecef; padding: 2px 6px; border-radius: 4px; }
    </style>
</head>
<body>
    <h1>Pulsemeter Agent</h1>
    <p>Pulse capture with durable ledger and acknowledged batch upload.</p>

    <div class="endpoints">
        <h2>Endpoints</h2>
        <div><a href="/metrics">/metrics</a> - Prometheus metrics</div>
        <div><a href="/health">/health</a> - Health check</div>
        <div><a href="/ready">/ready</a> - Readiness check</div>
        <div><a href="/status">/status</a> - Status information (JSON)</div>
    </div>

    <h2>Metrics</h2>
    <ul>
        <li><code>pulsemeter_pulses_captured_total</code> / <code>pulsemeter_pulses_dropped_total</code></li>
        <li><code>pulsemeter_records_appended_total</code> - Records written to the ledger</li>
        <li><code>pulsemeter_uploads_accepted_total</code> / <code>pulsemeter_uploads_rejected_total</code></li>
        <li><code>pulsemeter_last_status</code> - Last collector status</li>
    </ul>
</body>
</html>"#,
    )
}

/// Metrics handler - returns Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    update_pipeline_metrics(&state.stats.snapshot());
    match encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [("Content-Type", "text/plain; charset=utf-8")],
            body,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("Content-Type", "text/plain; charset=utf-8")],
            e.to_string(),
        ),
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Readiness check handler: ledger up and both tasks alive.
async fn ready_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.pipeline.lock().await.as_ref() {
        Some(running) if running.is_running() => (StatusCode::OK, "Ready"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "Not ready"),
    }
}

/// Status information response.
#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_secs: u64,
    collector_url: String,
    ledger_path: String,
    meters: Vec<String>,
    stats: StatsSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    replay: Option<ReplayStatus>,
}

/// Replay status information.
#[derive(Serialize)]
struct ReplayStatus {
    running: bool,
    position: usize,
    total_events: usize,
    dropped: usize,
    progress_percent: f64,
    meter_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_ms: Option<u64>,
}

/// Status handler - returns JSON status information.
async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    #[cfg(feature = "replay")]
    let replay = state.replay_state.as_ref().map(|replay_state| {
        use std::sync::atomic::Ordering;

        let position = replay_state.position.load(Ordering::SeqCst);
        let total = replay_state.total_events.load(Ordering::SeqCst);
        let progress = if total > 0 {
            (position as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        ReplayStatus {
            running: replay_state.running.load(Ordering::SeqCst),
            position,
            total_events: total,
            dropped: replay_state.dropped.load(Ordering::SeqCst),
            progress_percent: progress,
            meter_count: state
                .script_info
                .as_ref()
                .map(|i| i.meter_ids.len())
                .unwrap_or(0),
            duration_ms: state.script_info.as_ref().map(|i| i.duration_ms),
        }
    });

    #[cfg(not(feature = "replay"))]
    let replay: Option<ReplayStatus> = None;

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        collector_url: state.config.collector_url.clone(),
        ledger_path: state.config.ledger_path.display().to_string(),
        meters: state
            .config
            .channels
            .iter()
            .map(|c| c.meter_id.clone())
            .collect(),
        stats: state.stats.snapshot(),
        replay,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pulsemeter.json");
        std::fs::write(&path, r#"{"queue_capacity": 40}"#).unwrap();

        let args = Args::parse_from([
            "pulsemeter-agent",
            "--config",
            path.to_str().unwrap(),
            "--collector-url",
            "http://localhost:2050/api/EnergyData",
            "--ledger",
            "/tmp/ledger.csv",
        ]);
        let config = load_config(&args).unwrap();

        assert_eq!(config.queue_capacity, 40);
        assert_eq!(config.collector_url, "http://localhost:2050/api/EnergyData");
        assert_eq!(config.ledger_path, PathBuf::from("/tmp/ledger.csv"));
    }

    #[test]
    fn test_invalid_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"queue_capacity": 0}"#).unwrap();

        let args = Args::parse_from(["pulsemeter-agent", "--config", path.to_str().unwrap()]);
        assert!(load_config(&args).is_err());
    }

    #[tokio::test]
    async fn test_start_pipeline_creates_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            ledger_path: dir.path().join("EnergyData.csv"),
            ..PipelineConfig::default()
        };

        let running = start_pipeline(&config).await.unwrap();
        assert!(running.is_running());
        assert_eq!(
            std::fs::read_to_string(&config.ledger_path).unwrap(),
            "EnergyMeterID,AccumulatedValue\n"
        );
        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_pipeline_reports_bad_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("EnergyData.csv");
        std::fs::write(&path, "id,value\n").unwrap();
        let config = PipelineConfig {
            ledger_path: path,
            ..PipelineConfig::default()
        };

        assert!(matches!(
            start_pipeline(&config).await,
            Err(pulsemeter::PipelineError::Ledger(_))
        ));
    }

    #[test]
    fn test_status_serializes_stats() {
        let response = StatusResponse {
            version: "0.1.0".into(),
            uptime_secs: 3,
            collector_url: "http://collector".into(),
            ledger_path: "EnergyData.csv".into(),
            meters: vec!["111".into()],
            stats: StatsSnapshot::default(),
            replay: None,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["stats"]["pulses_captured"], 0);
        assert!(json.get("replay").is_none());
    }
}
