// Pulsemeter Agent - Pulse replay engine
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Pulse replay engine.
//!
//! Stands in for GPIO interrupts on a host: a CSV script of
//! `timestamp_ms,meter_id` rows is played back through the pipeline's edge
//! handlers with the original spacing, scaled by a speed multiplier.

use crate::metrics::{record_replay_pulse, update_replay_metrics};
use pulsemeter::{EdgeHandler, EdgeSource};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

/// Configuration for pulse replay.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Path to the CSV script.
    pub csv_path: String,
    /// Replay speed multiplier (1.0 = real-time, 10.0 = 10x faster).
    pub speed: f64,
    /// Whether to start over at the end.
    pub loop_replay: bool,
    /// Pause between the last and the first event when looping.
    pub loop_gap_ms: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            csv_path: String::new(),
            speed: 1.0,
            loop_replay: false,
            loop_gap_ms: 1_000,
        }
    }
}

/// State of the replay engine.
#[derive(Debug, Default)]
pub struct ReplayState {
    /// Index of the next event.
    pub position: AtomicUsize,
    /// Events in the script.
    pub total_events: AtomicUsize,
    /// Pulses the queue refused.
    pub dropped: AtomicUsize,
    /// Whether replay is running.
    pub running: AtomicBool,
}

/// One scripted pulse.
#[derive(Debug, Clone)]
struct PulseEvent {
    timestamp_ms: u64,
    handler: Arc<EdgeHandler>,
}

/// Replay engine feeding scripted pulses into edge handlers.
pub struct ReplayEngine {
    config: ReplayConfig,
    state: Arc<ReplayState>,
    events: Vec<PulseEvent>,
}

impl ReplayEngine {
    /// Load a script, resolving every meter against `source`.
    pub fn from_csv(config: ReplayConfig, source: &EdgeSource) -> Result<Self, ReplayError> {
        if config.speed.is_nan() || config.speed <= 0.0 {
            return Err(ReplayError::InvalidSpeed(config.speed));
        }

        let path = Path::new(&config.csv_path);
        if !path.exists() {
            return Err(ReplayError::FileNotFound(config.csv_path.clone()));
        }

        let events = Self::parse_csv(path, source)?;
        if events.is_empty() {
            return Err(ReplayError::EmptyScript);
        }

        let state = Arc::new(ReplayState::default());
        state.total_events.store(events.len(), Ordering::SeqCst);

        Ok(Self {
            config,
            state,
            events,
        })
    }

    /// Parse a CSV script into pulse events.
    fn parse_csv(path: &Path, source: &EdgeSource) -> Result<Vec<PulseEvent>, ReplayError> {
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;

        let headers = reader.headers()?.clone();
        let header_strs: Vec<&str> = headers.iter().collect();
        if header_strs != ["timestamp_ms", "meter_id"] {
            return Err(ReplayError::InvalidFormat(
                "Header must be 'timestamp_ms,meter_id'".to_string(),
            ));
        }

        let mut events = Vec::new();
        let mut previous = 0;
        for result in reader.records() {
            let record = result?;
            let line = record.position().map(|p| p.line()).unwrap_or(0);

            let timestamp_ms: u64 = record
                .get(0)
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    ReplayError::InvalidFormat(format!("Invalid timestamp on line {}", line))
                })?;
            if timestamp_ms < previous {
                return Err(ReplayError::InvalidFormat(format!(
                    "Timestamp goes backwards on line {}",
                    line
                )));
            }
            previous = timestamp_ms;

            let meter_id = record.get(1).unwrap_or_default();
            let handler = source
                .handler(meter_id)
                .ok_or_else(|| ReplayError::UnknownMeter(meter_id.to_string()))?;

            events.push(PulseEvent {
                timestamp_ms,
                handler,
            });
        }

        Ok(events)
    }

    /// Get the replay state.
    pub fn state(&self) -> Arc<ReplayState> {
        Arc::clone(&self.state)
    }

    /// Play the script (forever when looping).
    pub async fn run(&self) {
        self.state.running.store(true, Ordering::SeqCst);
        info!(
            "Starting replay: speed={}, loop={}",
            self.config.speed, self.config.loop_replay
        );

        loop {
            if !self.state.running.load(Ordering::SeqCst) {
                break;
            }

            let position = self.state.position.load(Ordering::SeqCst);
            if position >= self.events.len() {
                if self.config.loop_replay {
                    info!("Script complete, looping...");
                    self.state.position.store(0, Ordering::SeqCst);
                    continue;
                } else {
                    info!("Script complete, stopping");
                    self.state.running.store(false, Ordering::SeqCst);
                    break;
                }
            }

            let event = &self.events[position];
            if !event.handler.on_edge() {
                self.state.dropped.fetch_add(1, Ordering::SeqCst);
                debug!("Queue full, pulse from {} dropped", event.handler.meter_id());
            }
            record_replay_pulse(event.handler.meter_id().as_str());

            self.state.position.fetch_add(1, Ordering::SeqCst);
            update_replay_metrics(position + 1, self.events.len(), self.config.speed);

            let gap_ms = match self.events.get(position + 1) {
                Some(next) => next.timestamp_ms - event.timestamp_ms,
                None if self.config.loop_replay => self.config.loop_gap_ms,
                None => 0,
            };
            let sleep_ms = (gap_ms as f64 / self.config.speed) as u64;
            if sleep_ms > 0 {
                sleep(Duration::from_millis(sleep_ms)).await;
            } else {
                tokio::task::yield_now().await;
            }
        }
    }

    /// Get script info.
    pub fn script_info(&self) -> ScriptInfo {
        let duration_ms = match (self.events.first(), self.events.last()) {
            (Some(first), Some(last)) => last.timestamp_ms - first.timestamp_ms,
            _ => 0,
        };
        let meters: BTreeSet<String> = self
            .events
            .iter()
            .map(|e| e.handler.meter_id().to_string())
            .collect();

        ScriptInfo {
            event_count: self.events.len(),
            duration_ms,
            meter_ids: meters.into_iter().collect(),
        }
    }
}

/// Script information.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScriptInfo {
    pub event_count: usize,
    pub duration_ms: u64,
    pub meter_ids: Vec<String>,
}

/// Replay errors.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Meter {0} is not a configured channel")]
    UnknownMeter(String),

    #[error("Replay speed must be positive, got {0}")]
    InvalidSpeed(f64),

    #[error("Empty script")]
    EmptyScript,
}
