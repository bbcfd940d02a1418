// Pulsemeter Agent - Prometheus metrics definitions
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Prometheus metrics for the pulse pipeline.
//!
//! Pipeline counters live in [`PipelineStats`](pulsemeter::PipelineStats);
//! the registry counters are advanced to match them on every scrape so the
//! library itself never depends on Prometheus.

use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_int_counter, register_int_counter_vec, register_int_gauge, Encoder,
    Gauge, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use pulsemeter::StatsSnapshot;

lazy_static! {
    // ============================================================
    // Edge side
    // ============================================================

    /// Pulses accepted into the event queue.
    pub static ref PULSES_CAPTURED: IntCounter = register_int_counter!(
        "pulsemeter_pulses_captured_total",
        "Pulses accepted into the event queue"
    ).unwrap();

    /// Pulses lost because the event queue was full.
    pub static ref PULSES_DROPPED: IntCounter = register_int_counter!(
        "pulsemeter_pulses_dropped_total",
        "Pulses lost to event queue overflow"
    ).unwrap();

    /// Share of pulses lost to overflow (0-1).
    pub static ref DROP_RATE: Gauge = register_gauge!(
        "pulsemeter_drop_rate",
        "Fraction of pulses lost to event queue overflow (0-1)"
    ).unwrap();

    // ============================================================
    // Ledger writer
    // ============================================================

    /// Records durably appended to the ledger.
    pub static ref RECORDS_APPENDED: IntCounter = register_int_counter!(
        "pulsemeter_records_appended_total",
        "Records durably appended to the ledger"
    ).unwrap();

    /// Appends refused by storage.
    pub static ref APPEND_FAILURES: IntCounter = register_int_counter!(
        "pulsemeter_append_failures_total",
        "Ledger appends refused by storage"
    ).unwrap();

    /// Ledger lock acquisitions that timed out.
    pub static ref LOCK_TIMEOUTS: IntCounter = register_int_counter!(
        "pulsemeter_lock_timeouts_total",
        "Ledger lock acquisitions that timed out"
    ).unwrap();

    // ============================================================
    // Batch uploader
    // ============================================================

    /// Upload cycles started.
    pub static ref UPLOAD_CYCLES: IntCounter = register_int_counter!(
        "pulsemeter_upload_cycles_total",
        "Upload cycles started"
    ).unwrap();

    /// Batches acknowledged by the collector.
    pub static ref UPLOADS_ACCEPTED: IntCounter = register_int_counter!(
        "pulsemeter_uploads_accepted_total",
        "Batches acknowledged with the success status"
    ).unwrap();

    /// Batches answered with another status.
    pub static ref UPLOADS_REJECTED: IntCounter = register_int_counter!(
        "pulsemeter_uploads_rejected_total",
        "Batches answered with a non-success status"
    ).unwrap();

    /// Uploads that never got a status.
    pub static ref TRANSPORT_FAILURES: IntCounter = register_int_counter!(
        "pulsemeter_transport_failures_total",
        "Uploads that failed before a status arrived"
    ).unwrap();

    /// Upload cycles abandoned on an unreadable ledger.
    pub static ref CORRUPT_CYCLES: IntCounter = register_int_counter!(
        "pulsemeter_corrupt_cycles_total",
        "Upload cycles abandoned because the ledger did not parse"
    ).unwrap();

    /// Records removed from the ledger after acknowledgment.
    pub static ref RECORDS_UPLOADED: IntCounter = register_int_counter!(
        "pulsemeter_records_uploaded_total",
        "Records acknowledged by the collector"
    ).unwrap();

    /// Last HTTP status received from the collector (0 = none yet).
    pub static ref LAST_STATUS: IntGauge = register_int_gauge!(
        "pulsemeter_last_status",
        "Last HTTP status received from the collector"
    ).unwrap();

    // ============================================================
    // Replay
    // ============================================================

    /// Pulses injected by the replay engine (labeled by meter).
    pub static ref REPLAY_PULSES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "pulsemeter_replay_pulses_total",
        "Pulses injected by the replay engine",
        &["meter"]
    ).unwrap();

    /// Current replay position (event index).
    pub static ref REPLAY_POSITION: IntGauge = register_int_gauge!(
        "pulsemeter_replay_position",
        "Current replay position (event index)"
    ).unwrap();

    /// Total events in the replay script.
    pub static ref REPLAY_TOTAL_EVENTS: IntGauge = register_int_gauge!(
        "pulsemeter_replay_total_events",
        "Total events in the replay script"
    ).unwrap();

    /// Replay speed multiplier.
    pub static ref REPLAY_SPEED: Gauge = register_gauge!(
        "pulsemeter_replay_speed",
        "Replay speed multiplier"
    ).unwrap();
}

/// Advance `counter` to `total`; counters never move backwards
fn advance(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

/// Bring the registry up to date with the pipeline counters.
pub fn update_pipeline_metrics(snapshot: &StatsSnapshot) {
    advance(&PULSES_CAPTURED, snapshot.pulses_captured);
    advance(&PULSES_DROPPED, snapshot.pulses_dropped);
    DROP_RATE.set(snapshot.drop_rate());
    advance(&RECORDS_APPENDED, snapshot.records_appended);
    advance(&APPEND_FAILURES, snapshot.append_failures);
    advance(&LOCK_TIMEOUTS, snapshot.lock_timeouts);
    advance(&UPLOAD_CYCLES, snapshot.upload_cycles);
    advance(&UPLOADS_ACCEPTED, snapshot.uploads_accepted);
    advance(&UPLOADS_REJECTED, snapshot.uploads_rejected);
    advance(&TRANSPORT_FAILURES, snapshot.transport_failures);
    advance(&CORRUPT_CYCLES, snapshot.corrupt_cycles);
    advance(&RECORDS_UPLOADED, snapshot.records_uploaded);
    LAST_STATUS.set(snapshot.last_status as i64);
}

/// Count one replayed pulse.
#[cfg(feature = "replay")]
pub fn record_replay_pulse(meter: &str) {
    REPLAY_PULSES_TOTAL.with_label_values(&[meter]).inc();
}

/// Update replay position metrics.
#[cfg(feature = "replay")]
pub fn update_replay_metrics(position: usize, total: usize, speed: f64) {
    REPLAY_POSITION.set(position as i64);
    REPLAY_TOTAL_EVENTS.set(total as i64);
    REPLAY_SPEED.set(speed);
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
