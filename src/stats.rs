// Pulsemeter - Pulse capture and acknowledged upload
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Pipeline counters
//!
//! Plain atomics so that edge handlers can record captures and drops
//! without locking, formatting, or I/O.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Shared counters for every pipeline component
#[derive(Debug, Default)]
pub struct PipelineStats {
    pulses_captured: AtomicU64,
    pulses_dropped: AtomicU64,
    records_appended: AtomicU64,
    append_failures: AtomicU64,
    lock_timeouts: AtomicU64,
    upload_cycles: AtomicU64,
    uploads_accepted: AtomicU64,
    uploads_rejected: AtomicU64,
    transport_failures: AtomicU64,
    corrupt_cycles: AtomicU64,
    records_uploaded: AtomicU64,
    last_status: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Edges that reached the queue
    pub pulses_captured: u64,
    /// Edges lost to queue overflow
    pub pulses_dropped: u64,
    /// Records durably appended to the ledger
    pub records_appended: u64,
    /// Appends that failed on the medium
    pub append_failures: u64,
    /// Coordinator acquisitions that timed out
    pub lock_timeouts: u64,
    /// Upload cycles started
    pub upload_cycles: u64,
    /// Uploads answered with the success status
    pub uploads_accepted: u64,
    /// Uploads answered with any other status
    pub uploads_rejected: u64,
    /// Uploads that never got a status
    pub transport_failures: u64,
    /// Upload cycles abandoned on a corrupt ledger
    pub corrupt_cycles: u64,
    /// Records cleared from the ledger after acceptance
    pub records_uploaded: u64,
    /// Last HTTP status seen (0 before the first response)
    pub last_status: u64,
}

impl PipelineStats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_capture(&self) {
        self.pulses_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_drop(&self) {
        self.pulses_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_append(&self) {
        self.records_appended.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_append_failure(&self) {
        self.append_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_lock_timeout(&self) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_upload_cycle(&self) {
        self.upload_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_status(&self, status: u16, accepted: bool, records: usize) {
        self.last_status.store(status as u64, Ordering::Relaxed);
        if accepted {
            self.uploads_accepted.fetch_add(1, Ordering::Relaxed);
            self.records_uploaded
                .fetch_add(records as u64, Ordering::Relaxed);
        } else {
            self.uploads_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_transport_failure(&self) {
        self.transport_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_corrupt_cycle(&self) {
        self.corrupt_cycles.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            pulses_captured: self.pulses_captured.load(Ordering::Relaxed),
            pulses_dropped: self.pulses_dropped.load(Ordering::Relaxed),
            records_appended: self.records_appended.load(Ordering::Relaxed),
            append_failures: self.append_failures.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            upload_cycles: self.upload_cycles.load(Ordering::Relaxed),
            uploads_accepted: self.uploads_accepted.load(Ordering::Relaxed),
            uploads_rejected: self.uploads_rejected.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
            corrupt_cycles: self.corrupt_cycles.load(Ordering::Relaxed),
            records_uploaded: self.records_uploaded.load(Ordering::Relaxed),
            last_status: self.last_status.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    /// Fraction of captured-or-dropped edges that were dropped (0.0-1.0)
    pub fn drop_rate(&self) -> f64 {
        let total = self.pulses_captured + self.pulses_dropped;
        if total == 0 {
            return 0.0;
        }
        self.pulses_dropped as f64 / total as f64
    }
}
