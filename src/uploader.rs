// Pulsemeter - Pulse capture and acknowledged upload
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Batch uploader task
//!
//! Every interval: take the ledger, send everything pending as one batch,
//! and clear the ledger only when the collector answers with the success
//! status. The ledger stays held from the read until after the reset, so a
//! record appended meanwhile can never be wiped without having been sent.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::time::MissedTickBehavior;

use crate::collector::Collector;
use crate::coordinator::{offload, AccessCoordinator};
use crate::medium::Medium;
use crate::payload;
use crate::stats::PipelineStats;

/// What one upload cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing pending; no request sent
    Empty,
    /// Collector accepted the batch and the ledger was cleared
    Accepted {
        /// Records in the batch
        records: usize,
    },
    /// Collector answered with another status; ledger untouched
    Rejected {
        /// Status received
        status: u16,
    },
    /// No status arrived (connection failure or timeout); ledger untouched
    TransportFailed,
    /// Collector accepted but clearing the ledger failed; the batch will be
    /// sent again
    ResetFailed {
        /// Records in the batch
        records: usize,
    },
    /// Ledger content unreadable as records; no request sent
    Corrupt,
    /// Ledger could not be acquired or read
    StorageUnavailable,
}

impl CycleOutcome {
    /// Whether the ledger was cleared
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Periodic sender of the whole ledger
pub struct BatchUploader<M: Medium, C: Collector> {
    coordinator: AccessCoordinator<M>,
    collector: C,
    url: String,
    success_status: u16,
    stats: Arc<PipelineStats>,
    interval: Duration,
    start_delay: Duration,
}

impl<M: Medium, C: Collector> BatchUploader<M, C> {
    /// Create an uploader expecting 201, every 10 s, with no start delay
    pub fn new(
        coordinator: AccessCoordinator<M>,
        collector: C,
        url: impl Into<String>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            coordinator,
            collector,
            url: url.into(),
            success_status: 201,
            stats,
            interval: Duration::from_secs(10),
            start_delay: Duration::ZERO,
        }
    }

    /// Set the status that counts as acceptance
    pub fn with_success_status(mut self, status: u16) -> Self {
        self.success_status = status;
        self
    }

    /// Set the cycle interval and the delay before the first cycle
    pub fn with_timing(mut self, interval: Duration, start_delay: Duration) -> Self {
        self.interval = interval;
        self.start_delay = start_delay;
        self
    }

    /// Run one upload cycle
    pub async fn cycle(&self) -> CycleOutcome {
        self.stats.record_upload_cycle();

        let ledger = match self.coordinator.acquire_owned().await {
            Ok(guard) => guard,
            Err(e) => {
                self.stats.record_lock_timeout();
                warn!("Upload skipped, ledger not acquired: {}", e);
                return CycleOutcome::StorageUnavailable;
            }
        };

        let (ledger, read) = match offload(ledger, |l| l.read_all()).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Upload skipped, ledger unreadable: {}", e);
                return CycleOutcome::StorageUnavailable;
            }
        };
        let records = match read {
            Ok(records) => records,
            Err(e) if e.is_corrupt() => {
                self.stats.record_corrupt_cycle();
                error!("Upload abandoned, {}: {}", ledger.medium().describe(), e);
                return CycleOutcome::Corrupt;
            }
            Err(e) => {
                warn!("Upload skipped, ledger unreadable: {}", e);
                return CycleOutcome::StorageUnavailable;
            }
        };

        if records.is_empty() {
            debug!("Nothing to upload");
            return CycleOutcome::Empty;
        }

        let body = match payload::encode(&records) {
            Ok(body) => body,
            Err(e) => {
                self.stats.record_transport_failure();
                error!("Payload encoding failed: {}", e);
                return CycleOutcome::TransportFailed;
            }
        };

        let count = records.len();
        match self.collector.post(&self.url, body).await {
            Ok(status) if status == self.success_status => {
                self.stats.record_status(status, true, count);
                let reset = offload(ledger, |l| l.reset_to_empty())
                    .await
                    .and_then(|(_released, result)| result);
                match reset {
                    Ok(()) => {
                        info!("Uploaded {} records to {}", count, self.url);
                        CycleOutcome::Accepted { records: count }
                    }
                    Err(e) => {
                        warn!(
                            "Collector accepted {} records but the ledger was not cleared, \
                             they will be sent again: {}",
                            count, e
                        );
                        CycleOutcome::ResetFailed { records: count }
                    }
                }
            }
            Ok(status) => {
                self.stats.record_status(status, false, count);
                warn!(
                    "Collector answered {} (expected {}), keeping {} records",
                    status, self.success_status, count
                );
                CycleOutcome::Rejected { status }
            }
            Err(e) => {
                self.stats.record_transport_failure();
                warn!("Upload to {} failed, keeping {} records: {}", self.url, count, e);
                CycleOutcome::TransportFailed
            }
        }
    }

    /// Loop forever: wait the start delay, then run a cycle every interval
    pub async fn run(self) {
        tokio::time::sleep(self.start_delay).await;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.cycle().await;
        }
    }

    /// Collector endpoint
    pub fn url(&self) -> &str {
        &self.url
    }
}
