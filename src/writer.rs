// Pulsemeter - Pulse capture and acknowledged upload
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Ledger writer task
//!
//! Drains the event queue, numbers each pulse and appends it to the ledger.
//! The coordinator is acquired per record and released right after the
//! append, so the lock is never held while polling the queue. The append
//! itself runs on the blocking pool.

use std::sync::Arc;
use std::time::Duration;

use log::warn;
use tokio::time::MissedTickBehavior;

use crate::coordinator::{offload, AccessCoordinator};
use crate::medium::Medium;
use crate::meter::{LedgerRecord, MeterId};
use crate::queue::EventConsumer;
use crate::sequence::SequenceAccumulator;
use crate::stats::PipelineStats;

/// What one writer tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing queued and nothing held back
    Idle,
    /// Every available event was appended
    Appended(usize),
    /// The coordinator could not be acquired in time; the tick stopped
    LockTimeout {
        /// Records appended before the timeout
        appended: usize,
    },
    /// Storage refused an append; the numbered record is held for the next tick
    StorageUnavailable {
        /// Records appended before the failure
        appended: usize,
    },
}

impl TickOutcome {
    /// Records appended during the tick
    pub fn appended(&self) -> usize {
        match *self {
            Self::Idle => 0,
            Self::Appended(n)
            | Self::LockTimeout { appended: n }
            | Self::StorageUnavailable { appended: n } => n,
        }
    }
}

enum Next {
    Held(LedgerRecord),
    Fresh(MeterId),
}

/// Single consumer of the event queue and sole owner of the sequence
pub struct LedgerWriter<M: Medium> {
    consumer: EventConsumer,
    sequence: SequenceAccumulator,
    coordinator: AccessCoordinator<M>,
    stats: Arc<PipelineStats>,
    held: Option<LedgerRecord>,
    poll_interval: Duration,
    start_delay: Duration,
}

impl<M: Medium> LedgerWriter<M> {
    /// Create a writer; timing defaults to no start delay and a 20 ms poll
    pub fn new(
        consumer: EventConsumer,
        sequence: SequenceAccumulator,
        coordinator: AccessCoordinator<M>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            consumer,
            sequence,
            coordinator,
            stats,
            held: None,
            poll_interval: Duration::from_millis(20),
            start_delay: Duration::ZERO,
        }
    }

    /// Set the poll interval and the delay before the first poll
    pub fn with_timing(mut self, poll_interval: Duration, start_delay: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.start_delay = start_delay;
        self
    }

    /// Run one iteration: append every event available right now
    ///
    /// A record that failed to append on an earlier tick goes first, with the
    /// value it was given then. Fresh events get their value only once the
    /// ledger is held, so a lock timeout loses the event without burning a
    /// value.
    pub async fn tick(&mut self) -> TickOutcome {
        let mut appended = 0;
        // Cap fresh pops at one queue's worth so a busy input cannot pin the task.
        let mut budget = self.consumer.capacity();

        loop {
            let next = match self.held.take() {
                Some(record) => Next::Held(record),
                None if budget == 0 => break,
                None => match self.consumer.pop() {
                    Some(id) => {
                        budget -= 1;
                        Next::Fresh(id)
                    }
                    None => break,
                },
            };

            let ledger = match self.coordinator.acquire_owned().await {
                Ok(guard) => guard,
                Err(e) => {
                    self.stats.record_lock_timeout();
                    match next {
                        Next::Held(record) => {
                            warn!(
                                "Ledger busy, keeping {},{} for the next tick: {}",
                                record.meter_id, record.sequence, e
                            );
                            self.held = Some(record);
                        }
                        Next::Fresh(id) => warn!("Pulse from meter {} lost: {}", id, e),
                    }
                    return TickOutcome::LockTimeout { appended };
                }
            };

            let record = match next {
                Next::Held(record) => record,
                Next::Fresh(id) => LedgerRecord::new(id, self.sequence.next()),
            };

            let appending = record.clone();
            let result = offload(ledger, move |l| l.append(&appending))
                .await
                .and_then(|(_released, result)| result);

            match result {
                Ok(()) => {
                    self.stats.record_append();
                    appended += 1;
                }
                Err(e) => {
                    warn!(
                        "Append of {},{} failed, retrying next tick: {}",
                        record.meter_id, record.sequence, e
                    );
                    self.stats.record_append_failure();
                    self.held = Some(record);
                    return TickOutcome::StorageUnavailable { appended };
                }
            }
        }

        if appended == 0 {
            TickOutcome::Idle
        } else {
            TickOutcome::Appended(appended)
        }
    }

    /// Loop forever: wait the start delay, then tick every poll interval
    pub async fn run(mut self) {
        tokio::time::sleep(self.start_delay).await;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// Record waiting for storage to come back, if any
    pub fn held(&self) -> Option<&LedgerRecord> {
        self.held.as_ref()
    }

    /// Last sequence value issued
    pub fn last_sequence(&self) -> u64 {
        self.sequence.last()
    }
}
