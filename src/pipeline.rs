// Pulsemeter - Pulse capture and acknowledged upload
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Pipeline assembly
//!
//! Everything the process needs is built here from a [`PipelineConfig`] and a
//! storage [`Medium`], then handed to its owner. There is no global state:
//! two pipelines in one process (as in the tests) never see each other.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::task::JoinHandle;

use crate::collector::Collector;
use crate::config::PipelineConfig;
use crate::coordinator::AccessCoordinator;
use crate::error::{LedgerError, PipelineError, Result};
use crate::ledger::Ledger;
use crate::medium::Medium;
use crate::queue::EventQueue;
use crate::recovery::with_retry_async;
use crate::sequence::SequenceAccumulator;
use crate::source::EdgeSource;
use crate::stats::PipelineStats;
use crate::uploader::BatchUploader;
use crate::writer::LedgerWriter;

/// A fully constructed, not yet running pipeline
pub struct Pipeline<M: Medium> {
    config: PipelineConfig,
    source: EdgeSource,
    writer: LedgerWriter<M>,
    coordinator: AccessCoordinator<M>,
    stats: Arc<PipelineStats>,
}

/// The parts of a pipeline, for callers that drive the tasks themselves
pub struct PipelineTasks<M: Medium, C: Collector> {
    /// Edge handlers for the interrupt side
    pub source: EdgeSource,
    /// Queue consumer and ledger appender
    pub writer: LedgerWriter<M>,
    /// Periodic batch sender
    pub uploader: BatchUploader<M, C>,
    /// Shared ledger gate
    pub coordinator: AccessCoordinator<M>,
    /// Shared counters
    pub stats: Arc<PipelineStats>,
}

impl<M: Medium> Pipeline<M> {
    /// Validate the configuration, bring the ledger up and wire everything
    ///
    /// Storage that is not ready is retried with the configured backoff.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::Config`] for an invalid configuration
    /// - [`PipelineError::StorageUnavailable`] when storage never came up
    /// - [`PipelineError::Ledger`] when the existing ledger is not a ledger
    pub async fn build(config: PipelineConfig, medium: M) -> Result<Self> {
        config.validate()?;

        let mut ledger = Ledger::new(medium);
        let backoff = config.storage_retry();
        // Only transient failures are retried; anything else ends the loop as Ok(Err).
        let brought_up = with_retry_async(
            &backoff,
            || {
                std::future::ready(match ledger.ensure_initialized() {
                    Ok(()) => Ok(Ok(())),
                    Err(e) if e.is_transient() => Err(e),
                    Err(e) => Ok(Err(e)),
                })
            },
            |e: &LedgerError, attempt| warn!("Storage not ready (attempt {}): {}", attempt, e),
        )
        .await;

        match brought_up {
            Ok(done) => {
                if let Err(e) = done.value {
                    error!("Ledger at {} rejected: {}", ledger.medium().describe(), e);
                    return Err(PipelineError::Ledger(e));
                }
            }
            Err(failed) => {
                error!(
                    "Storage unavailable after {} attempts: {}",
                    failed.attempts, failed.value
                );
                return Err(PipelineError::StorageUnavailable {
                    attempts: failed.attempts,
                    source: failed.value,
                });
            }
        }

        let sequence = if config.resume_from_ledger {
            let last = ledger.last_sequence()?.unwrap_or(0);
            info!("Resuming sequence after {}", last);
            SequenceAccumulator::resume_after(last)
        } else {
            SequenceAccumulator::new()
        };

        let stats = Arc::new(PipelineStats::new());
        let (producer, consumer) =
            EventQueue::bounded(config.queue_capacity, config.overflow_policy);
        let source = EdgeSource::new(&config.channels, config.max_channels, &producer, &stats)?;

        let coordinator = AccessCoordinator::with_timeout(ledger, config.lock_timeout());
        let writer = LedgerWriter::new(consumer, sequence, coordinator.clone(), Arc::clone(&stats))
            .with_timing(config.poll_interval(), config.writer_start_delay());

        info!(
            "Pipeline ready: {} channels, queue of {}, collector {}",
            source.count(),
            config.queue_capacity,
            config.collector_url
        );

        Ok(Self {
            config,
            source,
            writer,
            coordinator,
            stats,
        })
    }

    /// Split into parts, building the uploader around `collector`
    pub fn into_tasks<C: Collector>(self, collector: C) -> PipelineTasks<M, C> {
        let uploader = BatchUploader::new(
            self.coordinator.clone(),
            collector,
            self.config.collector_url.clone(),
            Arc::clone(&self.stats),
        )
        .with_success_status(self.config.success_status)
        .with_timing(
            self.config.upload_interval(),
            self.config.uploader_start_delay(),
        );

        PipelineTasks {
            source: self.source,
            writer: self.writer,
            uploader,
            coordinator: self.coordinator,
            stats: self.stats,
        }
    }

    /// Start the writer and uploader on the current tokio runtime
    pub fn spawn<C: Collector + 'static>(self, collector: C) -> RunningPipeline<M> {
        let tasks = self.into_tasks(collector);
        let writer = tokio::spawn(tasks.writer.run());
        let uploader = tokio::spawn(tasks.uploader.run());

        RunningPipeline {
            source: tasks.source,
            coordinator: tasks.coordinator,
            stats: tasks.stats,
            writer,
            uploader,
        }
    }

    /// Edge handlers
    pub fn source(&self) -> &EdgeSource {
        &self.source
    }

    /// Shared counters
    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// Configuration the pipeline was built from
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

/// Handle to a pipeline whose tasks are running
pub struct RunningPipeline<M: Medium> {
    source: EdgeSource,
    coordinator: AccessCoordinator<M>,
    stats: Arc<PipelineStats>,
    writer: JoinHandle<()>,
    uploader: JoinHandle<()>,
}

impl<M: Medium> RunningPipeline<M> {
    /// Edge handlers for the interrupt side
    pub fn source(&self) -> &EdgeSource {
        &self.source
    }

    /// Shared counters
    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// Shared ledger gate
    pub fn coordinator(&self) -> &AccessCoordinator<M> {
        &self.coordinator
    }

    /// Whether both tasks are still running
    pub fn is_running(&self) -> bool {
        !self.writer.is_finished() && !self.uploader.is_finished()
    }

    /// Stop both tasks
    ///
    /// A cycle cut short leaves the ledger as it was: records are only ever
    /// removed by a completed reset.
    pub async fn shutdown(self) {
        self.writer.abort();
        self.uploader.abort();
        let _ = self.writer.await;
        let _ = self.uploader.await;
        info!("Pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::MemoryCollector;
    use crate::config::ChannelConfig;
    use crate::error::ConfigError;
    use crate::medium::MemoryMedium;
    use std::time::Duration;

    fn config() -> PipelineConfig {
        PipelineConfig {
            channels: vec![ChannelConfig::rising("111", 13), ChannelConfig::rising("222", 16)],
            writer_start_delay_ms: 0,
            uploader_start_delay_ms: 0,
            storage_retries: 2,
            storage_retry_delay_ms: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_build_initializes_ledger() {
        let medium = MemoryMedium::new();
        let pipeline = Pipeline::build(config(), medium.clone()).await.unwrap();
        assert_eq!(pipeline.source().count(), 2);
        assert_eq!(
            medium.contents().unwrap(),
            b"EnergyMeterID,AccumulatedValue\n"
        );
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let bad = PipelineConfig {
            channels: vec![],
            ..config()
        };
        let result = Pipeline::build(bad, MemoryMedium::new()).await;
        assert!(matches!(
            result,
            Err(PipelineError::Config(ConfigError::NoChannels))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_never_ready() {
        let medium = MemoryMedium::new();
        medium.set_available(false);
        let result = Pipeline::build(config(), medium).await;
        assert!(matches!(
            result,
            Err(PipelineError::StorageUnavailable { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_wrong_header_not_retried() {
        let medium = MemoryMedium::with_contents(b"id,value\n".to_vec());
        let result = Pipeline::build(config(), medium).await;
        assert!(matches!(result, Err(PipelineError::Ledger(e)) if e.is_corrupt()));
    }

    #[tokio::test]
    async fn test_resume_from_ledger() {
        let medium = MemoryMedium::with_contents(
            b"EnergyMeterID,AccumulatedValue\n111,41\n222,42\n".to_vec(),
        );
        let cfg = PipelineConfig {
            resume_from_ledger: true,
            ..config()
        };
        let pipeline = Pipeline::build(cfg, medium).await.unwrap();
        let mut tasks = pipeline.into_tasks(MemoryCollector::new());

        tasks.source.handler("111").unwrap().on_edge();
        tasks.writer.tick().await;
        assert_eq!(tasks.writer.last_sequence(), 43);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_pipeline_uploads() {
        let medium = MemoryMedium::new();
        let collector = MemoryCollector::new();
        let pipeline = Pipeline::build(config(), medium.clone()).await.unwrap();
        let running = pipeline.spawn(collector.clone());

        running.source().handler("111").unwrap().on_edge();
        running.source().handler("222").unwrap().on_edge();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(running.stats().snapshot().records_appended, 2);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(collector.request_count(), 1);
        assert!(running.is_running());

        running.shutdown().await;
        assert_eq!(
            medium.contents().unwrap(),
            b"EnergyMeterID,AccumulatedValue\n"
        );
    }
}
