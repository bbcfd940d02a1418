//! # Pulsemeter - Pulse capture and acknowledged upload
//!
//! Counts pulses from energy meters, stores each one durably, and ships them
//! to a remote collector in batches. A record leaves local storage only after
//! the collector has acknowledged it.
//!
//! ## Data Flow
//!
//! ```text
//! edge handlers --push--> EventQueue --pop--> LedgerWriter
//!  (lock-free)            (bounded)            (numbers + appends)
//!                                                   |
//!                                                   v
//!                                   AccessCoordinator[ Ledger ] (CSV)
//!                                                   ^
//!                                                   |
//!                              BatchUploader --POST JSON--> Collector
//!                              (reset only on the success status)
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use pulsemeter::{
//!     ChannelConfig, MemoryCollector, MemoryMedium, Pipeline, PipelineConfig,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> pulsemeter::Result<()> {
//! let config = PipelineConfig {
//!     channels: vec![ChannelConfig::rising("111", 13)],
//!     ..Default::default()
//! };
//! let pipeline = Pipeline::build(config, MemoryMedium::new()).await?;
//! let mut tasks = pipeline.into_tasks(MemoryCollector::new());
//!
//! // Interrupt side
//! tasks.source.handler("111").unwrap().on_edge();
//!
//! // Task side
//! tasks.writer.tick().await;
//! assert!(tasks.uploader.cycle().await.is_accepted());
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`source`]: Edge handlers, one per monitored input
//! - [`queue`]: Bounded lock-free event queue
//! - [`writer`]: Queue consumer that numbers and persists pulses
//! - [`ledger`]: Append-only CSV ledger on a [`medium`]
//! - [`coordinator`]: Exclusive access to the ledger
//! - [`uploader`]: Periodic batch upload with acknowledgment
//! - [`collector`]: Network transport abstraction
//! - [`pipeline`]: Assembly of all of the above

// Modules
pub mod collector;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod ledger;
pub mod medium;
pub mod meter;
pub mod payload;
pub mod pipeline;
pub mod queue;
pub mod recovery;
pub mod sequence;
pub mod source;
pub mod stats;
pub mod uploader;
pub mod writer;

// Re-exports for convenient access
#[cfg(feature = "http")]
pub use collector::HttpCollector;
pub use collector::{Collector, MemoryCollector, Reply};
pub use config::{ChannelConfig, Edge, PipelineConfig, TEST_BUTTON_METER_ID};
pub use coordinator::{offload, AccessCoordinator, LedgerGuard, OwnedLedgerGuard};
pub use error::{CollectorError, ConfigError, LedgerError, MeterError, PipelineError, Result};
pub use ledger::{parse_ledger, Ledger, LEDGER_HEADER};
pub use medium::{FileMedium, Medium, MemoryMedium};
pub use meter::{LedgerRecord, MeterId};
pub use pipeline::{Pipeline, PipelineTasks, RunningPipeline};
pub use queue::{Dropped, EventConsumer, EventProducer, EventQueue, OverflowPolicy};
pub use recovery::{with_retry_async, Attempted, Backoff};
pub use sequence::SequenceAccumulator;
pub use source::{EdgeHandler, EdgeSource};
pub use stats::{PipelineStats, StatsSnapshot};
pub use uploader::{BatchUploader, CycleOutcome};
pub use writer::{LedgerWriter, TickOutcome};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[tokio::test]
    async fn test_basic_flow() {
        let medium = MemoryMedium::new();
        let collector = MemoryCollector::new();
        let config = PipelineConfig {
            channels: vec![ChannelConfig::rising("111", 13)],
            ..Default::default()
        };
        let pipeline = Pipeline::build(config, medium.clone()).await.unwrap();
        let mut tasks = pipeline.into_tasks(collector.clone());

        assert!(tasks.source.handler("111").unwrap().on_edge());
        assert_eq!(tasks.writer.tick().await, TickOutcome::Appended(1));
        assert_eq!(
            tasks.uploader.cycle().await,
            CycleOutcome::Accepted { records: 1 }
        );

        let sent = payload::decode(&collector.received()[0].1).unwrap();
        assert_eq!(sent, vec![LedgerRecord::new(MeterId::new("111").unwrap(), 1)]);
        assert_eq!(medium.contents().unwrap(), b"EnergyMeterID,AccumulatedValue\n");
    }
}
