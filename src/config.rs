// Pulsemeter - Pulse capture and acknowledged upload
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Configuration types for the pulse pipeline
//!
//! Defaults reproduce the field deployment: four meters on rising edges, a
//! test button on a falling edge, a 20-slot queue, 20 ms writer polling and
//! a 10 s upload cycle.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, MeterError};
use crate::meter::MeterId;
use crate::queue::OverflowPolicy;
use crate::recovery::Backoff;

/// Identity of the on-board test button channel
pub const TEST_BUTTON_METER_ID: &str = "CCC6C8C4-B9DB-4C8D-39D8-08DBEF4C21FB";

/// Signal transition that counts as a pulse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    /// Low to high
    #[default]
    Rising,
    /// High to low
    Falling,
}

/// One monitored input
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChannelConfig {
    /// Identity written to the ledger for every pulse on this input
    pub meter_id: String,

    /// Input pin number, informational
    #[serde(default)]
    pub pin: Option<u8>,

    /// Transition that counts as a pulse
    #[serde(default)]
    pub edge: Edge,
}

impl ChannelConfig {
    /// Channel counting rising edges
    pub fn rising(meter_id: impl Into<String>, pin: u8) -> Self {
        Self {
            meter_id: meter_id.into(),
            pin: Some(pin),
            edge: Edge::Rising,
        }
    }

    /// Channel counting falling edges
    pub fn falling(meter_id: impl Into<String>, pin: u8) -> Self {
        Self {
            meter_id: meter_id.into(),
            pin: Some(pin),
            edge: Edge::Falling,
        }
    }
}

/// Pipeline-level configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Monitored inputs
    pub channels: Vec<ChannelConfig>,

    /// Maximum number of channels
    pub max_channels: usize,

    /// Collector endpoint receiving batch payloads
    pub collector_url: String,

    /// The one status code that means "accepted"
    pub success_status: u16,

    /// Event queue slots
    pub queue_capacity: usize,

    /// What a full queue does with a new event
    pub overflow_policy: OverflowPolicy,

    /// Ledger file location
    pub ledger_path: PathBuf,

    /// Writer polling interval
    pub poll_interval_ms: u64,

    /// Delay before the writer's first poll
    pub writer_start_delay_ms: u64,

    /// Upload cycle interval
    pub upload_interval_ms: u64,

    /// Delay before the first upload cycle
    pub uploader_start_delay_ms: u64,

    /// Collector request timeout
    pub request_timeout_ms: u64,

    /// Bound on ledger lock acquisition (none = wait indefinitely)
    pub lock_timeout_ms: Option<u64>,

    /// Continue numbering after the highest value still in the ledger
    pub resume_from_ledger: bool,

    /// Storage bring-up attempts before giving up
    pub storage_retries: u32,

    /// First delay between storage bring-up attempts (doubles each time)
    pub storage_retry_delay_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channels: vec![
                ChannelConfig::rising("111", 13),
                ChannelConfig::rising("222", 16),
                ChannelConfig::rising("333", 32),
                ChannelConfig::rising("444", 33),
                ChannelConfig::falling(TEST_BUTTON_METER_ID, 34),
            ],
            max_channels: 32,
            collector_url: "http://192.168.21.7:2050/api/EnergyData".to_string(),
            success_status: 201,
            queue_capacity: 20,
            overflow_policy: OverflowPolicy::DropNewest,
            ledger_path: PathBuf::from("EnergyData.csv"),
            poll_interval_ms: 20,
            writer_start_delay_ms: 500,
            upload_interval_ms: 10_000,
            uploader_start_delay_ms: 10_000,
            request_timeout_ms: 5_000,
            lock_timeout_ms: None,
            resume_from_ledger: false,
            storage_retries: 5,
            storage_retry_delay_ms: 1_000,
        }
    }
}

impl PipelineConfig {
    /// Parse from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from a JSON file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json(&text)
    }

    /// Check every field and channel
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.meter_ids()?;

        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity", "must be at least 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms", "must be positive"));
        }
        if self.upload_interval_ms == 0 {
            return Err(invalid("upload_interval_ms", "must be positive"));
        }
        if self.request_timeout_ms == 0 {
            return Err(invalid("request_timeout_ms", "must be positive"));
        }
        if !(200..300).contains(&self.success_status) {
            return Err(invalid(
                "success_status",
                format!("{} is not a 2xx status", self.success_status),
            ));
        }
        if self.collector_url.trim().is_empty() {
            return Err(invalid("collector_url", "must not be empty"));
        }
        if self.ledger_path.as_os_str().is_empty() {
            return Err(invalid("ledger_path", "must not be empty"));
        }
        Ok(())
    }

    /// Validated identities in channel order
    pub fn meter_ids(&self) -> Result<Vec<MeterId>, ConfigError> {
        if self.channels.is_empty() {
            return Err(ConfigError::NoChannels);
        }
        if self.channels.len() > self.max_channels {
            return Err(MeterError::MaxChannelsReached {
                max: self.max_channels,
            }
            .into());
        }

        let mut seen = HashSet::new();
        self.channels
            .iter()
            .map(|c| -> Result<MeterId, ConfigError> {
                let id = MeterId::new(&c.meter_id)?;
                if !seen.insert(id.clone()) {
                    return Err(MeterError::Duplicate(c.meter_id.clone()).into());
                }
                Ok(id)
            })
            .collect()
    }

    /// Writer polling interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Delay before the writer starts
    pub fn writer_start_delay(&self) -> Duration {
        Duration::from_millis(self.writer_start_delay_ms)
    }

    /// Upload cycle interval
    pub fn upload_interval(&self) -> Duration {
        Duration::from_millis(self.upload_interval_ms)
    }

    /// Delay before the uploader starts
    pub fn uploader_start_delay(&self) -> Duration {
        Duration::from_millis(self.uploader_start_delay_ms)
    }

    /// Collector request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Ledger lock bound
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    /// Backoff used while bringing storage up
    pub fn storage_retry(&self) -> Backoff {
        Backoff::exponential(
            self.storage_retries,
            Duration::from_millis(self.storage_retry_delay_ms),
        )
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}
