// Pulsemeter - Pulse capture and acknowledged upload
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Edge event source
//!
//! One [`EdgeHandler`] per monitored input. A handler is what an interrupt
//! line (or a GPIO sampling loop) calls into: it pushes its meter identity
//! onto the event queue and returns. Handlers touch nothing but the
//! lock-free queue and atomic counters: no I/O, no locks, no logging.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{ChannelConfig, Edge};
use crate::error::MeterError;
use crate::meter::MeterId;
use crate::queue::EventProducer;
use crate::stats::PipelineStats;

/// Pulse entry point for a single input
pub struct EdgeHandler {
    meter_id: MeterId,
    edge: Edge,
    pin: Option<u8>,
    level: AtomicBool,
    producer: EventProducer,
    stats: Arc<PipelineStats>,
}

impl EdgeHandler {
    /// Create a handler for one input
    pub fn new(
        meter_id: MeterId,
        edge: Edge,
        pin: Option<u8>,
        producer: EventProducer,
        stats: Arc<PipelineStats>,
    ) -> Self {
        // Idle level: low for rising-edge meters, high for pulled-up buttons.
        let idle = matches!(edge, Edge::Falling);
        Self {
            meter_id,
            edge,
            pin,
            level: AtomicBool::new(idle),
            producer,
            stats,
        }
    }

    /// Interrupt entry point: one pulse happened
    ///
    /// Returns `false` when the queue was full and a pulse was lost.
    pub fn on_edge(&self) -> bool {
        match self.producer.push(self.meter_id.clone()) {
            Ok(()) => {
                self.stats.record_capture();
                true
            }
            Err(_) => {
                self.stats.record_drop();
                false
            }
        }
    }

    /// Feed a sampled input level; fires [`on_edge`](Self::on_edge) on the
    /// configured transition
    ///
    /// Returns whether a transition was detected (even if its event was then
    /// dropped by a full queue).
    pub fn sample(&self, level: bool) -> bool {
        let previous = self.level.swap(level, Ordering::AcqRel);
        let fired = match self.edge {
            Edge::Rising => !previous && level,
            Edge::Falling => previous && !level,
        };
        if fired {
            self.on_edge();
        }
        fired
    }

    /// Identity this handler reports
    pub fn meter_id(&self) -> &MeterId {
        &self.meter_id
    }

    /// Transition this handler counts
    pub fn edge(&self) -> Edge {
        self.edge
    }

    /// Input pin, if configured
    pub fn pin(&self) -> Option<u8> {
        self.pin
    }
}

impl std::fmt::Debug for EdgeHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeHandler")
            .field("meter_id", &self.meter_id)
            .field("edge", &self.edge)
            .field("pin", &self.pin)
            .finish()
    }
}

/// All edge handlers of the process
#[derive(Debug, Clone)]
pub struct EdgeSource {
    handlers: Vec<Arc<EdgeHandler>>,
}

impl EdgeSource {
    /// Build one handler per channel
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - A meter identity is invalid or configured twice
    /// - More than `max_channels` channels are given
    pub fn new(
        channels: &[ChannelConfig],
        max_channels: usize,
        producer: &EventProducer,
        stats: &Arc<PipelineStats>,
    ) -> Result<Self, MeterError> {
        if channels.len() > max_channels {
            return Err(MeterError::MaxChannelsReached { max: max_channels });
        }

        let mut handlers: Vec<Arc<EdgeHandler>> = Vec::with_capacity(channels.len());
        for channel in channels {
            let meter_id = MeterId::new(&channel.meter_id)?;
            if handlers.iter().any(|h| h.meter_id == meter_id) {
                return Err(MeterError::Duplicate(channel.meter_id.clone()));
            }
            handlers.push(Arc::new(EdgeHandler::new(
                meter_id,
                channel.edge,
                channel.pin,
                producer.clone(),
                Arc::clone(stats),
            )));
        }

        Ok(Self { handlers })
    }

    /// Handler for a meter identity
    pub fn handler(&self, meter_id: &str) -> Option<Arc<EdgeHandler>> {
        self.handlers
            .iter()
            .find(|h| h.meter_id.as_str() == meter_id)
            .cloned()
    }

    /// Handler attached to a pin
    pub fn handler_for_pin(&self, pin: u8) -> Option<Arc<EdgeHandler>> {
        self.handlers.iter().find(|h| h.pin == Some(pin)).cloned()
    }

    /// All handlers in configuration order
    pub fn handlers(&self) -> &[Arc<EdgeHandler>] {
        &self.handlers
    }

    /// Number of monitored inputs
    pub fn count(&self) -> usize {
        self.handlers.len()
    }

    /// Check if there are no inputs
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
