// Pulsemeter - Pulse capture and acknowledged upload
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Bounded event queue between edge handlers and the ledger writer
//!
//! Producers push from edge context and never block. The single consumer
//! polls from task context. The buffer is a fixed-size lock-free ring, so a
//! push never allocates and never grows.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use serde::{Deserialize, Serialize};

use crate::meter::MeterId;

/// What to do when a push finds the queue full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Reject the incoming event
    #[default]
    DropNewest,
    /// Evict the oldest queued event to make room
    OverwriteOldest,
}

/// An event was lost on push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dropped(pub MeterId);

struct Shared {
    ring: ArrayQueue<MeterId>,
    policy: OverflowPolicy,
    dropped: AtomicU64,
}

/// Constructor namespace for the producer/consumer pair
pub struct EventQueue;

impl EventQueue {
    /// Create a queue holding at most `capacity` events
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero. `PipelineConfig::validate` rejects that
    /// before it gets here.
    pub fn bounded(capacity: usize, policy: OverflowPolicy) -> (EventProducer, EventConsumer) {
        let shared = Arc::new(Shared {
            ring: ArrayQueue::new(capacity),
            policy,
            dropped: AtomicU64::new(0),
        });
        (
            EventProducer {
                shared: Arc::clone(&shared),
            },
            EventConsumer { shared },
        )
    }
}

/// Edge-side handle; clone one per handler
#[derive(Clone)]
pub struct EventProducer {
    shared: Arc<Shared>,
}

impl EventProducer {
    /// Enqueue an identity without blocking
    ///
    /// Returns the lost event on overflow: the rejected one under
    /// [`OverflowPolicy::DropNewest`], the evicted one under
    /// [`OverflowPolicy::OverwriteOldest`].
    pub fn push(&self, id: MeterId) -> Result<(), Dropped> {
        let lost = match self.shared.policy {
            OverflowPolicy::DropNewest => self.shared.ring.push(id).err(),
            OverflowPolicy::OverwriteOldest => self.shared.ring.force_push(id),
        };
        match lost {
            None => Ok(()),
            Some(id) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                Err(Dropped(id))
            }
        }
    }

    /// Events lost to overflow so far
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.shared.ring.capacity()
    }
}

/// Task-side handle; there is exactly one
pub struct EventConsumer {
    shared: Arc<Shared>,
}

impl EventConsumer {
    /// Take the oldest event, or `None` if the queue is empty
    pub fn pop(&self) -> Option<MeterId> {
        self.shared.ring.pop()
    }

    /// Number of queued events
    pub fn len(&self) -> usize {
        self.shared.ring.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.shared.ring.is_empty()
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.shared.ring.capacity()
    }

    /// Events lost to overflow so far
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for EventConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventConsumer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("policy", &self.shared.policy)
            .finish()
    }
}
