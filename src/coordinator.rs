// Pulsemeter - Pulse capture and acknowledged upload
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Access coordinator
//!
//! The single gate in front of the ledger. The writer and the uploader are
//! its only clients; whoever holds the guard owns the ledger exclusively,
//! including across the uploader's network call.
//!
//! Medium calls can block (fsync on an SD card), so the tasks move an owned
//! guard onto the blocking pool with [`offload`] instead of touching the
//! ledger from a runtime worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};

use crate::error::LedgerError;
use crate::ledger::Ledger;
use crate::medium::Medium;

/// Exclusive access to the ledger while held
pub type LedgerGuard<'a, M> = MutexGuard<'a, Ledger<M>>;

/// Exclusive access that can move to another thread
pub type OwnedLedgerGuard<M> = OwnedMutexGuard<Ledger<M>>;

/// Mutual-exclusion gate owning the ledger
pub struct AccessCoordinator<M: Medium> {
    ledger: Arc<Mutex<Ledger<M>>>,
    timeout: Option<Duration>,
}

impl<M: Medium> AccessCoordinator<M> {
    /// Take ownership of the ledger; acquisitions wait indefinitely
    pub fn new(ledger: Ledger<M>) -> Self {
        Self {
            ledger: Arc::new(Mutex::new(ledger)),
            timeout: None,
        }
    }

    /// Bound every acquisition by `timeout`
    pub fn with_timeout(ledger: Ledger<M>, timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            ..Self::new(ledger)
        }
    }

    /// Wait for exclusive access
    ///
    /// With a timeout configured, expiry is reported as
    /// [`LedgerError::Unavailable`]: the caller treats the ledger as
    /// inaccessible for this cycle.
    pub async fn acquire(&self) -> Result<LedgerGuard<'_, M>, LedgerError> {
        match self.timeout {
            None => Ok(self.ledger.lock().await),
            Some(limit) => tokio::time::timeout(limit, self.ledger.lock())
                .await
                .map_err(|_| LedgerError::Unavailable {
                    reason: format!("ledger lock not acquired within {:?}", limit),
                }),
        }
    }

    /// Like [`acquire`](Self::acquire), with a guard that is not tied to
    /// `self`
    pub async fn acquire_owned(&self) -> Result<OwnedLedgerGuard<M>, LedgerError> {
        let lock = Arc::clone(&self.ledger).lock_owned();
        match self.timeout {
            None => Ok(lock.await),
            Some(limit) => tokio::time::timeout(limit, lock)
                .await
                .map_err(|_| LedgerError::Unavailable {
                    reason: format!("ledger lock not acquired within {:?}", limit),
                }),
        }
    }

    /// Configured acquisition bound
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Run `op` on the blocking pool while keeping the ledger held
///
/// The guard comes back with the result so the caller can continue under the
/// same lock. If `op` panics the guard is released and the failure is
/// reported as [`LedgerError::Unavailable`].
pub async fn offload<M, T, F>(
    mut guard: OwnedLedgerGuard<M>,
    op: F,
) -> Result<(OwnedLedgerGuard<M>, T), LedgerError>
where
    M: Medium,
    T: Send + 'static,
    F: FnOnce(&mut Ledger<M>) -> T + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let out = op(&mut guard);
        (guard, out)
    })
    .await
    .map_err(|e| LedgerError::Unavailable {
        reason: format!("ledger task failed: {}", e),
    })
}

impl<M: Medium> Clone for AccessCoordinator<M> {
    fn clone(&self) -> Self {
        Self {
            ledger: Arc::clone(&self.ledger),
            timeout: self.timeout,
        }
    }
}

impl<M: Medium> std::fmt::Debug for AccessCoordinator<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessCoordinator")
            .field("timeout", &self.timeout)
            .field("clients", &Arc::strong_count(&self.ledger))
            .finish()
    }
}
