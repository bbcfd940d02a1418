// Pulsemeter - Pulse capture and acknowledged upload
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Meter identities and ledger records

use std::fmt;
use std::sync::Arc;

use crate::error::MeterError;

/// Characters the ledger table cannot carry inside a field
const FORBIDDEN: [char; 4] = [',', '"', '\r', '\n'];

/// Stable identity of one pulse-emitting channel
///
/// Cloning only bumps a reference count, so edge handlers can hand out
/// identities without allocating.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeterId(Arc<str>);

impl MeterId {
    /// Validate and create an identity
    pub fn new(id: impl AsRef<str>) -> Result<Self, MeterError> {
        let id = id.as_ref();
        if id.is_empty() {
            return Err(MeterError::Empty);
        }
        if let Some(ch) = id.chars().find(|c| FORBIDDEN.contains(c)) {
            return Err(MeterError::ForbiddenCharacter {
                id: id.to_string(),
                ch,
            });
        }
        Ok(Self(Arc::from(id)))
    }

    /// The identity as text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for MeterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MeterId({:?})", &*self.0)
    }
}

impl fmt::Display for MeterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for MeterId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for MeterId {
    type Error = MeterError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// One persisted pulse: which meter, and the accumulated value it was given
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRecord {
    /// Meter that produced the pulse
    pub meter_id: MeterId,
    /// Sequence value assigned when the record was created
    pub sequence: u64,
}

impl LedgerRecord {
    /// Create a record
    pub fn new(meter_id: MeterId, sequence: u64) -> Self {
        Self { meter_id, sequence }
    }
}
